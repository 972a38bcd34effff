use crate::models::{AssembledBook, ImagePayload};
use anyhow::{Context, Result, anyhow};
use epub_builder::{EpubBuilder, EpubContent, ReferenceType, ZipLibrary};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use zip::CompressionMethod;
use zip::write::FileOptions;

#[derive(Debug, Clone)]
pub struct ExportedFiles {
    pub epub: PathBuf,
    pub archive: PathBuf,
}

/// Write the EPUB and the page archive for `book` under `output_dir`.
pub async fn write_exports(book: &AssembledBook, book_id: &str, output_dir: &Path) -> Result<ExportedFiles> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let epub = output_dir.join(format!("{}.epub", book_id));
    let archive = output_dir.join(format!("{}.zip", book_id));

    tokio::fs::write(&epub, build_epub(book)?)
        .await
        .with_context(|| format!("Failed to write {}", epub.display()))?;
    tokio::fs::write(&archive, build_page_archive(book)?)
        .await
        .with_context(|| format!("Failed to write {}", archive.display()))?;

    info!("Exported book {} to {}", book_id, output_dir.display());
    Ok(ExportedFiles { epub, archive })
}

fn epub_error<E: std::fmt::Display>(err: E) -> anyhow::Error {
    anyhow!("EPUB generation failed: {}", err)
}

fn page_image_name(page_number: u32, image: &ImagePayload) -> String {
    format!("page_{:03}.{}", page_number, image.extension())
}

fn page_xhtml(title: &str, label: &str, image_path: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head><title>{title}</title></head>
<body>
<div style="text-align:center;margin:0;padding:0">
<img src="{src}" alt="{alt}" style="max-width:100%;max-height:100%" />
</div>
</body>
</html>"#,
        title = html_escape::encode_text(title),
        src = html_escape::encode_double_quoted_attribute(image_path),
        alt = html_escape::encode_double_quoted_attribute(label),
    )
}

/// Render the book as a fixed sequence of full-page images.
pub fn build_epub(book: &AssembledBook) -> Result<Vec<u8>> {
    let metadata = &book.metadata;
    let mut builder = EpubBuilder::new(ZipLibrary::new().map_err(epub_error)?).map_err(epub_error)?;
    builder
        .metadata("title", metadata.title.as_str())
        .map_err(epub_error)?;
    builder
        .metadata("author", format!("Personalized for {}", metadata.child_name))
        .map_err(epub_error)?;
    builder
        .metadata("generator", "storybook")
        .map_err(epub_error)?;

    if let Some(cover) = &book.cover {
        let cover_path = format!("images/cover.{}", cover.extension());
        builder
            .add_cover_image(&cover_path, cover.data.as_slice(), cover.mime_type.as_str())
            .map_err(epub_error)?;
        let xhtml = page_xhtml(&metadata.title, "Cover", &cover_path);
        builder
            .add_content(
                EpubContent::new("cover.xhtml", xhtml.as_bytes())
                    .title("Cover")
                    .reftype(ReferenceType::Cover),
            )
            .map_err(epub_error)?;
    }

    for page in &book.pages {
        let image_path = format!("images/{}", page_image_name(page.page_number, &page.processed_image));
        builder
            .add_resource(
                &image_path,
                page.processed_image.data.as_slice(),
                page.processed_image.mime_type.as_str(),
            )
            .map_err(epub_error)?;

        let label = format!("Page {}", page.page_number);
        let xhtml = page_xhtml(&format!("{} - {}", metadata.title, label), &label, &image_path);
        builder
            .add_content(
                EpubContent::new(format!("page_{:03}.xhtml", page.page_number), xhtml.as_bytes())
                    .title(label.as_str())
                    .reftype(ReferenceType::Text),
            )
            .map_err(epub_error)?;
    }

    let mut output = Vec::new();
    builder.generate(&mut output).map_err(epub_error)?;
    Ok(output)
}

/// Zip of every page image plus `book.json` with the run summary.
pub fn build_page_archive(book: &AssembledBook) -> Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let stored = FileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = FileOptions::default().compression_method(CompressionMethod::Deflated);

    writer.start_file("book.json", deflated)?;
    writer.write_all(&serde_json::to_vec_pretty(book)?)?;

    if let Some(cover) = &book.cover {
        writer.start_file(format!("cover.{}", cover.extension()), stored)?;
        writer.write_all(&cover.data)?;
    }

    for page in &book.pages {
        writer.start_file(page_image_name(page.page_number, &page.processed_image), stored)?;
        writer.write_all(&page.processed_image.data)?;
    }

    let cursor = writer.finish().context("Failed to finish page archive")?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CoverReport, PageRecord, ProcessedPageResult};
    use crate::services::assembler::assemble_book;
    use crate::services::cover::CoverResult;
    use std::io::Read;

    fn sample_book(with_cover: bool) -> AssembledBook {
        let results: Vec<ProcessedPageResult> = (1..=2)
            .map(|n| {
                let page = PageRecord {
                    page_number: n,
                    image: ImagePayload::new("image/jpeg", vec![0xFF, 0xD8, 0xFF, n as u8]),
                };
                ProcessedPageResult::fallback(&page, "kept", 1)
            })
            .collect();
        let cover = with_cover.then(|| CoverResult {
            image: ImagePayload::new("image/png", vec![0x89, b'P', b'N', b'G']),
            report: CoverReport {
                generated: true,
                attempts: 1,
                error: None,
            },
        });
        assemble_book("Mia & the <Moon>", "Mia", &results, cover)
    }

    #[test]
    fn test_page_xhtml_escapes_title() {
        let xhtml = page_xhtml("Mia & the <Moon>", "Page 1", "images/page_001.png");
        assert!(xhtml.contains("Mia &amp; the &lt;Moon&gt;"));
        assert!(xhtml.contains(r#"src="images/page_001.png""#));
    }

    #[test]
    fn test_page_archive_contains_pages_and_metadata() {
        let bytes = build_page_archive(&sample_book(true)).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();

        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["book.json", "cover.png", "page_001.jpg", "page_002.jpg"]);

        let mut json = String::new();
        archive.by_name("book.json").unwrap().read_to_string(&mut json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["metadata"]["totalPages"], 2);
        assert_eq!(value["success"], false);
    }

    #[test]
    fn test_epub_is_a_zip_with_page_images() {
        let bytes = build_epub(&sample_book(true)).unwrap();
        assert!(bytes.starts_with(b"PK"));

        let archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let names: Vec<&str> = archive.file_names().collect();
        assert!(names.contains(&"mimetype"));
        assert!(names.iter().any(|n| n.ends_with("images/page_001.jpg")));
        assert!(names.iter().any(|n| n.ends_with("images/page_002.jpg")));
        assert!(names.iter().any(|n| n.ends_with("images/cover.png")));
    }

    #[tokio::test]
    async fn test_write_exports_creates_both_files() {
        let dir = std::env::temp_dir().join(format!("storybook-export-{}", uuid::Uuid::new_v4()));
        let files = write_exports(&sample_book(false), "book-1", &dir).await.unwrap();

        assert!(files.epub.exists());
        assert!(files.archive.exists());
        assert_eq!(files.epub.file_name().unwrap(), "book-1.epub");
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
