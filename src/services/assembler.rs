use crate::models::{AssembledBook, BookMetadata, ProcessedPageResult};
use crate::services::cover::CoverResult;
use chrono::Utc;
use tracing::info;

/// Put processed pages back in page order and summarize the run.
///
/// The book counts as a success when at least one page was personalized.
pub fn assemble_book(
    title: &str,
    child_name: &str,
    results: &[ProcessedPageResult],
    cover: Option<CoverResult>,
) -> AssembledBook {
    let mut pages = results.to_vec();
    pages.sort_by_key(|page| page.page_number);

    let successful_pages = pages.iter().filter(|page| page.success).count();
    let failed_pages = pages.len() - successful_pages;

    info!(
        "Assembled \"{}\" for {}: {}/{} pages personalized",
        title,
        child_name,
        successful_pages,
        pages.len()
    );

    AssembledBook {
        metadata: BookMetadata {
            title: title.to_string(),
            child_name: child_name.to_string(),
            total_pages: pages.len(),
            successful_pages,
            failed_pages,
            created_at: Utc::now(),
        },
        success: successful_pages > 0,
        pages,
        cover_report: cover.as_ref().map(|c| c.report.clone()),
        cover: cover.map(|c| c.image),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CoverReport, ImagePayload, PageRecord};

    fn result(page_number: u32, success: bool) -> ProcessedPageResult {
        let page = PageRecord {
            page_number,
            image: ImagePayload::new("image/png", vec![page_number as u8]),
        };
        let mut result = ProcessedPageResult::fallback(&page, "failed", 1);
        if success {
            result.success = true;
            result.used_original = false;
            result.error = None;
        }
        result
    }

    #[test]
    fn test_pages_are_sorted_and_counted() {
        let results = vec![result(3, true), result(1, false), result(2, true)];
        let book = assemble_book("Title", "Mia", &results, None);

        let order: Vec<u32> = book.pages.iter().map(|p| p.page_number).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(book.metadata.total_pages, 3);
        assert_eq!(book.metadata.successful_pages, 2);
        assert_eq!(book.metadata.failed_pages, 1);
        assert!(book.success);
    }

    #[test]
    fn test_book_with_no_personalized_pages_is_not_a_success() {
        let results = vec![result(1, false), result(2, false)];
        let book = assemble_book("Title", "Mia", &results, None);
        assert!(!book.success);
        assert_eq!(book.pages.len(), 2);
        assert_eq!(book.metadata.failed_pages, 2);
    }

    #[test]
    fn test_metadata_serializes_in_camel_case() {
        let book = assemble_book("Title", "Mia", &[result(1, true)], None);
        let json = serde_json::to_value(&book).unwrap();
        assert_eq!(json["metadata"]["childName"], "Mia");
        assert_eq!(json["metadata"]["successfulPages"], 1);
        assert_eq!(json["pages"][0]["usedOriginal"], false);
        assert!(json["pages"][0].get("processedImage").is_none());
        assert_eq!(json["success"], true);
        assert!(json.get("coverReport").is_none());
    }

    #[test]
    fn test_failed_cover_is_reported() {
        let cover = CoverResult {
            image: ImagePayload::new("image/png", vec![1]),
            report: CoverReport {
                generated: false,
                attempts: 5,
                error: Some("status 500".to_string()),
            },
        };
        let book = assemble_book("Title", "Mia", &[result(1, true)], Some(cover));

        assert_eq!(book.cover.as_ref().unwrap().data, vec![1]);
        let json = serde_json::to_value(&book).unwrap();
        assert_eq!(json["coverReport"]["generated"], false);
        assert_eq!(json["coverReport"]["attempts"], 5);
        assert_eq!(json["coverReport"]["error"], "status 500");
    }
}
