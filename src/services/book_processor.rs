use crate::errors::{PipelineError, PipelineResult};
use crate::models::{AssembledBook, BookRequest, CoverReport, PageRecord};
use crate::services::assembler::assemble_book;
use crate::services::cancel::CancelToken;
use crate::services::character_mapper::map_pages;
use crate::services::cover::{CoverResult, generate_cover};
use crate::services::orchestrator::{BatchOrchestrator, OrchestratorOptions};
use crate::services::page_generator::PageImageGenerator;
use crate::utils::panic_message;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, instrument};

/// Runs a whole book: ingest, map characters, generate pages, cover, assemble.
pub struct BookProcessor {
    generator: Arc<PageImageGenerator>,
    defaults: OrchestratorOptions,
}

impl BookProcessor {
    pub fn new(generator: Arc<PageImageGenerator>, defaults: OrchestratorOptions) -> Self {
        Self {
            generator,
            defaults,
        }
    }

    #[instrument(skip_all, fields(title = %request.title, pages = request.pages.len()))]
    pub async fn process(&self, request: &BookRequest, cancel: &CancelToken) -> PipelineResult<AssembledBook> {
        validate(request)?;

        let pages: Vec<Arc<PageRecord>> = request
            .pages
            .iter()
            .enumerate()
            .map(|(index, image)| {
                Arc::new(PageRecord {
                    page_number: index as u32 + 1,
                    image: image.clone(),
                })
            })
            .collect();

        let mappings = map_pages(&pages, request.detections.as_ref());

        let mut options = self.defaults.clone();
        if request.options.batch_size > 0 {
            options.batch_size = request.options.batch_size;
        }
        let orchestrator = BatchOrchestrator::new(Arc::clone(&self.generator), options);
        let results = orchestrator.run(&mappings, &request.child, cancel).await?;

        let cover = match (request.options.generate_cover, pages.first(), results.first()) {
            (true, Some(source), Some(first_result)) => {
                let attempt = AssertUnwindSafe(generate_cover(
                    &self.generator,
                    &request.title,
                    &request.child,
                    source,
                    &first_result.processed_image,
                    cancel,
                ))
                .catch_unwind()
                .await;
                match attempt {
                    Ok(cover) => Some(cover?),
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!("Cover generation panicked, using first page instead: {}", message);
                        Some(CoverResult {
                            image: first_result.processed_image.clone(),
                            report: CoverReport {
                                generated: false,
                                attempts: 0,
                                error: Some(format!("cover generation failed: {}", message)),
                            },
                        })
                    }
                }
            }
            _ => None,
        };

        let book = assemble_book(&request.title, &request.child.name, &results, cover);
        let pacing = self.generator.limiter().snapshot();
        info!(
            "Book \"{}\" done: {}/{} pages personalized (peak pacing delay {:?})",
            book.metadata.title,
            book.metadata.successful_pages,
            book.metadata.total_pages,
            pacing.peak_delay
        );
        Ok(book)
    }
}

fn validate(request: &BookRequest) -> PipelineResult<()> {
    if request.child.image.is_empty() {
        return Err(PipelineError::ContractViolation(
            "child reference image is empty".to_string(),
        ));
    }
    if let Some(index) = request.pages.iter().position(|page| page.is_empty()) {
        return Err(PipelineError::ContractViolation(format!(
            "page {} has no image",
            index + 1
        )));
    }
    Ok(())
}
