// Batch orchestration for a book run.
//
// Pages are cut into contiguous batches. Within a batch pages run strictly
// one after another: each prompt points at the most recent page that was
// actually personalized, so parallelism here would break continuity.

use crate::errors::PipelineResult;
use crate::models::{ChildReference, PageMapping, ProcessedPageResult};
use crate::services::cancel::CancelToken;
use crate::services::page_generator::PageImageGenerator;
use crate::utils::panic_message;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, instrument};

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub batch_size: usize,
    pub inter_page_delay: Duration,
    pub inter_batch_delay: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            batch_size: 3,
            inter_page_delay: Duration::from_millis(2000),
            inter_batch_delay: Duration::from_millis(3000),
        }
    }
}

pub struct BatchOrchestrator {
    generator: Arc<PageImageGenerator>,
    options: OrchestratorOptions,
}

impl BatchOrchestrator {
    pub fn new(generator: Arc<PageImageGenerator>, options: OrchestratorOptions) -> Self {
        Self { generator, options }
    }

    /// Process every mapped page, returning one result per page in page order.
    ///
    /// A panicking batch degrades to its original images and the run moves on.
    /// Only a contract violation or cancellation ends the run early.
    #[instrument(skip_all, fields(pages = mappings.len(), batch_size = self.options.batch_size))]
    pub async fn run(
        &self,
        mappings: &[PageMapping],
        child: &ChildReference,
        cancel: &CancelToken,
    ) -> PipelineResult<Vec<ProcessedPageResult>> {
        let start = Instant::now();
        let batch_size = self.options.batch_size.max(1);
        let batches: Vec<&[PageMapping]> = mappings.chunks(batch_size).collect();
        let mut results: Vec<ProcessedPageResult> = Vec::with_capacity(mappings.len());

        info!(
            "Processing {} pages in {} batch(es) of up to {}",
            mappings.len(),
            batches.len(),
            batch_size
        );

        for (index, batch) in batches.iter().enumerate() {
            let anchor = last_replaced(&results);
            info!(
                "Batch {}/{}: pages {}-{}",
                index + 1,
                batches.len(),
                batch.first().map(|m| m.page_number()).unwrap_or_default(),
                batch.last().map(|m| m.page_number()).unwrap_or_default()
            );

            let outcome = AssertUnwindSafe(self.process_batch(batch, child, anchor, cancel))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(batch_results)) => results.extend(batch_results),
                Ok(Err(e)) => return Err(e),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!("Batch {} panicked, keeping original pages: {}", index + 1, message);
                    results.extend(degrade_batch(batch, &format!("batch failed: {}", message)));
                }
            }

            if index + 1 < batches.len() {
                cancel.sleep(self.options.inter_batch_delay).await?;
            }
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        let fell_back = results.iter().filter(|r| r.used_original).count();
        info!(
            "Run finished in {:.1}s: {} succeeded, {} kept original, {} total",
            start.elapsed().as_secs_f64(),
            succeeded,
            fell_back,
            results.len()
        );

        Ok(results)
    }

    async fn process_batch(
        &self,
        batch: &[PageMapping],
        child: &ChildReference,
        anchor: Option<&ProcessedPageResult>,
        cancel: &CancelToken,
    ) -> PipelineResult<Vec<ProcessedPageResult>> {
        let mut batch_results: Vec<ProcessedPageResult> = Vec::with_capacity(batch.len());

        for (position, mapping) in batch.iter().enumerate() {
            if position > 0 {
                cancel.sleep(self.options.inter_page_delay).await?;
            }
            let previous = last_replaced(&batch_results).or(anchor);
            let result = self
                .generator
                .generate(mapping, child, previous, cancel)
                .await?;
            batch_results.push(result);
        }

        Ok(batch_results)
    }
}

/// The most recent page that was actually personalized.
fn last_replaced(results: &[ProcessedPageResult]) -> Option<&ProcessedPageResult> {
    results.iter().rev().find(|r| r.success && !r.used_original)
}

fn degrade_batch(batch: &[PageMapping], reason: &str) -> Vec<ProcessedPageResult> {
    batch
        .iter()
        .map(|mapping| {
            let mut result = ProcessedPageResult::fallback(&mapping.page, reason, 0);
            result.character = Some(mapping.character.clone());
            result
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PipelineError;
    use crate::models::{ImagePayload, PageRecord};
    use crate::services::character_mapper::map_pages;
    use crate::services::rate_limiter::RateLimiter;
    use crate::services::testing::{
        ScriptedBackend, Step, child, generator_with_limiter, quick_generator, status,
    };

    fn no_delays(batch_size: usize) -> OrchestratorOptions {
        OrchestratorOptions {
            batch_size,
            inter_page_delay: Duration::ZERO,
            inter_batch_delay: Duration::ZERO,
        }
    }

    fn book(count: u32) -> Vec<PageMapping> {
        let pages: Vec<Arc<PageRecord>> = (1..=count)
            .map(|n| {
                Arc::new(PageRecord {
                    page_number: n,
                    image: ImagePayload::new("image/png", format!("page-{}", n).into_bytes()),
                })
            })
            .collect();
        map_pages(&pages, None)
    }

    fn orchestrator(generator: PageImageGenerator, batch_size: usize) -> BatchOrchestrator {
        BatchOrchestrator::new(Arc::new(generator), no_delays(batch_size))
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_pages_succeed_first_time() {
        let backend = ScriptedBackend::always(Step::Image);
        let orchestrator = orchestrator(quick_generator(backend.clone(), 5, false), 3);

        let results = orchestrator
            .run(&book(5), &child(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.success));
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.page_number, i as u32 + 1);
            assert!(result.success);
            assert!(!result.used_original);
            assert_eq!(result.attempts, 1);
        }
        assert_eq!(backend.generate_calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overloaded_pages_recover_on_third_attempt() {
        let backend = ScriptedBackend::fail_first(2, status(503));
        let limiter = Arc::new(RateLimiter::new(
            Duration::from_millis(50),
            Duration::from_millis(5000),
        ));
        let generator = generator_with_limiter(backend, Arc::clone(&limiter), 5, false);
        let orchestrator = orchestrator(generator, 3);

        let results = orchestrator
            .run(&book(3), &child(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        for result in &results {
            assert!(result.success);
            assert_eq!(result.attempts, 3);
        }
        assert!(limiter.snapshot().peak_delay > Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_fall_back_without_retry() {
        let backend = ScriptedBackend::always(Step::Fail(status(400)));
        let orchestrator = orchestrator(quick_generator(backend.clone(), 5, false), 3);

        let results = orchestrator
            .run(&book(4), &child(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.used_original));
        for result in &results {
            assert!(!result.success);
            assert!(result.used_original);
            assert_eq!(result.attempts, 1);
            assert_eq!(
                result.processed_image.data,
                format!("page-{}", result.page_number).into_bytes()
            );
        }
        assert_eq!(backend.generate_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_never_abort_the_run() {
        let backend = ScriptedBackend::always(Step::Fail(status(500)));
        let orchestrator = orchestrator(quick_generator(backend.clone(), 5, false), 2);

        let results = orchestrator
            .run(&book(3), &child(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.used_original && !r.success));
        assert!(results.iter().all(|r| r.attempts == 5));
        assert_eq!(backend.generate_calls(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_batch_is_isolated() {
        let backend = ScriptedBackend::always(Step::Image).with_panic_on(&[b"page-3"]);
        let orchestrator = orchestrator(quick_generator(backend, 5, false), 2);

        let results = orchestrator
            .run(&book(5), &child(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        let outcome: Vec<(u32, bool, bool)> = results
            .iter()
            .map(|r| (r.page_number, r.success, r.used_original))
            .collect();
        assert_eq!(
            outcome,
            vec![
                (1, true, false),
                (2, true, false),
                (3, false, true),
                (4, false, true),
                (5, true, false),
            ]
        );
        assert_eq!(results[3].processed_image.data, b"page-4".to_vec());
        assert!(results[2].error.as_deref().unwrap().contains("scripted panic"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contract_violation_aborts_the_run() {
        let backend = ScriptedBackend::always(Step::Image);
        let orchestrator = orchestrator(quick_generator(backend, 5, false), 2);
        let mut mappings = book(3);
        mappings[2].page = Arc::new(PageRecord {
            page_number: 3,
            image: ImagePayload::new("image/png", Vec::new()),
        });

        let result = orchestrator.run(&mappings, &child(), &CancelToken::new()).await;
        assert!(matches!(result, Err(PipelineError::ContractViolation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_between_pages() {
        let cancel = CancelToken::new();
        let backend = ScriptedBackend::always(Step::Image).with_cancel_after(2, cancel.clone());
        let orchestrator = BatchOrchestrator::new(
            Arc::new(quick_generator(backend.clone(), 5, false)),
            OrchestratorOptions {
                batch_size: 3,
                inter_page_delay: Duration::from_secs(2),
                inter_batch_delay: Duration::from_secs(3),
            },
        );

        let result = orchestrator.run(&book(6), &child(), &cancel).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(backend.generate_calls(), 2);
    }

    #[test]
    fn test_last_replaced_skips_fallbacks() {
        let page = PageRecord {
            page_number: 2,
            image: ImagePayload::new("image/png", b"p".to_vec()),
        };
        let mut ok = ProcessedPageResult::fallback(&page, "x", 1);
        ok.page_number = 1;
        ok.success = true;
        ok.used_original = false;
        ok.error = None;
        let failed = ProcessedPageResult::fallback(&page, "x", 5);

        let results = vec![ok, failed];
        assert_eq!(last_replaced(&results).map(|r| r.page_number), Some(1));
        assert!(last_replaced(&results[1..]).is_none());
    }
}
