use crate::errors::{GenerationResult, PipelineError, PipelineResult};
use crate::models::{
    CharacterDescriptor, ChildReference, ImagePayload, PageMapping, ProcessedPageResult,
};
use crate::services::cancel::CancelToken;
use crate::services::gemini::{GenerationRequest, ImageBackend};
use crate::services::rate_limiter::RateLimiter;
use crate::services::retry::{RetryOutcome, RetryPolicy};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Produces the personalized image for one page, or falls back to the original.
pub struct PageImageGenerator {
    backend: Arc<dyn ImageBackend>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    use_streaming: bool,
}

impl PageImageGenerator {
    pub fn new(
        backend: Arc<dyn ImageBackend>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
        use_streaming: bool,
    ) -> Self {
        Self {
            backend,
            limiter,
            policy,
            use_streaming,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Generate the replacement for `mapping`'s page.
    ///
    /// Remote failures are absorbed into a fallback result. Only a missing
    /// image (a broken caller contract) or cancellation is returned as `Err`.
    #[instrument(skip_all, fields(page = mapping.page_number()))]
    pub async fn generate(
        &self,
        mapping: &PageMapping,
        child: &ChildReference,
        previous: Option<&ProcessedPageResult>,
        cancel: &CancelToken,
    ) -> PipelineResult<ProcessedPageResult> {
        let page = &mapping.page;
        if page.image.is_empty() {
            return Err(PipelineError::ContractViolation(format!(
                "page {} has no image",
                page.page_number
            )));
        }
        if child.image.is_empty() {
            return Err(PipelineError::ContractViolation(
                "child reference image is empty".to_string(),
            ));
        }

        if !mapping.replacement_needed {
            debug!("Page {} needs no replacement, keeping original", page.page_number);
            // Kept pages never count as personalized.
            return Ok(ProcessedPageResult {
                page_number: page.page_number,
                processed_image: page.image.clone(),
                success: false,
                error: None,
                used_original: true,
                attempts: 0,
                character: Some(mapping.character.clone()),
            });
        }

        let prompt = build_page_prompt(
            &child.name,
            &mapping.character,
            previous.map(|p| p.page_number),
        );
        let request = GenerationRequest {
            prompt: &prompt,
            images: vec![&child.image, &page.image],
        };

        let label = format!("page {}", page.page_number);
        let outcome = self.run_generation(&label, &request, cancel).await?;

        match outcome.result {
            Ok(image) => {
                info!(
                    "Page {} personalized after {} attempt(s)",
                    page.page_number, outcome.attempts
                );
                Ok(ProcessedPageResult {
                    page_number: page.page_number,
                    processed_image: image,
                    success: true,
                    error: None,
                    used_original: false,
                    attempts: outcome.attempts,
                    character: Some(mapping.character.clone()),
                })
            }
            Err(error) => {
                warn!(
                    "Page {} falls back to original after {} attempt(s): {}",
                    page.page_number, outcome.attempts, error
                );
                let mut result =
                    ProcessedPageResult::fallback(page, error.to_string(), outcome.attempts);
                result.character = Some(mapping.character.clone());
                Ok(result)
            }
        }
    }

    /// Issue `request` under the rate limiter and retry policy.
    pub(crate) async fn run_generation(
        &self,
        label: &str,
        request: &GenerationRequest<'_>,
        cancel: &CancelToken,
    ) -> PipelineResult<RetryOutcome<ImagePayload>> {
        self.policy
            .run(label, &self.limiter, cancel, |_| self.attempt_once(request))
            .await
    }

    /// One attempt: streaming first, then a single non-streaming call.
    async fn attempt_once(&self, request: &GenerationRequest<'_>) -> GenerationResult<ImagePayload> {
        if self.use_streaming {
            match self.backend.generate_streaming(request).await {
                Ok(Some(image)) => return Ok(image),
                Ok(None) => debug!("Stream returned no image, retrying without streaming"),
                Err(e) => debug!("Streaming call failed ({}), retrying without streaming", e),
            }
        }
        self.backend.generate(request).await
    }
}

pub fn build_page_prompt(
    child_name: &str,
    character: &CharacterDescriptor,
    previous_page: Option<u32>,
) -> String {
    let mut prompt = format!(
        "You are given two images. The first is a photo of a child named {name}. \
         The second is a page from a children's book.\n\
         Find the main human character on the book page ({description}, located {position}, \
         {size} size, looking {emotion}, {pose}) and replace that character with a cartoonized \
         version of {name}, drawn in the same illustration style as the page.\n\
         Keep the character's pose, position, size and expression exactly as they are.\n\
         Keep the background, all text, and every animal or other character unchanged.\n\
         Remove any scan artifacts or watermarks.\n\
         Return only the edited page image.",
        name = child_name,
        description = non_empty(&character.description, "main character"),
        position = non_empty(&character.position, "in the scene"),
        size = non_empty(&character.size, "medium"),
        emotion = non_empty(&character.emotion, "neutral"),
        pose = non_empty(&character.pose, "standing"),
    );

    if let Some(page) = previous_page {
        prompt.push_str(&format!(
            "\n{} already appears on page {} of this book; draw {} with the same face, \
             hair and outfit so the child looks consistent from page to page.",
            child_name, page, child_name
        ));
    }
    prompt
}

fn non_empty<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.trim().is_empty() { default } else { value }
}
