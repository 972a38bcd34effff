use crate::errors::{PipelineError, PipelineResult};
use crate::models::{ChildReference, CoverReport, ImagePayload, PageRecord};
use crate::services::cancel::CancelToken;
use crate::services::gemini::GenerationRequest;
use crate::services::page_generator::PageImageGenerator;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CoverResult {
    pub image: ImagePayload,
    pub report: CoverReport,
}

pub fn build_cover_prompt(title: &str, child_name: &str) -> String {
    format!(
        "You are given two images. The first is a photo of a child named {name}. \
         The second is the opening page of a children's book.\n\
         Create a front cover for this book in the same illustration style. \
         Feature a cartoonized version of {name} as the hero, cheerful and centered.\n\
         Render the title \"{title}\" clearly at the top of the cover.\n\
         Do not add any other text, logos or watermarks.\n\
         Return only the cover image.",
        name = child_name,
        title = title,
    )
}

/// Generate a personalized cover from the book's first page.
///
/// Uses the same pacing and retry rules as page generation and falls back to
/// `fallback` when the remote call cannot produce an image.
pub async fn generate_cover(
    generator: &PageImageGenerator,
    title: &str,
    child: &ChildReference,
    source: &PageRecord,
    fallback: &ImagePayload,
    cancel: &CancelToken,
) -> PipelineResult<CoverResult> {
    if source.image.is_empty() {
        return Err(PipelineError::ContractViolation(
            "cover source page has no image".to_string(),
        ));
    }

    let prompt = build_cover_prompt(title, &child.name);
    let request = GenerationRequest {
        prompt: &prompt,
        images: vec![&child.image, &source.image],
    };

    let outcome = generator.run_generation("cover", &request, cancel).await?;
    match outcome.result {
        Ok(image) => {
            info!("Cover generated after {} attempt(s)", outcome.attempts);
            Ok(CoverResult {
                image,
                report: CoverReport {
                    generated: true,
                    attempts: outcome.attempts,
                    error: None,
                },
            })
        }
        Err(error) => {
            warn!("Cover generation failed, using first page instead: {}", error);
            Ok(CoverResult {
                image: fallback.clone(),
                report: CoverReport {
                    generated: false,
                    attempts: outcome.attempts,
                    error: Some(error.to_string()),
                },
            })
        }
    }
}
