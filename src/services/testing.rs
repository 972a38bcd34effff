// Scripted stand-ins for the remote image API, shared by the unit tests.

use crate::errors::{GenerationError, GenerationResult};
use crate::models::{ChildReference, ImagePayload};
use crate::services::cancel::CancelToken;
use crate::services::gemini::{GenerationRequest, ImageBackend};
use crate::services::page_generator::PageImageGenerator;
use crate::services::rate_limiter::RateLimiter;
use crate::services::retry::RetryPolicy;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Step {
    Image,
    Fail(GenerationError),
}

enum Plan {
    Always(Step),
    /// Per page: the first `n` attempts fail with the error, later ones succeed.
    FailFirst(u32, GenerationError),
}

pub struct ScriptedBackend {
    plan: Plan,
    empty_stream: AtomicBool,
    panic_pages: Mutex<Vec<Vec<u8>>>,
    cancel_after: Mutex<Option<(u32, CancelToken)>>,
    attempts_per_page: Mutex<HashMap<Vec<u8>, u32>>,
    stream_calls: AtomicU32,
    generate_calls: AtomicU32,
}

impl ScriptedBackend {
    fn with_plan(plan: Plan) -> Arc<Self> {
        Arc::new(Self {
            plan,
            empty_stream: AtomicBool::new(false),
            panic_pages: Mutex::new(Vec::new()),
            cancel_after: Mutex::new(None),
            attempts_per_page: Mutex::new(HashMap::new()),
            stream_calls: AtomicU32::new(0),
            generate_calls: AtomicU32::new(0),
        })
    }

    pub fn always(step: Step) -> Arc<Self> {
        Self::with_plan(Plan::Always(step))
    }

    pub fn fail_first(failures: u32, error: GenerationError) -> Arc<Self> {
        Self::with_plan(Plan::FailFirst(failures, error))
    }

    /// Make the streaming path end without an image.
    pub fn with_empty_stream(self: Arc<Self>) -> Arc<Self> {
        self.empty_stream.store(true, Ordering::SeqCst);
        self
    }

    /// Panic whenever one of these page images is submitted.
    pub fn with_panic_on(self: Arc<Self>, pages: &[&[u8]]) -> Arc<Self> {
        *self.panic_pages.lock() = pages.iter().map(|p| p.to_vec()).collect();
        self
    }

    /// Fire `token` once `calls` non-streaming calls have been made.
    pub fn with_cancel_after(self: Arc<Self>, calls: u32, token: CancelToken) -> Arc<Self> {
        *self.cancel_after.lock() = Some((calls, token));
        self
    }

    pub fn stream_calls(&self) -> u32 {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> u32 {
        self.generate_calls.load(Ordering::SeqCst)
    }

    fn respond(&self, request: &GenerationRequest<'_>) -> GenerationResult<ImagePayload> {
        let page = request
            .images
            .last()
            .map(|image| image.data.clone())
            .unwrap_or_default();

        if self.panic_pages.lock().contains(&page) {
            panic!("scripted panic for page {}", String::from_utf8_lossy(&page));
        }

        let attempt = {
            let mut attempts = self.attempts_per_page.lock();
            let count = attempts.entry(page.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let step = match &self.plan {
            Plan::Always(step) => step.clone(),
            Plan::FailFirst(failures, error) if attempt <= *failures => Step::Fail(error.clone()),
            Plan::FailFirst(..) => Step::Image,
        };

        match step {
            Step::Image => {
                let mut data = b"generated:".to_vec();
                data.extend_from_slice(&page);
                Ok(ImagePayload::new("image/png", data))
            }
            Step::Fail(error) => Err(error),
        }
    }
}

#[async_trait]
impl ImageBackend for ScriptedBackend {
    async fn generate_streaming(
        &self,
        request: &GenerationRequest<'_>,
    ) -> GenerationResult<Option<ImagePayload>> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        if self.empty_stream.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.respond(request).map(Some)
    }

    async fn generate(&self, request: &GenerationRequest<'_>) -> GenerationResult<ImagePayload> {
        let calls = self.generate_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = self.cancel_after.lock().as_ref() {
            if calls >= *after {
                token.cancel();
            }
        }
        self.respond(request)
    }
}

pub fn status(code: u16) -> GenerationError {
    GenerationError::Status {
        status: code,
        message: format!("scripted {}", code),
    }
}

pub fn child() -> ChildReference {
    ChildReference {
        name: "Mia".to_string(),
        image: ImagePayload::new("image/jpeg", b"child-photo".to_vec()),
    }
}

pub fn quick_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries, Duration::from_millis(10), Duration::ZERO)
}

pub fn generator_with_limiter(
    backend: Arc<ScriptedBackend>,
    limiter: Arc<RateLimiter>,
    max_retries: u32,
    use_streaming: bool,
) -> PageImageGenerator {
    PageImageGenerator::new(backend, limiter, quick_policy(max_retries), use_streaming)
}

pub fn quick_generator(
    backend: Arc<ScriptedBackend>,
    max_retries: u32,
    use_streaming: bool,
) -> PageImageGenerator {
    let limiter = Arc::new(RateLimiter::new(Duration::ZERO, Duration::ZERO));
    generator_with_limiter(backend, limiter, max_retries, use_streaming)
}
