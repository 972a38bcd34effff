mod config;
mod errors;
mod models;
mod services;
mod utils;

use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
};
use config::Config;
use models::{BookRequest, ChildReference, ImagePayload, ProcessingOptions};
use services::book_processor::BookProcessor;
use services::gemini::GeminiClient;
use services::jobs::{ExportKind, JobStatus, JobStore, delete_exports, run_job};
use services::orchestrator::OrchestratorOptions;
use services::page_generator::PageImageGenerator;
use services::rate_limiter::RateLimiter;
use services::retry::RetryPolicy;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    processor: Arc<BookProcessor>,
    jobs: Arc<JobStore>,
    output_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("storybook=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;

    let backend = Arc::new(GeminiClient::new(&config.gemini)?);
    let limiter = Arc::new(RateLimiter::new(config.pacing.min_delay, config.pacing.max_delay));
    let policy = RetryPolicy::new(
        config.pacing.max_retries,
        config.pacing.retry_base_delay,
        config.pacing.retry_jitter,
    );
    let generator = Arc::new(PageImageGenerator::new(
        backend,
        limiter,
        policy,
        config.gemini.use_streaming,
    ));
    let processor = Arc::new(BookProcessor::new(
        generator,
        OrchestratorOptions {
            batch_size: config.batch.batch_size,
            inter_page_delay: config.batch.inter_page_delay,
            inter_batch_delay: config.batch.inter_batch_delay,
        },
    ));

    let app_state = AppState {
        processor,
        jobs: Arc::new(JobStore::new()),
        output_dir: config.server.output_dir.clone(),
    };

    let app = Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/books", post(create_book))
        .route("/books/:id", get(book_status).delete(delete_book))
        .route("/books/:id/cancel", post(cancel_book))
        .route("/books/:id/epub", get(download_epub))
        .route("/books/:id/pages.zip", get(download_pages))
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(config.server.max_upload_mb * 1024 * 1024))
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(tower_http::cors::Any)
                    .allow_methods(tower_http::cors::AllowMethods::any())
                    .allow_headers(tower_http::cors::AllowHeaders::any()),
            ),
        );

    let listener = TcpListener::bind(config.bind_addr()).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Error body returned by the HTTP handlers.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(id: Uuid) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("no book with id {}", id),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}

async fn index() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Storybook Personalizer</title>
    <meta charset="utf-8">
    <style>
        body { font-family: Arial, sans-serif; margin: 40px; }
        .info-box { background-color: #f0f8ff; padding: 20px; border-radius: 8px; margin: 20px 0; }
        .endpoint { background-color: #f5f5f5; padding: 10px; margin: 10px 0; border-radius: 4px; font-family: monospace; }
    </style>
</head>
<body>
    <h1>Storybook Personalizer</h1>

    <div class="info-box">
        <p>Upload the pages of a picture book and a photo of a child. Each page is
        redrawn with the child as the main character, then bound into an EPUB.</p>
    </div>

    <h2>Available Endpoints:</h2>
    <div class="endpoint">GET /health - Health check</div>
    <div class="endpoint">POST /books - Start a book (multipart: page_image..., child_photo, child_name, title)</div>
    <div class="endpoint">GET /books/{id} - Progress and per-page results</div>
    <div class="endpoint">POST /books/{id}/cancel - Stop a running book</div>
    <div class="endpoint">DELETE /books/{id} - Forget a book and delete its files</div>
    <div class="endpoint">GET /books/{id}/epub - Download the EPUB</div>
    <div class="endpoint">GET /books/{id}/pages.zip - Download the page images</div>
</body>
</html>
"#,
    )
}

async fn health_check() -> &'static str {
    "OK"
}

/// Fields collected from the `POST /books` form.
#[derive(Default)]
struct BookForm {
    title: Option<String>,
    child_name: Option<String>,
    child_photo: Option<ImagePayload>,
    pages: Vec<ImagePayload>,
    batch_size: Option<usize>,
    generate_cover: bool,
    detections: Option<serde_json::Value>,
}

impl BookForm {
    fn into_request(self) -> Result<BookRequest, ApiError> {
        let child_name = self
            .child_name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| ApiError::bad_request("child_name is required"))?;
        let child_photo = self
            .child_photo
            .filter(|photo| !photo.is_empty())
            .ok_or_else(|| ApiError::bad_request("child_photo is required"))?;
        if let Some(index) = self.pages.iter().position(|page| page.is_empty()) {
            return Err(ApiError::bad_request(format!(
                "page_image #{} is empty",
                index + 1
            )));
        }

        let title = self
            .title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| format!("{}'s Story", child_name.trim()));

        Ok(BookRequest {
            title,
            child: ChildReference {
                name: child_name.trim().to_string(),
                image: child_photo,
            },
            pages: self.pages,
            detections: self.detections,
            options: ProcessingOptions {
                batch_size: self.batch_size.unwrap_or(0),
                generate_cover: self.generate_cover,
            },
        })
    }
}

/// Files arrive as raw bytes; plain text fields are taken as base64, with or
/// without a data-URI prefix.
fn image_field(
    data: Bytes,
    file_name: Option<&str>,
    content_type: Option<&str>,
) -> Result<ImagePayload, ApiError> {
    let is_file = file_name.is_some() || content_type.is_some_and(|ct| ct.starts_with("image/"));
    if is_file {
        return Ok(utils::image_from_upload(data.to_vec(), content_type));
    }
    let text = std::str::from_utf8(&data)
        .map_err(|_| ApiError::bad_request("image field is neither a file nor base64 text"))?;
    utils::decode_image(text).map_err(|e| ApiError::bad_request(format!("{:#}", e)))
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

async fn read_form(mut multipart: Multipart) -> Result<BookForm, ApiError> {
    let mut form = BookForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("failed to read {}: {}", name, e)))?;

        match name.as_str() {
            "page_image" => form.pages.push(image_field(
                data,
                file_name.as_deref(),
                content_type.as_deref(),
            )?),
            "child_photo" => {
                form.child_photo = Some(image_field(
                    data,
                    file_name.as_deref(),
                    content_type.as_deref(),
                )?)
            }
            "child_name" => form.child_name = Some(String::from_utf8_lossy(&data).into_owned()),
            "title" => form.title = Some(String::from_utf8_lossy(&data).into_owned()),
            "batch_size" => {
                let text = String::from_utf8_lossy(&data);
                let size = text
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| ApiError::bad_request(format!("invalid batch_size: {}", text)))?;
                form.batch_size = Some(size);
            }
            "generate_cover" => form.generate_cover = parse_flag(&String::from_utf8_lossy(&data)),
            "character_detections" => {
                let value = serde_json::from_slice(&data).map_err(|e| {
                    ApiError::bad_request(format!("character_detections is not JSON: {}", e))
                })?;
                form.detections = Some(value);
            }
            other => warn!("Ignoring unknown form field {}", other),
        }
    }

    Ok(form)
}

async fn create_book(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let request = read_form(multipart).await?.into_request()?;
    let (book_id, cancel) = state.jobs.create(&request.title, &request.child.name).await;
    info!(
        "Accepted book {} \"{}\" with {} pages",
        book_id,
        request.title,
        request.pages.len()
    );

    tokio::spawn(run_job(
        Arc::clone(&state.jobs),
        Arc::clone(&state.processor),
        state.output_dir.clone(),
        book_id,
        request,
        cancel,
    ));

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "success": true,
            "book_id": book_id,
            "status_url": format!("/books/{}", book_id)
        })),
    ))
}

async fn book_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<services::jobs::JobSummary>, ApiError> {
    state
        .jobs
        .summary(id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(id))
}

async fn cancel_book(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state
        .jobs
        .cancel(id)
        .await
        .ok_or_else(|| ApiError::not_found(id))?;
    Ok(Json(serde_json::json!({
        "book_id": id,
        "cancelled": !status.is_finished(),
        "status": status
    })))
}

async fn delete_book(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let exports = state
        .jobs
        .remove(id)
        .await
        .ok_or_else(|| ApiError::not_found(id))?;
    if let Some(files) = exports {
        delete_exports(&files).await.map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("failed to delete exports for {}: {}", id, e),
        })?;
    }
    info!("Deleted book {}", id);
    Ok(StatusCode::NO_CONTENT)
}

async fn download_epub(state: State<AppState>, id: Path<Uuid>) -> Result<Response, ApiError> {
    download(state, id, ExportKind::Epub).await
}

async fn download_pages(state: State<AppState>, id: Path<Uuid>) -> Result<Response, ApiError> {
    download(state, id, ExportKind::Archive).await
}

async fn download(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    kind: ExportKind,
) -> Result<Response, ApiError> {
    let path = match state.jobs.export_path(id, kind).await {
        Some(path) => path,
        None => {
            let summary = state
                .jobs
                .summary(id)
                .await
                .ok_or_else(|| ApiError::not_found(id))?;
            let message = match summary.status {
                JobStatus::Queued | JobStatus::Processing => "book is still being generated",
                _ => "book has no downloadable output",
            };
            return Err(ApiError {
                status: StatusCode::CONFLICT,
                message: message.to_string(),
            });
        }
    };

    let bytes = tokio::fs::read(&path).await.map_err(|e| ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: format!("failed to read {}: {}", path.display(), e),
    })?;

    let (content_type, file_name) = match kind {
        ExportKind::Epub => ("application/epub+zip", format!("{}.epub", id)),
        ExportKind::Archive => ("application/zip", format!("{}-pages.zip", id)),
    };
    Ok((
        [
            (http::header::CONTENT_TYPE, content_type.to_string()),
            (
                http::header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(bytes: &[u8]) -> ImagePayload {
        ImagePayload::new("image/png", bytes.to_vec())
    }

    #[test]
    fn test_form_requires_child_photo() {
        let form = BookForm {
            child_name: Some("Mia".to_string()),
            pages: vec![png(b"page")],
            ..Default::default()
        };
        let err = form.into_request().unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("child_photo"));
    }

    #[test]
    fn test_form_defaults_title_and_batch_size() {
        let form = BookForm {
            child_name: Some(" Mia ".to_string()),
            child_photo: Some(png(b"photo")),
            pages: vec![png(b"page-1"), png(b"page-2")],
            generate_cover: true,
            ..Default::default()
        };
        let request = form.into_request().unwrap();
        assert_eq!(request.title, "Mia's Story");
        assert_eq!(request.child.name, "Mia");
        assert_eq!(request.pages.len(), 2);
        assert_eq!(request.options.batch_size, 0);
        assert!(request.options.generate_cover);
    }

    #[test]
    fn test_form_rejects_empty_page() {
        let form = BookForm {
            child_name: Some("Mia".to_string()),
            child_photo: Some(png(b"photo")),
            pages: vec![png(b"page-1"), png(b"")],
            ..Default::default()
        };
        assert!(form.into_request().unwrap_err().message.contains("#2"));
    }

    #[test]
    fn test_image_field_accepts_files_and_base64_text() {
        let file = image_field(
            Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0x00]),
            Some("page.jpg"),
            None,
        )
        .unwrap();
        assert_eq!(file.mime_type, "image/jpeg");

        let text = format!("data:image/webp;base64,{}", utils::encode_base64(b"webp"));
        let decoded = image_field(Bytes::from(text), None, None).unwrap();
        assert_eq!(decoded.mime_type, "image/webp");
        assert_eq!(decoded.data, b"webp");

        assert!(image_field(Bytes::from_static(b"not base64!"), None, None).is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("true"));
        assert!(parse_flag(" ON "));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(""));
    }
}
