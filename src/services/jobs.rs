// In-memory registry of book runs.
//
// Each run gets its own cancel token. Finished books keep their metadata and
// per-page outcomes; the image bytes live only in the exported files.

use crate::errors::PipelineError;
use crate::models::{AssembledBook, BookRequest};
use crate::services::book_processor::BookProcessor;
use crate::services::cancel::CancelToken;
use crate::services::export::{ExportedFiles, write_exports};
use crate::utils::panic_message;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Epub,
    Archive,
}

struct JobEntry {
    status: JobStatus,
    title: String,
    child_name: String,
    created_at: DateTime<Utc>,
    book: Option<AssembledBook>,
    exports: Option<ExportedFiles>,
    error: Option<String>,
    cancel: CancelToken,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub book_id: Uuid,
    pub status: JobStatus,
    pub title: String,
    pub child_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub book: Option<AssembledBook>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloads: Option<Downloads>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Downloads {
    pub epub: String,
    pub archive: String,
}

#[derive(Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<Uuid, JobEntry>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, title: &str, child_name: &str) -> (Uuid, CancelToken) {
        let id = Uuid::new_v4();
        let cancel = CancelToken::new();
        self.jobs.write().await.insert(
            id,
            JobEntry {
                status: JobStatus::Queued,
                title: title.to_string(),
                child_name: child_name.to_string(),
                created_at: Utc::now(),
                book: None,
                exports: None,
                error: None,
                cancel: cancel.clone(),
            },
        );
        (id, cancel)
    }

    async fn update<F: FnOnce(&mut JobEntry)>(&self, id: Uuid, f: F) {
        match self.jobs.write().await.get_mut(&id) {
            Some(entry) => f(entry),
            None => warn!("Update for unknown book {}", id),
        }
    }

    pub async fn mark_processing(&self, id: Uuid) {
        self.update(id, |entry| entry.status = JobStatus::Processing).await;
    }

    pub async fn complete(&self, id: Uuid, book: AssembledBook, exports: ExportedFiles) {
        self.update(id, |entry| {
            entry.status = JobStatus::Completed;
            entry.book = Some(without_images(book));
            entry.exports = Some(exports);
        })
        .await;
    }

    pub async fn fail(&self, id: Uuid, message: String) {
        self.update(id, |entry| {
            entry.status = JobStatus::Failed;
            entry.error = Some(message);
        })
        .await;
    }

    pub async fn mark_cancelled(&self, id: Uuid) {
        self.update(id, |entry| entry.status = JobStatus::Cancelled).await;
    }

    /// Fire the run's cancel token. Returns the status seen, or `None` for unknown ids.
    pub async fn cancel(&self, id: Uuid) -> Option<JobStatus> {
        let jobs = self.jobs.read().await;
        let entry = jobs.get(&id)?;
        if !entry.status.is_finished() {
            entry.cancel.cancel();
        }
        Some(entry.status)
    }

    pub async fn summary(&self, id: Uuid) -> Option<JobSummary> {
        let jobs = self.jobs.read().await;
        let entry = jobs.get(&id)?;
        Some(JobSummary {
            book_id: id,
            status: entry.status,
            title: entry.title.clone(),
            child_name: entry.child_name.clone(),
            created_at: entry.created_at,
            error: entry.error.clone(),
            book: entry.book.clone(),
            downloads: entry.exports.as_ref().map(|_| Downloads {
                epub: format!("/books/{}/epub", id),
                archive: format!("/books/{}/pages.zip", id),
            }),
        })
    }

    /// Drop a job, cancelling it first if it is still running.
    /// Returns the exported files that were recorded for it.
    pub async fn remove(&self, id: Uuid) -> Option<Option<ExportedFiles>> {
        let entry = self.jobs.write().await.remove(&id)?;
        if !entry.status.is_finished() {
            entry.cancel.cancel();
        }
        Some(entry.exports)
    }

    pub async fn export_path(&self, id: Uuid, kind: ExportKind) -> Option<PathBuf> {
        let jobs = self.jobs.read().await;
        let exports = jobs.get(&id)?.exports.as_ref()?;
        Some(match kind {
            ExportKind::Epub => exports.epub.clone(),
            ExportKind::Archive => exports.archive.clone(),
        })
    }
}

/// Delete a job's exported files. Files already gone are not an error.
pub async fn delete_exports(files: &ExportedFiles) -> std::io::Result<()> {
    for path in [&files.epub, &files.archive] {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn without_images(mut book: AssembledBook) -> AssembledBook {
    for page in &mut book.pages {
        page.processed_image.data = Vec::new();
    }
    book.cover = None;
    book
}

enum JobOutcome {
    Completed(AssembledBook, ExportedFiles),
    Cancelled,
    Failed(String),
}

/// Drive one registered run to completion and record the outcome.
///
/// Runs in a detached task, so a panic anywhere in the run is caught here and
/// recorded as a failure instead of leaving the job in `processing`.
pub async fn run_job(
    store: Arc<JobStore>,
    processor: Arc<BookProcessor>,
    output_dir: PathBuf,
    id: Uuid,
    request: BookRequest,
    cancel: CancelToken,
) {
    store.mark_processing(id).await;
    info!("Book {} started ({} pages)", id, request.pages.len());

    let outcome = guarded(produce_book(&processor, &output_dir, id, &request, &cancel)).await;
    match outcome {
        JobOutcome::Completed(book, files) => {
            info!("Book {} completed", id);
            store.complete(id, book, files).await;
        }
        JobOutcome::Cancelled => {
            info!("Book {} cancelled", id);
            store.mark_cancelled(id).await;
        }
        JobOutcome::Failed(message) => {
            error!("Book {} failed: {}", id, message);
            store.fail(id, message).await;
        }
    }
}

async fn guarded<F: Future<Output = JobOutcome>>(work: F) -> JobOutcome {
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => JobOutcome::Failed(format!("run panicked: {}", panic_message(panic.as_ref()))),
    }
}

async fn produce_book(
    processor: &BookProcessor,
    output_dir: &Path,
    id: Uuid,
    request: &BookRequest,
    cancel: &CancelToken,
) -> JobOutcome {
    let book = match processor.process(request, cancel).await {
        Ok(book) => book,
        Err(PipelineError::Cancelled) => return JobOutcome::Cancelled,
        Err(e) => return JobOutcome::Failed(e.to_string()),
    };
    match write_exports(&book, &id.to_string(), output_dir).await {
        Ok(files) => JobOutcome::Completed(book, files),
        Err(e) => JobOutcome::Failed(format!("export failed: {:#}", e)),
    }
}
