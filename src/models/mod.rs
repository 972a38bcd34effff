use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Encoded image bytes plus their MIME type. Never base64 or data-URI text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl ImagePayload {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// File extension matching the MIME type, used when exporting.
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "png",
        }
    }
}

/// One book page, numbered from 1 in source order.
#[derive(Debug, Clone)]
pub struct PageRecord {
    pub page_number: u32,
    pub image: ImagePayload,
}

/// A detected or assumed character on a page.
///
/// The boolean flags are tri-state: an absent flag is distinct from `false`
/// and the mapping rules treat them differently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterDescriptor {
    pub description: String,
    pub position: String,
    pub size: String,
    pub emotion: String,
    pub pose: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_main_character: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_human: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_animal: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace_with_child: Option<bool>,
}

impl CharacterDescriptor {
    /// The character assumed when a page carries no detection data at all.
    pub fn forced_default() -> Self {
        Self {
            description: "main character (forced processing)".to_string(),
            position: "center".to_string(),
            size: "medium".to_string(),
            emotion: "neutral".to_string(),
            pose: "standing".to_string(),
            is_main_character: Some(true),
            is_human: Some(true),
            is_animal: Some(false),
            replace_with_child: Some(true),
        }
    }

    pub fn flagged_main(&self) -> bool {
        self.is_main_character == Some(true)
    }

    pub fn not_non_human(&self) -> bool {
        self.is_human != Some(false)
    }

    pub fn not_animal(&self) -> bool {
        self.is_animal != Some(true)
    }

    pub fn not_excluded(&self) -> bool {
        self.replace_with_child != Some(false)
    }
}

/// Which mapping rule selected the character for a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionRule {
    FlaggedMain,
    HumanKeyword,
    ProminentSize,
    FirstNonAnimal,
    FirstAny,
    ForcedDefault,
}

/// A page bound to the character that will be replaced on it.
#[derive(Debug, Clone)]
pub struct PageMapping {
    pub page: Arc<PageRecord>,
    pub character: CharacterDescriptor,
    pub replacement_needed: bool,
    pub rule: SelectionRule,
}

impl PageMapping {
    pub fn page_number(&self) -> u32 {
        self.page.page_number
    }
}

/// The child whose likeness is drawn into the book.
#[derive(Debug, Clone)]
pub struct ChildReference {
    pub name: String,
    pub image: ImagePayload,
}

/// Outcome of generation for one page. `processed_image` always holds
/// something usable: the generated image or the original page.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedPageResult {
    pub page_number: u32,
    #[serde(skip)]
    pub processed_image: ImagePayload,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub used_original: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character: Option<CharacterDescriptor>,
}

impl ProcessedPageResult {
    pub fn fallback(page: &PageRecord, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            page_number: page.page_number,
            processed_image: page.image.clone(),
            success: false,
            error: Some(error.into()),
            used_original: true,
            attempts,
            character: None,
        }
    }
}

/// Per-run options supplied with a book request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingOptions {
    pub batch_size: usize,
    #[serde(default)]
    pub generate_cover: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookMetadata {
    pub title: String,
    pub child_name: String,
    pub total_pages: usize,
    pub successful_pages: usize,
    pub failed_pages: usize,
    pub created_at: DateTime<Utc>,
}

/// How the cover was produced. `generated` is false when the first page stands in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverReport {
    pub generated: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledBook {
    pub metadata: BookMetadata,
    pub pages: Vec<ProcessedPageResult>,
    pub success: bool,
    #[serde(skip)]
    pub cover: Option<ImagePayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_report: Option<CoverReport>,
}

/// Everything needed to personalize one book.
#[derive(Debug, Clone)]
pub struct BookRequest {
    pub title: String,
    pub child: ChildReference,
    pub pages: Vec<ImagePayload>,
    pub detections: Option<serde_json::Value>,
    pub options: ProcessingOptions,
}
