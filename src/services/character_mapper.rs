use crate::models::{CharacterDescriptor, PageMapping, PageRecord, SelectionRule};
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info};

static HUMAN_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)child|boy|girl|person|kid|human").expect("keyword pattern is valid")
});

/// Pick the character to replace on every page.
///
/// Total by construction: a page with no usable detection data gets the
/// forced default character, so every page is attempted.
pub fn map_pages(pages: &[Arc<PageRecord>], detections: Option<&Value>) -> Vec<PageMapping> {
    let mappings: Vec<PageMapping> = pages
        .iter()
        .map(|page| {
            let characters = characters_for_page(detections, page.page_number);
            let (character, rule) = select_character(&characters);
            debug!(
                "Page {}: {} candidate(s), selected via {:?}",
                page.page_number,
                characters.len(),
                rule
            );
            PageMapping {
                page: Arc::clone(page),
                character,
                replacement_needed: true,
                rule,
            }
        })
        .collect();

    let forced = mappings
        .iter()
        .filter(|m| m.rule == SelectionRule::ForcedDefault)
        .count();
    info!(
        "Mapped {} pages ({} with detected characters, {} forced)",
        mappings.len(),
        mappings.len() - forced,
        forced
    );
    mappings
}

/// Ordered fallback chain; the first rule that finds a candidate wins.
pub fn select_character(characters: &[CharacterDescriptor]) -> (CharacterDescriptor, SelectionRule) {
    let replaceable_human =
        |c: &&CharacterDescriptor| c.not_non_human() && c.not_animal() && c.not_excluded();

    if let Some(c) = characters
        .iter()
        .filter(replaceable_human)
        .find(|c| c.flagged_main())
    {
        return (c.clone(), SelectionRule::FlaggedMain);
    }

    if let Some(c) = characters
        .iter()
        .filter(replaceable_human)
        .find(|c| HUMAN_KEYWORDS.is_match(&c.description))
    {
        return (c.clone(), SelectionRule::HumanKeyword);
    }

    if let Some(c) = characters.iter().find(|c| {
        c.not_animal() && c.not_non_human() && matches!(c.size.to_lowercase().as_str(), "large" | "medium")
    }) {
        return (c.clone(), SelectionRule::ProminentSize);
    }

    if let Some(c) = characters.iter().find(|c| c.not_animal()) {
        return (c.clone(), SelectionRule::FirstNonAnimal);
    }

    if let Some(c) = characters.first() {
        return (c.clone(), SelectionRule::FirstAny);
    }

    (CharacterDescriptor::forced_default(), SelectionRule::ForcedDefault)
}

/// Extract the characters detected on one page from a loosely shaped payload.
///
/// Accepts an array indexed by page order or an object keyed by page number.
/// Each page entry may be an array of characters or an object with a
/// `characters` array. Anything that does not parse is dropped.
pub fn characters_for_page(detections: Option<&Value>, page_number: u32) -> Vec<CharacterDescriptor> {
    let entry = match detections {
        Some(Value::Array(pages)) => page_number
            .checked_sub(1)
            .and_then(|index| pages.get(index as usize)),
        Some(Value::Object(pages)) => pages.get(&page_number.to_string()),
        _ => None,
    };

    let list = match entry {
        Some(Value::Array(list)) => list,
        Some(Value::Object(page)) => match page.get("characters") {
            Some(Value::Array(list)) => list,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    list.iter()
        .filter(|value| value.is_object())
        .filter_map(|value| serde_json::from_value(value.clone()).ok())
        .collect()
}
