//! Matchers for the structured block cues: `[MISSION_CHECKLIST]` and
//! `[CHECKLIST_UPDATE]`. These carry multi-line payloads and are parsed
//! separately from the flat cue list.

use regex::Regex;
use std::sync::LazyLock;

static CHECKLIST_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\[MISSION_CHECKLIST\](.*?)\[/MISSION_CHECKLIST\]").expect("checklist regex")
});

static UPDATE_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\[CHECKLIST_UPDATE\](.*?)\[/CHECKLIST_UPDATE\]").expect("update regex")
});

static MISSION_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*Mission:\s*(.+?)\s*$").expect("mission regex"));

static ITEM_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*-\s*\[([ xX])\]\s*(\d+)\.\s*(.+?)(?:\s*\(→([A-Z]+)\))?\s*$")
        .expect("item regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedItem {
    pub step: u32,
    pub description: String,
    /// Raw owner token from the `(→AGENT)` suffix; the tracker resolves it
    /// against the role enum, falling back to the configured default.
    pub owner_token: Option<String>,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChecklist {
    pub mission: String,
    pub items: Vec<ParsedItem>,
}

/// Locate a `[MISSION_CHECKLIST]` block and parse its lines. When a turn
/// restates the checklist more than once, the last block wins, consistent
/// with the last-occurrence rule for `[DONE]`.
#[must_use]
pub fn find_checklist(text: &str) -> Option<ParsedChecklist> {
    let caps = CHECKLIST_BLOCK_RE.captures_iter(text).last()?;
    let body = caps.get(1).expect("body").as_str();

    let mission = MISSION_LINE_RE
        .captures(body)
        .map(|m| m.get(1).expect("mission").as_str().to_string())
        .unwrap_or_default();

    let items = parse_items(body);
    Some(ParsedChecklist { mission, items })
}

/// Collect the completed step numbers from every `[CHECKLIST_UPDATE]` block
/// in the text, in order. Unchecked lines inside an update are ignored.
#[must_use]
pub fn find_updates(text: &str) -> Vec<u32> {
    let mut steps = Vec::new();
    for caps in UPDATE_BLOCK_RE.captures_iter(text) {
        let body = caps.get(1).expect("body").as_str();
        for item in parse_items(body) {
            if item.done && !steps.contains(&item.step) {
                steps.push(item.step);
            }
        }
    }
    steps
}

fn parse_items(body: &str) -> Vec<ParsedItem> {
    ITEM_LINE_RE
        .captures_iter(body)
        .filter_map(|caps| {
            let step: u32 = caps.get(2).expect("step").as_str().parse().ok()?;
            Some(ParsedItem {
                step,
                description: caps.get(3).expect("description").as_str().to_string(),
                owner_token: caps.get(4).map(|m| m.as_str().to_string()),
                done: caps.get(1).expect("mark").as_str() != " ",
            })
        })
        .collect()
}
