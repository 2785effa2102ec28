//! Display sanitizer: turns raw agent output into the text shown to humans
//! and stored in conversation history. Stored text becomes part of other
//! agents' future context, so raw control syntax must not leak through.
//!
//! The cosmetic passes at the end are lossy, best-effort cleanup of the
//! whitespace and punctuation artifacts left behind by tag removal. They are
//! isolated pure functions and must never feed back into control flow.

use crate::extract::code_block_after;
use ensemble_core::{AgentRole, Cue, CueKind, FileAction};
use regex::{Captures, Regex};
use std::sync::LazyLock;

static HANDOFF_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[→(SENIOR|JUNIOR|TESTER|RESEARCH)\]").expect("handoff regex"));

static DELETE_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[DELETE_FILE:([^\]\n]+)\]").expect("delete regex"));

static STRIP_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[(?:EDIT_FILE|CREATE_FILE|READ_FILE|FILE_SEARCH|SEARCH|SUB_RESEARCH|READ_URL|RUN_COMMAND|RUN_TESTS):[^\]\n]+\]|\[DONE\]|\[PROJECT_COMPLETE\]",
    )
    .expect("strip regex")
});

static BLOCK_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)\[MISSION_CHECKLIST\].*?\[/MISSION_CHECKLIST\]|\[CHECKLIST_UPDATE\].*?\[/CHECKLIST_UPDATE\]",
    )
    .expect("block strip regex")
});

static SHORT_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:\w+\n)?\s*(.*?)\s*```").expect("short block regex"));

static FENCE_PUNCT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[ \t]*[.,;:!?]+[ \t]*").expect("fence punct regex"));

static ORPHAN_PUNCT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*([.,!?;:])[ \t]*(\n|\z)").expect("orphan punct regex"));

static EXTRA_NEWLINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("newlines regex"));

static DOUBLE_SPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\S)[ \t]{2,}").expect("double space regex"));

/// Produce the user-facing rendering of `raw`, given the cues located in it.
///
/// Edit/create cues and their paired code block become a short placeholder;
/// delete cues become `[File Delete: path]`; handoff tags become `@Mention`
/// form; all other technical tags are stripped outright.
#[must_use]
pub fn sanitize(raw: &str, cues: &[Cue]) -> String {
    let text = replace_file_change_pairs(raw, cues);

    let text = HANDOFF_TAG_RE.replace_all(&text, |caps: &Captures<'_>| {
        AgentRole::from_cue_token(&caps[1])
            .map(|role| format!("@{}", role.display_name()))
            .unwrap_or_default()
    });
    let text = DELETE_TAG_RE.replace_all(&text, |caps: &Captures<'_>| {
        format!("[File Delete: {}]", caps[1].trim())
    });
    let text = STRIP_TAG_RE.replace_all(&text, "");
    let text = BLOCK_TAG_RE.replace_all(&text, "");

    tidy(&text)
}

/// Replace each edit/create cue plus its immediately-following fenced code
/// block with `[File <Action>: <path>]`. Cues without a paired block are left
/// for the strip pass.
fn replace_file_change_pairs(raw: &str, cues: &[Cue]) -> String {
    let mut spans: Vec<(usize, usize, String)> = Vec::new();
    for cue in cues {
        let CueKind::FileChange { action, path } = &cue.kind else {
            continue;
        };
        if *action == FileAction::Delete {
            continue;
        }
        if let Some(block) = code_block_after(raw, cue, cues) {
            spans.push((
                cue.start,
                block.block_end,
                format!("[File {}: {}]", action.label(), path),
            ));
        }
    }

    let mut out = raw.to_string();
    spans.sort_by_key(|(start, _, _)| std::cmp::Reverse(*start));
    for (start, end, replacement) in spans {
        out.replace_range(start..end, &replacement);
    }
    out
}

fn tidy(text: &str) -> String {
    let text = flatten_short_code_blocks(text);
    let text = FENCE_PUNCT_RE.replace_all(&text, "```\n");
    let text = ORPHAN_PUNCT_RE.replace_all(&text, "$1$2");
    let text = EXTRA_NEWLINES_RE.replace_all(&text, "\n\n");
    let text = DOUBLE_SPACE_RE.replace_all(&text, "$1 ");
    text.trim().to_string()
}

/// A fenced block wrapping a single short token (a filename the model chose
/// to fence, usually) reads better as inline code.
fn flatten_short_code_blocks(text: &str) -> String {
    SHORT_BLOCK_RE
        .replace_all(text, |caps: &Captures<'_>| {
            let content = caps[1].trim();
            if content.len() < 40 && !content.contains('\n') && !content.contains(' ') {
                format!("`{content}`")
            } else {
                caps[0].to_string()
            }
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::extract_cues;

    fn sanitize_all(raw: &str) -> String {
        sanitize(raw, &extract_cues(raw))
    }

    #[test]
    fn file_cue_and_block_collapse_to_placeholder() {
        let raw = "Here you go.\n[CREATE_FILE:app.py]\n```python\nprint('hi')\nprint('bye')\n```\nDone for now.";
        let clean = sanitize_all(raw);
        assert!(clean.contains("[File Create: app.py]"));
        assert!(!clean.contains("CREATE_FILE"));
        assert!(!clean.contains("print('hi')"));
    }

    #[test]
    fn file_cue_without_block_is_stripped() {
        let clean = sanitize_all("I will update it. [EDIT_FILE:main.py] Stay tuned.");
        assert!(!clean.contains("EDIT_FILE"));
        assert!(clean.contains("I will update it."));
    }

    #[test]
    fn delete_cue_becomes_placeholder() {
        let clean = sanitize_all("Removing it. [DELETE_FILE:old.py]");
        assert!(clean.contains("[File Delete: old.py]"));
    }

    #[test]
    fn handoff_tags_become_mentions() {
        let clean = sanitize_all("Over to you. [→TESTER]");
        assert_eq!(clean, "Over to you. @Unit Tester");
    }

    #[test]
    fn technical_tags_vanish_including_duplicates() {
        let raw = "[SEARCH:\"rust\"] looking... [SEARCH:\"rust\"] [DONE] done [DONE]";
        let clean = sanitize_all(raw);
        assert!(!clean.contains("[SEARCH"));
        assert!(!clean.contains("[DONE]"));
        assert!(clean.contains("looking"));
    }

    #[test]
    fn checklist_blocks_are_stripped() {
        let raw = "Plan:\n[MISSION_CHECKLIST]\nMission: x\n- [ ] 1. a\n[/MISSION_CHECKLIST]\nLet's go.";
        let clean = sanitize_all(raw);
        assert!(!clean.contains("MISSION_CHECKLIST"));
        assert!(clean.contains("Let's go."));
    }

    #[test]
    fn punctuation_after_code_fence_is_dropped() {
        let raw = "Use this:\n\n```python\ncode here\nmore code\n```, which solves the issue";
        let clean = sanitize_all(raw);
        assert!(!clean.contains("```,"));
        assert!(clean.ends_with("which solves the issue"));
    }

    #[test]
    fn inline_code_punctuation_is_preserved() {
        let clean = sanitize_all("Install `pytest`, then run `npm install`.");
        assert!(clean.contains("`pytest`,"));
        assert!(clean.ends_with("`npm install`."));
    }

    #[test]
    fn short_fenced_token_flattens_to_inline_code() {
        let clean = sanitize_all("Please check my ```test.py``` file.");
        assert_eq!(clean, "Please check my `test.py` file.");
    }

    #[test]
    fn orphan_punctuation_reattaches() {
        let clean = sanitize_all("All set\n.\nNext line");
        assert_eq!(clean, "All set.\nNext line");
    }

    #[test]
    fn newline_runs_collapse() {
        let clean = sanitize_all("a\n\n\n\n\nb");
        assert_eq!(clean, "a\n\nb");
    }
}
