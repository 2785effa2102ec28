//! Cue grammar: extraction of inline control markers from agent output,
//! checklist block parsing, and the display sanitizer.
//!
//! Everything here is a pure function over text. Malformed or unterminated
//! markers simply fail to match; no error is ever raised for them.

pub mod blocks;
pub mod extract;
pub mod sanitize;

pub use blocks::{ParsedChecklist, ParsedItem, find_checklist, find_updates};
pub use extract::{extract_cues, file_change_content};
pub use sanitize::sanitize;
