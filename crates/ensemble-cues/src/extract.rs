use ensemble_core::{AgentRole, Cue, CueKind, FileAction};
use regex::Regex;
use std::sync::LazyLock;

static HANDOFF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[→(SENIOR|JUNIOR|TESTER|RESEARCH)\]").expect("handoff regex"));

static FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(EDIT_FILE|CREATE_FILE|DELETE_FILE|READ_FILE):([^\]\n]+)\]").expect("file regex")
});

static PAYLOAD_RES: LazyLock<Vec<(Regex, fn(String) -> CueKind)>> = LazyLock::new(|| {
    fn file_search(p: String) -> CueKind {
        CueKind::FileSearch { pattern: p }
    }
    fn web_search(q: String) -> CueKind {
        CueKind::WebSearch { query: q }
    }
    fn sub_research(q: String) -> CueKind {
        CueKind::SubResearch { query: q }
    }
    fn url_read(u: String) -> CueKind {
        CueKind::UrlRead { url: u }
    }
    fn run_command(c: String) -> CueKind {
        CueKind::RunCommand { command: c }
    }
    fn run_tests(c: String) -> CueKind {
        CueKind::RunTests { command: c }
    }
    vec![
        (
            Regex::new(r"\[FILE_SEARCH:([^\]\n]+)\]").expect("file search regex"),
            file_search as fn(String) -> CueKind,
        ),
        (
            Regex::new(r"\[SEARCH:([^\]\n]+)\]").expect("search regex"),
            web_search,
        ),
        (
            Regex::new(r"\[SUB_RESEARCH:([^\]\n]+)\]").expect("sub research regex"),
            sub_research,
        ),
        (
            Regex::new(r"\[READ_URL:([^\]\n]+)\]").expect("read url regex"),
            url_read,
        ),
        (
            Regex::new(r"\[RUN_COMMAND:([^\]\n]+)\]").expect("run command regex"),
            run_command,
        ),
        (
            Regex::new(r"\[RUN_TESTS:([^\]\n]+)\]").expect("run tests regex"),
            run_tests,
        ),
    ]
});

static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@(?i:Senior Dev|Junior Dev|Unit Tester|Researcher)").expect("mention regex")
});

static CODE_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_+.-]*\n(.*?)\n?```").expect("code block regex"));

/// Lookback window (bytes) for the gratitude heuristic on `@Mentions`.
const GRATITUDE_LOOKBACK: usize = 24;

const GRATITUDE_PHRASES: &[&str] = &[
    "thanks",
    "thank you",
    "great job",
    "good job",
    "great work",
    "nice work",
    "well done",
    "kudos",
    "appreciate",
];

/// Scan text for every recognized cue, globally sorted by first-occurrence
/// offset, with duplicates of the same (type, payload) collapsed to the
/// earliest match. `[DONE]` and `[PROJECT_COMPLETE]` are the exception:
/// an agent may restate them, and the final statement wins, so they carry
/// the offset of their last occurrence.
#[must_use]
pub fn extract_cues(text: &str) -> Vec<Cue> {
    let mut found: Vec<Cue> = Vec::new();

    for caps in HANDOFF_RE.captures_iter(text) {
        let whole = caps.get(0).expect("match");
        let token = caps.get(1).expect("token").as_str();
        if let Some(target) = AgentRole::from_cue_token(token) {
            found.push(Cue {
                kind: CueKind::Handoff { target },
                start: whole.start(),
                end: whole.end(),
            });
        }
    }

    for caps in FILE_RE.captures_iter(text) {
        let whole = caps.get(0).expect("match");
        let verb = caps.get(1).expect("verb").as_str();
        let path = trim_payload(caps.get(2).expect("path").as_str());
        if path.is_empty() {
            continue;
        }
        let kind = match verb {
            "EDIT_FILE" => CueKind::FileChange {
                action: FileAction::Edit,
                path,
            },
            "CREATE_FILE" => CueKind::FileChange {
                action: FileAction::Create,
                path,
            },
            "DELETE_FILE" => CueKind::FileChange {
                action: FileAction::Delete,
                path,
            },
            _ => CueKind::FileRead { path },
        };
        found.push(Cue {
            kind,
            start: whole.start(),
            end: whole.end(),
        });
    }

    for (pattern, make) in PAYLOAD_RES.iter() {
        for caps in pattern.captures_iter(text) {
            let whole = caps.get(0).expect("match");
            let payload = trim_payload(caps.get(1).expect("payload").as_str());
            if payload.is_empty() {
                continue;
            }
            found.push(Cue {
                kind: make(payload),
                start: whole.start(),
                end: whole.end(),
            });
        }
    }

    // Informal @Mentions count as handoffs unless preceded by gratitude
    // phrasing ("Thanks @Senior Dev for the review" is not a handoff).
    // Deliberately fuzzy: false positives and negatives are acceptable.
    for matched in MENTION_RE.find_iter(text) {
        if gratitude_before(text, matched.start()) {
            continue;
        }
        if let Some(target) = AgentRole::from_display_name(&matched.as_str()[1..]) {
            found.push(Cue {
                kind: CueKind::Handoff { target },
                start: matched.start(),
                end: matched.end(),
            });
        }
    }

    if let Some(pos) = text.rfind("[DONE]") {
        found.push(Cue {
            kind: CueKind::Done,
            start: pos,
            end: pos + "[DONE]".len(),
        });
    }
    if let Some(pos) = text.rfind("[PROJECT_COMPLETE]") {
        found.push(Cue {
            kind: CueKind::ProjectComplete,
            start: pos,
            end: pos + "[PROJECT_COMPLETE]".len(),
        });
    }

    found.sort_by_key(|cue| cue.start);

    let mut seen: Vec<CueKind> = Vec::new();
    found.retain(|cue| {
        if seen.contains(&cue.kind) {
            false
        } else {
            seen.push(cue.kind.clone());
            true
        }
    });
    found
}

fn gratitude_before(text: &str, at: usize) -> bool {
    let from = text.floor_char_boundary(at.saturating_sub(GRATITUDE_LOOKBACK));
    let window = text[from..at].to_ascii_lowercase();
    GRATITUDE_PHRASES
        .iter()
        .any(|phrase| window.contains(phrase))
}

fn trim_payload(raw: &str) -> String {
    raw.trim()
        .trim_matches('"')
        .trim()
        .to_string()
}

/// The fenced code block paired with a file cue: its inner content and the
/// absolute end offset of the closing fence.
pub struct PairedBlock {
    pub content: String,
    pub block_end: usize,
}

/// Find the fenced code block between `cue` and the next located cue, if any.
#[must_use]
pub fn code_block_after(text: &str, cue: &Cue, cues: &[Cue]) -> Option<PairedBlock> {
    let window_end = cues
        .iter()
        .map(|c| c.start)
        .filter(|start| *start >= cue.end)
        .min()
        .unwrap_or(text.len());
    let window = &text[cue.end..window_end];
    let caps = CODE_BLOCK_RE.captures(window)?;
    let whole = caps.get(0).expect("match");
    Some(PairedBlock {
        content: caps.get(1).expect("content").as_str().trim().to_string(),
        block_end: cue.end + whole.end(),
    })
}

/// Content for a proposed file change: the paired code block if one follows
/// the cue, otherwise the trimmed remainder of the cue's window. The model
/// sometimes omits fences; losing the change entirely is worse than taking
/// the loose text.
#[must_use]
pub fn file_change_content(text: &str, cue: &Cue, cues: &[Cue]) -> String {
    if let Some(block) = code_block_after(text, cue, cues) {
        return block.content;
    }
    let window_end = cues
        .iter()
        .map(|c| c.start)
        .filter(|start| *start >= cue.end)
        .min()
        .unwrap_or(text.len());
    text[cue.end..window_end].trim().to_string()
}
