use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".ensemble")
}

/// Closed set of agent personas. Handoff-cue and mention lookups are total
/// functions over this enum rather than string-keyed tables that can
/// silently miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentRole {
    #[serde(rename = "Senior Dev")]
    SeniorDev,
    #[serde(rename = "Junior Dev")]
    JuniorDev,
    #[serde(rename = "Unit Tester")]
    UnitTester,
    #[serde(rename = "Researcher")]
    Researcher,
}

impl AgentRole {
    pub const ALL: [AgentRole; 4] = [
        AgentRole::SeniorDev,
        AgentRole::JuniorDev,
        AgentRole::UnitTester,
        AgentRole::Researcher,
    ];

    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::SeniorDev => "Senior Dev",
            Self::JuniorDev => "Junior Dev",
            Self::UnitTester => "Unit Tester",
            Self::Researcher => "Researcher",
        }
    }

    /// Token used in bracket handoff cues, e.g. `SENIOR` in `[→SENIOR]`.
    #[must_use]
    pub fn cue_token(self) -> &'static str {
        match self {
            Self::SeniorDev => "SENIOR",
            Self::JuniorDev => "JUNIOR",
            Self::UnitTester => "TESTER",
            Self::Researcher => "RESEARCH",
        }
    }

    /// Full handoff cue in wire form, e.g. `[→SENIOR]`.
    #[must_use]
    pub fn handoff_cue(self) -> String {
        format!("[→{}]", self.cue_token())
    }

    #[must_use]
    pub fn from_cue_token(token: &str) -> Option<Self> {
        match token {
            "SENIOR" => Some(Self::SeniorDev),
            "JUNIOR" => Some(Self::JuniorDev),
            "TESTER" => Some(Self::UnitTester),
            "RESEARCH" => Some(Self::Researcher),
            _ => None,
        }
    }

    /// Parse a display name as used in `@Mention` form. Case-insensitive.
    #[must_use]
    pub fn from_display_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|role| role.display_name().to_ascii_lowercase() == normalized)
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Edit,
    Delete,
}

impl FileAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Edit => "edit",
            Self::Delete => "delete",
        }
    }

    /// Label used in display placeholders, e.g. `[File Create: main.py]`.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Edit => "Edit",
            Self::Delete => "Delete",
        }
    }
}

/// One inline control marker recognized in agent output.
///
/// Recomputed from raw text every turn; never persisted independently of the
/// message that carried it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CueKind {
    Handoff { target: AgentRole },
    FileChange { action: FileAction, path: String },
    FileRead { path: String },
    FileSearch { pattern: String },
    WebSearch { query: String },
    SubResearch { query: String },
    UrlRead { url: String },
    RunCommand { command: String },
    RunTests { command: String },
    Done,
    ProjectComplete,
}

/// A cue plus the byte range of its source text, kept for display surgery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cue {
    pub kind: CueKind,
    pub start: usize,
    pub end: usize,
}

/// One turn's output, appended to the conversation log and immutable after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub agent: AgentRole,
    pub visible_content: String,
    /// Raw internal reasoning; never fed into other agents' prompts.
    pub thoughts: Option<String>,
    pub cues: Vec<Cue>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub step: u32,
    pub description: String,
    pub owner: AgentRole,
    pub done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Idle,
    InProgress,
}

/// A proposed file mutation awaiting a human decision. Exactly one outcome:
/// applied (content written, record removed) or rejected (record removed,
/// no disk effect).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingChange {
    pub id: Uuid,
    pub path: String,
    pub action: FileAction,
    pub new_content: String,
    /// Snapshot at proposal time; `None` for creates.
    pub old_content: Option<String>,
    pub proposed_by: AgentRole,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHit {
    pub path: String,
    pub size: u64,
}

/// Event stream emitted by the turn loop so an embedding UI or test harness
/// can observe the full decision trail without re-deriving it from raw text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    AgentStart {
        agent: AgentRole,
        turn: u64,
    },
    Thought {
        agent: AgentRole,
        content: String,
    },
    Message {
        agent: AgentRole,
        content: String,
    },
    FileChange {
        change_id: Uuid,
        action: FileAction,
        path: String,
        agent: AgentRole,
        old_content: Option<String>,
        new_content: String,
    },
    AgentStatus {
        status: String,
    },
    Handoff {
        from: AgentRole,
        to: AgentRole,
        cue: String,
    },
    ChecklistCreated {
        mission: String,
        items: Vec<ChecklistItem>,
    },
    ChecklistUpdated {
        newly_completed: Vec<u32>,
        remaining: u32,
    },
    AgentDone {
        agent: AgentRole,
        message: String,
    },
    Error {
        agent: AgentRole,
        content: String,
    },
    Complete {
        turns: u64,
        conversation_length: usize,
    },
}

pub type EventSink = Arc<dyn Fn(&OrchestratorEvent) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.deepseek.com/chat/completions".to_string(),
            model: "deepseek-chat".to_string(),
            api_key_env: "DEEPSEEK_API_KEY".to_string(),
            timeout_seconds: 120,
            max_retries: 2,
            retry_base_ms: 500,
            temperature: 0.7,
            max_output_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Hard ceiling on turns per mission call, regardless of cues.
    pub max_turns: u64,
    /// How many prior conversation entries are rendered into prompts.
    pub history_window: usize,
    /// Owner assigned to checklist items with no `(→AGENT)` suffix.
    pub fallback_owner: AgentRole,
    /// Agent resumed after an approved `[DONE]` with an incomplete checklist.
    pub lead_agent: AgentRole,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_turns: 8,
            history_window: 20,
            fallback_owner: AgentRole::SeniorDev,
            lead_agent: AgentRole::SeniorDev,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub timeout_seconds: u64,
    /// Max search hits returned per query.
    pub max_results: usize,
    /// Pages fetched concurrently during sub-research.
    pub fetch_count: usize,
    /// Extracted page text is truncated to this many bytes.
    pub max_page_bytes: usize,
    pub user_agent: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: 10,
            max_results: 5,
            fetch_count: 3,
            max_page_bytes: 5000,
            user_agent: "Mozilla/5.0 (compatible; Ensemble/0.1)".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub max_file_bytes: u64,
    /// Extensions agents may write. Files with no extension are allowed
    /// (Dockerfile, LICENSE).
    pub allowed_extensions: Vec<String>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 10 * 1024 * 1024,
            allowed_extensions: [
                ".py", ".js", ".ts", ".jsx", ".tsx", ".html", ".css", ".scss", ".json", ".yaml",
                ".yml", ".md", ".txt", ".sh", ".bat", ".java", ".cpp", ".c", ".h", ".go", ".rs",
                ".rb", ".php", ".toml",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub timeout_seconds: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub orchestrator: OrchestratorConfig,
    pub web: WebConfig,
    pub files: FilesConfig,
    pub shell: ShellConfig,
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".ensemble/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    /// Layered load: defaults, then legacy toml, then user settings, then
    /// project settings, each overlay winning key by key.
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let legacy = Self::legacy_toml_path(workspace);
        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_cfg: AppConfig = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &serde_json::to_value(legacy_cfg)?);
        }

        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    /// Load if any settings file exists, otherwise write defaults first.
    pub fn ensure(workspace: &Path) -> Result<Self> {
        let path = Self::project_settings_path(workspace);
        if path.exists()
            || Self::legacy_toml_path(workspace).exists()
            || Self::user_settings_path().is_some_and(|p| p.exists())
        {
            return Self::load(workspace);
        }
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        let cfg = Self::default();
        cfg.save(workspace)?;
        Ok(cfg)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_cue_token() {
        for role in AgentRole::ALL {
            assert_eq!(AgentRole::from_cue_token(role.cue_token()), Some(role));
        }
    }

    #[test]
    fn role_parses_display_name_case_insensitively() {
        assert_eq!(
            AgentRole::from_display_name("senior dev"),
            Some(AgentRole::SeniorDev)
        );
        assert_eq!(
            AgentRole::from_display_name("Unit Tester"),
            Some(AgentRole::UnitTester)
        );
        assert_eq!(AgentRole::from_display_name("Project Manager"), None);
    }

    #[test]
    fn handoff_cue_uses_arrow_wire_form() {
        assert_eq!(AgentRole::UnitTester.handoff_cue(), "[→TESTER]");
    }

    #[test]
    fn role_serializes_as_display_name() {
        let json = serde_json::to_string(&AgentRole::JuniorDev).expect("serialize");
        assert_eq!(json, "\"Junior Dev\"");
    }

    #[test]
    fn config_ensure_writes_defaults_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = AppConfig::ensure(temp.path()).expect("ensure");
        assert_eq!(cfg.orchestrator.max_turns, 8);
        assert!(AppConfig::project_settings_path(temp.path()).exists());
    }

    #[test]
    fn config_overlay_wins_key_by_key() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = runtime_dir(temp.path());
        fs::create_dir_all(&dir).expect("runtime dir");
        fs::write(
            dir.join("settings.json"),
            r#"{"orchestrator": {"max_turns": 3}}"#,
        )
        .expect("write settings");
        let cfg = AppConfig::load(temp.path()).expect("load");
        assert_eq!(cfg.orchestrator.max_turns, 3);
        // Untouched keys keep defaults.
        assert_eq!(cfg.orchestrator.history_window, 20);
    }
}
