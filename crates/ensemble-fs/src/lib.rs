//! Sandboxed workspace file store with the pending-change approval protocol.
//!
//! Agents never write to disk directly. A file cue becomes a
//! [`PendingChange`] held here until a human applies or rejects it; exactly
//! one of those outcomes happens, and a change can never be applied twice.

use anyhow::{Context, Result};
use chrono::Utc;
use ensemble_core::{AgentRole, FileAction, FileHit, FilesConfig, PendingChange};
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("path escapes the workspace root: {0}")]
    PathEscape(String),
    #[error("file type not allowed: {0}")]
    ExtensionDenied(String),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("no pending change with id {0}")]
    UnknownChange(Uuid),
}

pub struct FileStore {
    workspace: PathBuf,
    cfg: FilesConfig,
    pending: HashMap<Uuid, PendingChange>,
}

impl FileStore {
    pub fn new(workspace: &Path, cfg: FilesConfig) -> Result<Self> {
        fs::create_dir_all(workspace)
            .with_context(|| format!("creating workspace {}", workspace.display()))?;
        Ok(Self {
            workspace: workspace.to_path_buf(),
            cfg,
            pending: HashMap::new(),
        })
    }

    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Resolve a workspace-relative path, rejecting absolute paths and any
    /// `..` traversal out of the sandbox.
    fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let cleaned = path.trim_start_matches(['/', '\\']).replace('\\', "/");
        let relative = Path::new(&cleaned);
        let mut normalized = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                _ => return Err(SandboxError::PathEscape(path.to_string())),
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(SandboxError::PathEscape(path.to_string()));
        }
        Ok(self.workspace.join(normalized))
    }

    fn check_extension(&self, path: &str) -> Result<(), SandboxError> {
        let ext = Path::new(path)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()));
        // Extensionless files (Dockerfile, LICENSE) are allowed.
        match ext {
            Some(ext) if !self.cfg.allowed_extensions.contains(&ext) => {
                Err(SandboxError::ExtensionDenied(ext))
            }
            _ => Ok(()),
        }
    }

    /// Read a file's content, or `None` if it does not exist.
    pub fn read(&self, path: &str) -> Result<Option<String>> {
        let full = self.resolve(path)?;
        if !full.is_file() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&full).with_context(|| {
            format!("reading {}", full.display())
        })?))
    }

    /// Register a proposed mutation and return its id. Snapshots the current
    /// content so the eventual diff shown to the human reflects proposal
    /// time, not apply time.
    pub fn create_pending_change(
        &mut self,
        path: &str,
        action: FileAction,
        new_content: String,
        proposed_by: AgentRole,
    ) -> Result<Uuid> {
        self.resolve(path)?;
        self.check_extension(path)?;
        let size = new_content.len() as u64;
        if size > self.cfg.max_file_bytes {
            return Err(SandboxError::TooLarge {
                size,
                max: self.cfg.max_file_bytes,
            }
            .into());
        }

        let old_content = self.read(path)?;
        let id = Uuid::now_v7();
        self.pending.insert(
            id,
            PendingChange {
                id,
                path: path.to_string(),
                action,
                new_content,
                old_content,
                proposed_by,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    #[must_use]
    pub fn pending(&self, id: Uuid) -> Option<&PendingChange> {
        self.pending.get(&id)
    }

    /// Pending changes ordered by creation time.
    #[must_use]
    pub fn list_pending(&self) -> Vec<&PendingChange> {
        let mut all: Vec<&PendingChange> = self.pending.values().collect();
        all.sort_by_key(|change| change.created_at);
        all
    }

    /// Materialize an approved change to disk. The record is removed before
    /// the write so a second call with the same id fails instead of
    /// re-applying.
    pub fn apply(&mut self, id: Uuid) -> Result<PendingChange> {
        let change = self
            .pending
            .remove(&id)
            .ok_or(SandboxError::UnknownChange(id))?;
        let full = self.resolve(&change.path)?;
        match change.action {
            FileAction::Create | FileAction::Edit => {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                fs::write(&full, &change.new_content)
                    .with_context(|| format!("writing {}", full.display()))?;
            }
            FileAction::Delete => {
                if full.is_file() {
                    fs::remove_file(&full)
                        .with_context(|| format!("deleting {}", full.display()))?;
                }
            }
        }
        Ok(change)
    }

    /// Discard a rejected change. No disk effect.
    pub fn reject(&mut self, id: Uuid) -> Result<PendingChange> {
        Ok(self
            .pending
            .remove(&id)
            .ok_or(SandboxError::UnknownChange(id))?)
    }

    /// All workspace files with sizes, runtime dir excluded, sorted by path.
    pub fn list(&self) -> Result<Vec<FileHit>> {
        self.search("*")
    }

    /// Find workspace files matching a glob pattern, or a substring when the
    /// pattern carries no glob metacharacters.
    pub fn search(&self, pattern: &str) -> Result<Vec<FileHit>> {
        let glob = if pattern.contains(['*', '?', '[']) {
            Some(glob::Pattern::new(pattern).with_context(|| format!("bad pattern {pattern}"))?)
        } else {
            None
        };

        let mut hits = Vec::new();
        for entry in WalkDir::new(&self.workspace)
            .into_iter()
            .filter_entry(|e| e.file_name().to_string_lossy() != ".ensemble")
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.workspace)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let matched = match &glob {
                Some(glob) => {
                    glob.matches(&relative)
                        || Path::new(&relative)
                            .file_name()
                            .is_some_and(|name| glob.matches(&name.to_string_lossy()))
                }
                None => relative.contains(pattern),
            };
            if matched {
                hits.push(FileHit {
                    path: relative,
                    size: entry.metadata()?.len(),
                });
            }
        }
        hits.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(hits)
    }
}
