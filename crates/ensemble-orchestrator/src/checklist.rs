//! Mission checklist tracker: wholesale replacement from a
//! `[MISSION_CHECKLIST]` block, monotone done-flips from `[CHECKLIST_UPDATE]`
//! blocks, and the completeness predicate gating `[PROJECT_COMPLETE]`.

use ensemble_core::{AgentRole, ChecklistItem};
use ensemble_cues::{find_checklist, find_updates};

#[derive(Debug, Default)]
pub struct ChecklistTracker {
    mission: String,
    items: Vec<ChecklistItem>,
}

impl ChecklistTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tracked checklist from the latest block in `text`, if one
    /// exists. Returns whether a block was found. Replacement is always
    /// wholesale; there is no incremental merge. Step numbers are unique:
    /// when a block repeats one, the first occurrence wins.
    pub fn parse_checklist(&mut self, text: &str, fallback_owner: AgentRole) -> bool {
        let Some(parsed) = find_checklist(text) else {
            return false;
        };
        self.mission = parsed.mission;
        let mut seen_steps: Vec<u32> = Vec::new();
        self.items = parsed
            .items
            .into_iter()
            .filter(|item| {
                if seen_steps.contains(&item.step) {
                    false
                } else {
                    seen_steps.push(item.step);
                    true
                }
            })
            .map(|item| ChecklistItem {
                step: item.step,
                description: item.description,
                owner: item
                    .owner_token
                    .as_deref()
                    .and_then(AgentRole::from_cue_token)
                    .unwrap_or(fallback_owner),
                done: item.done,
            })
            .collect();
        true
    }

    /// Flip not-yet-done items named by `[CHECKLIST_UPDATE]` blocks in `text`
    /// to done. Returns the step numbers newly completed; re-applying the
    /// same update reports nothing.
    pub fn apply_updates(&mut self, text: &str) -> Vec<u32> {
        let mut newly = Vec::new();
        for step in find_updates(text) {
            if let Some(item) = self
                .items
                .iter_mut()
                .find(|item| item.step == step && !item.done)
            {
                item.done = true;
                newly.push(step);
            }
        }
        newly
    }

    /// True when no checklist is active or every item is done.
    pub fn is_complete(&self) -> bool {
        self.items.iter().all(|item| item.done)
    }

    pub fn is_active(&self) -> bool {
        !self.items.is_empty()
    }

    pub fn mission(&self) -> &str {
        &self.mission
    }

    pub fn items(&self) -> &[ChecklistItem] {
        &self.items
    }

    pub fn remaining(&self) -> u32 {
        self.items.iter().filter(|item| !item.done).count() as u32
    }

    pub fn incomplete_steps(&self) -> Vec<&ChecklistItem> {
        self.items.iter().filter(|item| !item.done).collect()
    }

    /// Markdown rendering injected into the next agent's context so the
    /// model can see progress and whether completion is currently permitted.
    pub fn summary(&self) -> String {
        if self.items.is_empty() {
            return String::new();
        }
        let done = self.items.iter().filter(|item| item.done).count();
        let mut out = format!(
            "Mission checklist: {} ({done}/{} done)\n",
            self.mission,
            self.items.len()
        );
        for item in &self.items {
            let mark = if item.done { "x" } else { " " };
            out.push_str(&format!(
                "- [{mark}] {}. {} (→{})\n",
                item.step,
                item.description,
                item.owner.cue_token()
            ));
        }
        if self.is_complete() {
            out.push_str("All steps are done. [PROJECT_COMPLETE] is permitted.\n");
        } else {
            out.push_str("Steps remain. Do NOT emit [PROJECT_COMPLETE] yet.\n");
        }
        out
    }

    pub fn clear(&mut self) {
        self.mission.clear();
        self.items.clear();
    }
}
