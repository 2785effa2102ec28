//! Turn-loop state machine coordinating the agent team.
//!
//! One `Orchestrator` instance owns one mission/session: the conversation
//! log, checklist, handoff queue and pending-approval state all live here,
//! never in process-wide globals, so concurrent missions are just separate
//! instances. The loop itself is strictly sequential; the only fan-out is
//! inside the web collaborator's sub-research.

mod checklist;
pub mod prompts;
pub mod shell;

pub use checklist::ChecklistTracker;
pub use shell::{PlatformShellRunner, ShellRunResult, ShellRunner};

use anyhow::Result;
use chrono::Utc;
use ensemble_core::{
    AgentRole, AppConfig, ConversationMessage, Cue, CueKind, EventSink, FileAction,
    MissionStatus, OrchestratorEvent,
};
use ensemble_cues::{extract_cues, file_change_content, sanitize};
use ensemble_fs::FileStore;
use ensemble_llm::AgentBackend;
use ensemble_observe::Observer;
use ensemble_stream::{StreamEvent, ThoughtSplitter, split_complete};
use ensemble_web::WebClient;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How one `process_message`/`continue_with` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Active work ended for this call; the mission may still be in progress.
    Finished,
    /// A file change awaits human approval; state is retained for resume.
    AwaitingApproval,
    /// `[PROJECT_COMPLETE]` accepted; mission state reset to idle.
    MissionComplete,
    /// The cooperative stop signal was observed.
    Cancelled,
}

/// Outcome of the approval resume protocol: who speaks next (if anyone) and
/// the message to hand them.
#[derive(Debug, Clone)]
pub struct ApprovalResume {
    pub next_agent: Option<AgentRole>,
    pub message: String,
}

pub struct Orchestrator {
    cfg: AppConfig,
    workspace: PathBuf,
    files: FileStore,
    web: WebClient,
    shell: Box<dyn ShellRunner>,
    backend: Box<dyn AgentBackend>,
    observer: Observer,
    conversation: Vec<ConversationMessage>,
    checklist: ChecklistTracker,
    handoff_queue: VecDeque<AgentRole>,
    /// Handoff stashed when a file-change pause pre-empted it; consumed
    /// exactly once by the approval resume protocol.
    pending_handoff: Option<AgentRole>,
    status: MissionStatus,
    current_agent: AgentRole,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        workspace: &Path,
        cfg: AppConfig,
        backend: Box<dyn AgentBackend>,
        shell: Box<dyn ShellRunner>,
    ) -> Result<Self> {
        let files = FileStore::new(workspace, cfg.files.clone())?;
        let web = WebClient::new(cfg.web.clone())?;
        let observer = Observer::new(workspace)?;
        let lead = cfg.orchestrator.lead_agent;
        Ok(Self {
            cfg,
            workspace: workspace.to_path_buf(),
            files,
            web,
            shell,
            backend,
            observer,
            conversation: Vec::new(),
            checklist: ChecklistTracker::new(),
            handoff_queue: VecDeque::new(),
            pending_handoff: None,
            status: MissionStatus::Idle,
            current_agent: lead,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn files(&mut self) -> &mut FileStore {
        &mut self.files
    }

    pub fn conversation(&self) -> &[ConversationMessage] {
        &self.conversation
    }

    pub fn status(&self) -> MissionStatus {
        self.status
    }

    pub fn current_agent(&self) -> AgentRole {
        self.current_agent
    }

    pub fn checklist(&self) -> &ChecklistTracker {
        &self.checklist
    }

    /// Shared stop flag; setting it exits the loop cleanly at the next turn
    /// boundary or stream yield point. The flag is re-armed at the start of
    /// each mission call, so a cancellation only covers the call it lands in.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.observer.set_verbose(verbose);
    }

    /// Start (or continue) a mission from a human message.
    pub fn process_message(
        &mut self,
        user_text: &str,
        initial_agent: Option<AgentRole>,
        sink: &EventSink,
    ) -> Result<TurnOutcome> {
        self.cancel.store(false, Ordering::Relaxed);
        self.status = MissionStatus::InProgress;
        self.current_agent =
            initial_agent.unwrap_or_else(|| select_initial_agent(user_text));
        self.run_loop(user_text.to_string(), sink)
    }

    /// Resume entry point used after an approval decision.
    pub fn continue_with(
        &mut self,
        agent: AgentRole,
        message: &str,
        sink: &EventSink,
    ) -> Result<TurnOutcome> {
        self.cancel.store(false, Ordering::Relaxed);
        self.status = MissionStatus::InProgress;
        self.current_agent = agent;
        self.run_loop(message.to_string(), sink)
    }

    /// One non-streaming exchange outside the mission loop. No cue side
    /// effects are applied; the sanitized reply is returned directly.
    pub fn respond_once(&mut self, user_text: &str) -> Result<String> {
        let agent = select_initial_agent(user_text);
        let listing = self.files.list().unwrap_or_default();
        let prompt = prompts::build_prompt(
            &self.conversation,
            self.cfg.orchestrator.history_window,
            &listing,
            user_text,
            &self.checklist.summary(),
        );
        let raw = self.backend.generate(&prompts::system_prompt(agent), &prompt)?;
        let (message_text, thoughts) = split_complete(&raw);
        let cues = extract_cues(&message_text);
        let visible = sanitize(&message_text, &cues);
        self.conversation.push(ConversationMessage {
            agent,
            visible_content: visible.clone(),
            thoughts: (!thoughts.is_empty()).then_some(thoughts),
            cues,
            at: Utc::now(),
        });
        Ok(visible)
    }

    /// Clear conversation, checklist and mission state for a fresh start.
    pub fn reset(&mut self) {
        self.conversation.clear();
        self.checklist.clear();
        self.handoff_queue.clear();
        self.pending_handoff = None;
        self.status = MissionStatus::Idle;
        self.cancel.store(false, Ordering::Relaxed);
    }

    /// Decide who resumes after a human approve/reject decision. Safe to
    /// call with no prior paused turn; that yields a harmless same-agent
    /// continuation.
    pub fn handle_approval_signal(
        &mut self,
        approved: bool,
        feedback: Option<&str>,
    ) -> ApprovalResume {
        let last = self.conversation.last();
        let last_agent = last
            .map(|entry| entry.agent)
            .unwrap_or(self.cfg.orchestrator.lead_agent);
        let signaled = |kind: &CueKind| {
            last.is_some_and(|entry| entry.cues.iter().any(|cue| cue.kind == *kind))
        };

        if !approved {
            self.pending_handoff = None;
            let detail = feedback
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(|text| format!("The human rejected your proposed file changes: {text}"))
                .unwrap_or_else(|| {
                    "The human rejected your proposed file changes. Try a different approach."
                        .to_string()
                });
            return ApprovalResume {
                next_agent: Some(last_agent),
                message: detail,
            };
        }

        if signaled(&CueKind::ProjectComplete) && self.checklist.is_complete() {
            self.finish_mission();
            return ApprovalResume {
                next_agent: None,
                message: "Changes approved. The mission is complete.".to_string(),
            };
        }

        if let Some(target) = self.pending_handoff.take() {
            return ApprovalResume {
                next_agent: Some(target),
                message: format!(
                    "The human approved {last_agent}'s file changes. Continue the mission."
                ),
            };
        }

        if let Some(next) = self.handoff_queue.pop_front() {
            return ApprovalResume {
                next_agent: Some(next),
                message: "The previous changes were approved. You are up next; continue the mission."
                    .to_string(),
            };
        }

        if signaled(&CueKind::Done) && self.checklist.is_active() && !self.checklist.is_complete()
        {
            let remaining = render_incomplete(&self.checklist);
            return ApprovalResume {
                next_agent: Some(self.cfg.orchestrator.lead_agent),
                message: format!(
                    "Changes approved, but checklist steps remain:\n{remaining}\nDecide the next step."
                ),
            };
        }

        ApprovalResume {
            next_agent: Some(last_agent),
            message: "The human approved your file changes. Continue your work.".to_string(),
        }
    }

    fn run_loop(&mut self, mut current_message: String, sink: &EventSink) -> Result<TurnOutcome> {
        let mut turn: u64 = 0;
        while turn < self.cfg.orchestrator.max_turns {
            if self.cancel.load(Ordering::Relaxed) {
                self.emit(sink, OrchestratorEvent::AgentStatus {
                    status: "stopped".to_string(),
                });
                return Ok(TurnOutcome::Cancelled);
            }
            turn += 1;
            let agent = self.current_agent;
            self.emit(sink, OrchestratorEvent::AgentStart { agent, turn });

            let (thoughts, message_text) = match self.stream_turn(agent, &current_message, sink) {
                Ok(parts) => parts,
                Err(err) => {
                    // A failed turn ends the call; half-produced responses
                    // are never retried or recorded.
                    self.observer.warn_log(&format!("{agent} stream failed: {err:#}"));
                    self.emit(sink, OrchestratorEvent::Error {
                        agent,
                        content: format!("{err:#}"),
                    });
                    return Ok(TurnOutcome::Finished);
                }
            };
            if self.cancel.load(Ordering::Relaxed) {
                self.emit(sink, OrchestratorEvent::AgentStatus {
                    status: "stopped".to_string(),
                });
                return Ok(TurnOutcome::Cancelled);
            }

            let cues = extract_cues(&message_text);

            if self
                .checklist
                .parse_checklist(&message_text, self.cfg.orchestrator.fallback_owner)
            {
                self.emit(sink, OrchestratorEvent::ChecklistCreated {
                    mission: self.checklist.mission().to_string(),
                    items: self.checklist.items().to_vec(),
                });
            }
            let newly = self.checklist.apply_updates(&message_text);
            if !newly.is_empty() {
                self.emit(sink, OrchestratorEvent::ChecklistUpdated {
                    newly_completed: newly,
                    remaining: self.checklist.remaining(),
                });
            }

            let visible = sanitize(&message_text, &cues);
            self.conversation.push(ConversationMessage {
                agent,
                visible_content: visible.clone(),
                thoughts: (!thoughts.is_empty()).then_some(thoughts),
                cues: cues.clone(),
                at: Utc::now(),
            });
            self.emit(sink, OrchestratorEvent::AgentDone {
                agent,
                message: visible.clone(),
            });

            // File proposals pre-empt everything else: acting further against
            // unapproved filesystem state risks stale or phantom content.
            let mut proposed_any = false;
            let mut failures: Vec<String> = Vec::new();
            for cue in &cues {
                let CueKind::FileChange { action, path } = &cue.kind else {
                    continue;
                };
                let content = if *action == FileAction::Delete {
                    String::new()
                } else {
                    let body = file_change_content(&message_text, cue, &cues);
                    if body.is_empty() {
                        failures.push(format!("{path}: no code block followed the cue"));
                        continue;
                    }
                    body
                };
                match self.files.create_pending_change(path, *action, content, agent) {
                    Ok(id) => {
                        proposed_any = true;
                        if let Some(change) = self.files.pending(id) {
                            self.emit(sink, OrchestratorEvent::FileChange {
                                change_id: change.id,
                                action: change.action,
                                path: change.path.clone(),
                                agent,
                                old_content: change.old_content.clone(),
                                new_content: change.new_content.clone(),
                            });
                        }
                    }
                    Err(err) => failures.push(format!("{path}: {err:#}")),
                }
            }
            if proposed_any {
                self.pending_handoff = first_handoff(&cues, agent);
                for target in extra_handoffs(&cues, agent, self.pending_handoff) {
                    if !self.handoff_queue.contains(&target) {
                        self.handoff_queue.push_back(target);
                    }
                }
                self.emit(sink, OrchestratorEvent::AgentStatus {
                    status: "awaiting approval".to_string(),
                });
                return Ok(TurnOutcome::AwaitingApproval);
            }
            if !failures.is_empty() {
                current_message = format!(
                    "Your file changes could not be registered:\n{}\nAdjust and propose them again.",
                    failures.join("\n")
                );
                continue;
            }

            // One tool cue per turn, in fixed priority order; the same agent
            // keeps the floor with the result injected as the next message.
            if let Some(action) = pick_action(&cues) {
                current_message = self.service_action(&action, sink);
                continue;
            }

            if cues.iter().any(|cue| cue.kind == CueKind::ProjectComplete) {
                if !self.checklist.is_complete() {
                    let remaining = render_incomplete(&self.checklist);
                    current_message = format!(
                        "You signaled [PROJECT_COMPLETE] but checklist steps remain:\n{remaining}\nFinish or delegate them first."
                    );
                    continue;
                }
                self.finish_mission();
                self.emit(sink, OrchestratorEvent::Complete {
                    turns: turn,
                    conversation_length: self.conversation.len(),
                });
                return Ok(TurnOutcome::MissionComplete);
            }

            let handoff = first_handoff(&cues, agent);
            let has_done = cues.iter().any(|cue| cue.kind == CueKind::Done);

            let target = if let Some(target) = handoff {
                Some(target)
            } else if has_done {
                // A queued teammate stands in for an explicit handoff.
                self.handoff_queue.pop_front()
            } else {
                None
            };

            if let Some(target) = target {
                for extra in extra_handoffs(&cues, agent, Some(target)) {
                    if !self.handoff_queue.contains(&extra) {
                        self.handoff_queue.push_back(extra);
                    }
                }
                self.emit(sink, OrchestratorEvent::Handoff {
                    from: agent,
                    to: target,
                    cue: target.handoff_cue(),
                });
                self.current_agent = target;
                current_message = format!(
                    "{agent} handed the mission to you. Their message:\n{visible}\n\nContinue the mission."
                );
                continue;
            }

            if has_done {
                // "Done for now" is distinct from mission complete.
                return Ok(TurnOutcome::Finished);
            }

            let self_mention_only = cues
                .iter()
                .any(|cue| matches!(cue.kind, CueKind::Handoff { target } if target == agent));
            if self_mention_only {
                // Self-handoff is a no-op mention, not a termination.
                current_message = "Continue with your current work.".to_string();
                continue;
            }

            return Ok(TurnOutcome::Finished);
        }

        self.observer.warn_log(&format!(
            "max turns ({}) reached; ending mission call",
            self.cfg.orchestrator.max_turns
        ));
        self.emit(sink, OrchestratorEvent::AgentStatus {
            status: "max turns reached".to_string(),
        });
        Ok(TurnOutcome::Finished)
    }

    /// Stream one agent turn through the splitter, forwarding thought and
    /// message deltas live, and return the accumulated (thoughts, message).
    fn stream_turn(
        &mut self,
        agent: AgentRole,
        current_message: &str,
        sink: &EventSink,
    ) -> Result<(String, String)> {
        let system = prompts::system_prompt(agent);
        // Listing failures degrade to an empty section, not a failed turn.
        let listing = self.files.list().unwrap_or_default();
        let prompt = prompts::build_prompt(
            &self.conversation,
            self.cfg.orchestrator.history_window,
            &listing,
            current_message,
            &self.checklist.summary(),
        );

        let mut splitter = ThoughtSplitter::new();
        let mut thoughts = String::new();
        let mut message = String::new();
        let mut forward = |event: StreamEvent| match event {
            StreamEvent::Thought(content) => {
                thoughts.push_str(&content);
                sink(&OrchestratorEvent::Thought { agent, content });
            }
            StreamEvent::Message(content) => {
                message.push_str(&content);
                sink(&OrchestratorEvent::Message { agent, content });
            }
        };

        self.backend
            .stream(&system, &prompt, &self.cancel, &mut |delta| {
                for event in splitter.push(delta) {
                    forward(event);
                }
            })?;
        if let Some(event) = splitter.finish() {
            forward(event);
        }
        Ok((thoughts, message))
    }

    /// Invoke the collaborator behind one tool cue. Failures are converted
    /// into natural-language messages for the same agent, never propagated.
    fn service_action(&mut self, action: &CueKind, sink: &EventSink) -> String {
        match action {
            CueKind::FileRead { path } => {
                self.emit(sink, OrchestratorEvent::AgentStatus {
                    status: format!("reading {path}"),
                });
                match self.files.read(path) {
                    Ok(Some(content)) => {
                        format!("Content of {path}:\n```\n{content}\n```\nContinue with your task.")
                    }
                    Ok(None) => format!("File {path} does not exist. Continue with your task."),
                    Err(err) => format!("Could not read {path}: {err:#}. Continue with your task."),
                }
            }
            CueKind::FileSearch { pattern } => {
                self.emit(sink, OrchestratorEvent::AgentStatus {
                    status: format!("searching files for {pattern}"),
                });
                match self.files.search(pattern) {
                    Ok(hits) if hits.is_empty() => {
                        format!("No project files match '{pattern}'. Continue with your task.")
                    }
                    Ok(hits) => {
                        let listing = hits
                            .iter()
                            .map(|hit| format!("- {} ({} bytes)", hit.path, hit.size))
                            .collect::<Vec<_>>()
                            .join("\n");
                        format!("Files matching '{pattern}':\n{listing}\nContinue with your task.")
                    }
                    Err(err) => {
                        format!("File search for '{pattern}' failed: {err:#}. Continue with your task.")
                    }
                }
            }
            CueKind::SubResearch { query } => {
                self.emit(sink, OrchestratorEvent::AgentStatus {
                    status: format!("researching \"{query}\""),
                });
                match self.web.sub_research(query) {
                    Ok(report) => {
                        let mut out = format!("Research notes for \"{query}\":\n");
                        for hit in &report.hits {
                            out.push_str(&format!(
                                "- {}: {} ({})\n",
                                hit.title, hit.snippet, hit.url
                            ));
                        }
                        for page in &report.pages {
                            out.push_str(&format!("\nExcerpt from {}:\n{}\n", page.url, page.content));
                        }
                        out.push_str("\nUse these findings to continue your task.");
                        out
                    }
                    Err(err) => {
                        format!("Research for \"{query}\" failed: {err:#}. Continue without it.")
                    }
                }
            }
            CueKind::UrlRead { url } => {
                self.emit(sink, OrchestratorEvent::AgentStatus {
                    status: format!("fetching {url}"),
                });
                match self.web.fetch_page(url) {
                    Ok(Some(text)) => format!("Content of {url}:\n{text}\nContinue with your task."),
                    Ok(None) => format!("Could not fetch {url}. Continue without it."),
                    Err(err) => format!("Fetching {url} failed: {err:#}. Continue without it."),
                }
            }
            CueKind::WebSearch { query } => {
                self.emit(sink, OrchestratorEvent::AgentStatus {
                    status: format!("searching the web for \"{query}\""),
                });
                match self.web.search(query) {
                    Ok(hits) if hits.is_empty() => {
                        format!("The web search for \"{query}\" returned no results. Continue without it.")
                    }
                    Ok(hits) => {
                        let listing = hits
                            .iter()
                            .map(|hit| format!("- {}: {} ({})", hit.title, hit.snippet, hit.url))
                            .collect::<Vec<_>>()
                            .join("\n");
                        format!("Search results for \"{query}\":\n{listing}\nContinue with your task.")
                    }
                    Err(err) => {
                        format!("The web search for \"{query}\" failed: {err:#}. Continue without it.")
                    }
                }
            }
            CueKind::RunCommand { command } | CueKind::RunTests { command } => {
                let label = if matches!(action, CueKind::RunTests { .. }) {
                    "tests"
                } else {
                    "command"
                };
                self.emit(sink, OrchestratorEvent::AgentStatus {
                    status: format!("running {label}: {command}"),
                });
                let timeout = Duration::from_secs(self.cfg.shell.timeout_seconds);
                match self.shell.run(command, &self.workspace, timeout) {
                    Ok(result) => format_shell_result(label, command, &result),
                    Err(err) => {
                        format!("Running the {label} '{command}' failed: {err:#}. Continue with your task.")
                    }
                }
            }
            _ => String::new(),
        }
    }

    fn finish_mission(&mut self) {
        self.checklist.clear();
        self.handoff_queue.clear();
        self.pending_handoff = None;
        self.status = MissionStatus::Idle;
    }

    fn emit(&self, sink: &EventSink, event: OrchestratorEvent) {
        let _ = self.observer.record_event(&event);
        sink(&event);
    }
}

/// Keyword routing for the first agent of a mission when the caller does not
/// name one explicitly.
pub fn select_initial_agent(text: &str) -> AgentRole {
    let lowered = text.to_lowercase();
    let mentions = |words: &[&str]| words.iter().any(|word| lowered.contains(word));
    if mentions(&["test", "coverage"]) {
        AgentRole::UnitTester
    } else if mentions(&["research", "search", "find", "look up", "latest", "docs"]) {
        AgentRole::Researcher
    } else if mentions(&["implement", "create", "build", "code"]) {
        AgentRole::JuniorDev
    } else {
        AgentRole::SeniorDev
    }
}

/// First handoff cue naming someone other than the current agent.
fn first_handoff(cues: &[Cue], current: AgentRole) -> Option<AgentRole> {
    cues.iter().find_map(|cue| match cue.kind {
        CueKind::Handoff { target } if target != current => Some(target),
        _ => None,
    })
}

/// Remaining handoff targets, excluding the current agent and the chosen one.
fn extra_handoffs(cues: &[Cue], current: AgentRole, chosen: Option<AgentRole>) -> Vec<AgentRole> {
    let mut extras = Vec::new();
    for cue in cues {
        if let CueKind::Handoff { target } = cue.kind
            && target != current
            && Some(target) != chosen
            && !extras.contains(&target)
        {
            extras.push(target);
        }
    }
    extras
}

/// The single tool cue serviced this turn, if any, by fixed priority:
/// file-read, file-search, sub-research, url-read, web-search, run-command,
/// run-tests.
fn pick_action(cues: &[Cue]) -> Option<CueKind> {
    fn priority(kind: &CueKind) -> Option<u8> {
        match kind {
            CueKind::FileRead { .. } => Some(0),
            CueKind::FileSearch { .. } => Some(1),
            CueKind::SubResearch { .. } => Some(2),
            CueKind::UrlRead { .. } => Some(3),
            CueKind::WebSearch { .. } => Some(4),
            CueKind::RunCommand { .. } => Some(5),
            CueKind::RunTests { .. } => Some(6),
            _ => None,
        }
    }
    cues.iter()
        .filter_map(|cue| priority(&cue.kind).map(|p| (p, cue.kind.clone())))
        .min_by_key(|(p, _)| *p)
        .map(|(_, kind)| kind)
}

fn render_incomplete(checklist: &ChecklistTracker) -> String {
    checklist
        .incomplete_steps()
        .iter()
        .map(|item| format!("- {}. {} (→{})", item.step, item.description, item.owner.cue_token()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_shell_result(label: &str, command: &str, result: &ShellRunResult) -> String {
    let mut out = format!("Output of the {label} '{command}'");
    match result.status {
        Some(code) => out.push_str(&format!(" (exit code {code})")),
        None => out.push_str(" (no exit code)"),
    }
    if result.timed_out {
        out.push_str(", timed out");
    }
    out.push_str(":\n");
    if !result.stdout.trim().is_empty() {
        out.push_str(&format!("stdout:\n```\n{}\n```\n", result.stdout.trim_end()));
    }
    if !result.stderr.trim().is_empty() {
        out.push_str(&format!("stderr:\n```\n{}\n```\n", result.stderr.trim_end()));
    }
    if result.stdout.trim().is_empty() && result.stderr.trim().is_empty() {
        out.push_str("(no output)\n");
    }
    out.push_str("Continue with your task.");
    out
}
