//! End-to-end turn-loop behavior against a scripted backend: handoffs,
//! approval pauses, checklist gating, tool continuations and termination.

use anyhow::{Result, anyhow};
use ensemble_core::{
    AgentRole, AppConfig, EventSink, MissionStatus, OrchestratorEvent,
};
use ensemble_llm::AgentBackend;
use ensemble_orchestrator::{Orchestrator, PlatformShellRunner, TurnOutcome};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct ScriptInner {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

/// Backend that replays canned responses and records the prompts it saw.
#[derive(Clone, Default)]
struct ScriptedBackend(Arc<ScriptInner>);

impl ScriptedBackend {
    fn with_replies(replies: &[&str]) -> Self {
        let backend = Self::default();
        *backend.0.replies.lock().unwrap() =
            replies.iter().map(|r| (*r).to_string()).collect();
        backend
    }

    fn prompts(&self) -> Vec<String> {
        self.0.prompts.lock().unwrap().clone()
    }

    fn next(&self, prompt: &str) -> Result<String> {
        self.0.prompts.lock().unwrap().push(prompt.to_string());
        self.0
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("script exhausted"))
    }
}

impl AgentBackend for ScriptedBackend {
    fn generate(&self, _system: &str, prompt: &str) -> Result<String> {
        self.next(prompt)
    }

    fn stream(
        &self,
        _system: &str,
        prompt: &str,
        _cancel: &AtomicBool,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<String> {
        let text = self.next(prompt)?;
        // Small chunks so tag boundaries land mid-token in the splitter.
        let chars: Vec<char> = text.chars().collect();
        for chunk in chars.chunks(5) {
            on_delta(&chunk.iter().collect::<String>());
        }
        Ok(text)
    }
}

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.web.enabled = false;
    cfg.shell.timeout_seconds = 5;
    cfg
}

fn orchestrator(workspace: &Path, replies: &[&str]) -> (Orchestrator, ScriptedBackend) {
    let backend = ScriptedBackend::with_replies(replies);
    let orch = Orchestrator::new(
        workspace,
        test_config(),
        Box::new(backend.clone()),
        Box::new(PlatformShellRunner),
    )
    .expect("orchestrator");
    (orch, backend)
}

fn capture() -> (EventSink, Arc<Mutex<Vec<OrchestratorEvent>>>) {
    let events: Arc<Mutex<Vec<OrchestratorEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let tap = events.clone();
    let sink: EventSink = Arc::new(move |event: &OrchestratorEvent| {
        tap.lock().unwrap().push(event.clone());
    });
    (sink, events)
}

fn agent_starts(events: &[OrchestratorEvent]) -> Vec<(AgentRole, u64)> {
    events
        .iter()
        .filter_map(|event| match event {
            OrchestratorEvent::AgentStart { agent, turn } => Some((*agent, *turn)),
            _ => None,
        })
        .collect()
}

fn handoffs(events: &[OrchestratorEvent]) -> Vec<(AgentRole, AgentRole)> {
    events
        .iter()
        .filter_map(|event| match event {
            OrchestratorEvent::Handoff { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

#[test]
fn linear_handoff_wins_over_done() {
    let dir = tempfile::tempdir().expect("workspace");
    let (mut orch, _) = orchestrator(
        dir.path(),
        &["Done. [→SENIOR][DONE]", "Looks good to me. [DONE]"],
    );
    let (sink, events) = capture();

    let outcome = orch
        .process_message("implement the parser", Some(AgentRole::JuniorDev), &sink)
        .expect("process");

    assert_eq!(outcome, TurnOutcome::Finished);
    let events = events.lock().unwrap();
    assert_eq!(
        agent_starts(&events),
        vec![(AgentRole::JuniorDev, 1), (AgentRole::SeniorDev, 2)]
    );
    assert_eq!(
        handoffs(&events),
        vec![(AgentRole::JuniorDev, AgentRole::SeniorDev)]
    );
    // "Done for now" is not mission complete.
    assert_eq!(orch.status(), MissionStatus::InProgress);
    // The persisted entry is sanitized.
    assert_eq!(orch.conversation()[0].visible_content, "Done. @Senior Dev");
}

#[test]
fn file_edit_with_handoff_pauses_and_stashes_target() {
    let dir = tempfile::tempdir().expect("workspace");
    let (mut orch, _) = orchestrator(
        dir.path(),
        &[
            "[EDIT_FILE:a.py]\n```python\nx = 1\n```\n[→SENIOR]",
            "Reviewed the change. [DONE]",
        ],
    );
    let (sink, events) = capture();

    let outcome = orch
        .process_message("fix a.py", Some(AgentRole::JuniorDev), &sink)
        .expect("process");

    assert_eq!(outcome, TurnOutcome::AwaitingApproval);
    {
        let events = events.lock().unwrap();
        assert!(handoffs(&events).is_empty(), "pause must pre-empt handoff");
        assert!(events.iter().any(|event| matches!(
            event,
            OrchestratorEvent::FileChange { path, .. } if path == "a.py"
        )));
    }

    let pending: Vec<_> = orch.files().list_pending().iter().map(|c| c.id).collect();
    assert_eq!(pending.len(), 1);
    orch.files().apply(pending[0]).expect("apply");
    assert_eq!(
        std::fs::read_to_string(dir.path().join("a.py")).expect("read"),
        "x = 1"
    );

    let resume = orch.handle_approval_signal(true, None);
    assert_eq!(resume.next_agent, Some(AgentRole::SeniorDev));
    assert!(resume.message.contains("approved"));

    let outcome = orch
        .continue_with(AgentRole::SeniorDev, &resume.message, &sink)
        .expect("continue");
    assert_eq!(outcome, TurnOutcome::Finished);
}

#[test]
fn rejection_resumes_proposer_with_feedback() {
    let dir = tempfile::tempdir().expect("workspace");
    let (mut orch, _) = orchestrator(
        dir.path(),
        &["[CREATE_FILE:b.py]\n```python\ny = 2\n```"],
    );
    let (sink, _) = capture();

    let outcome = orch
        .process_message("create b.py", Some(AgentRole::JuniorDev), &sink)
        .expect("process");
    assert_eq!(outcome, TurnOutcome::AwaitingApproval);

    let pending: Vec<_> = orch.files().list_pending().iter().map(|c| c.id).collect();
    orch.files().reject(pending[0]).expect("reject");
    assert!(!dir.path().join("b.py").exists());

    let resume = orch.handle_approval_signal(false, Some("use tabs not spaces"));
    assert_eq!(resume.next_agent, Some(AgentRole::JuniorDev));
    assert!(resume.message.contains("use tabs not spaces"));
}

#[test]
fn approval_signal_without_pause_is_harmless() {
    let dir = tempfile::tempdir().expect("workspace");
    let (mut orch, _) = orchestrator(dir.path(), &[]);
    let resume = orch.handle_approval_signal(true, None);
    assert!(resume.next_agent.is_some());
    assert!(!resume.message.is_empty());
}

#[test]
fn tool_use_keeps_the_floor() {
    let dir = tempfile::tempdir().expect("workspace");
    std::fs::write(dir.path().join("notes.txt"), "remember the edge case").expect("write");
    let (mut orch, backend) = orchestrator(
        dir.path(),
        &["Let me check. [READ_FILE:notes.txt]", "Got it. [DONE]"],
    );
    let (sink, events) = capture();

    let outcome = orch
        .process_message("summarize notes", Some(AgentRole::Researcher), &sink)
        .expect("process");
    assert_eq!(outcome, TurnOutcome::Finished);

    let events = events.lock().unwrap();
    assert!(handoffs(&events).is_empty());
    assert_eq!(
        agent_starts(&events),
        vec![(AgentRole::Researcher, 1), (AgentRole::Researcher, 2)]
    );
    // The workspace listing is visible from the first prompt; the file
    // content only arrives after the read cue is serviced.
    let prompts = backend.prompts();
    assert!(prompts[0].contains("- notes.txt (22 bytes)"));
    assert!(!prompts[0].contains("remember the edge case"));
    assert!(prompts[1].contains("remember the edge case"));
}

#[test]
fn web_search_failure_feeds_back_to_same_agent() {
    let dir = tempfile::tempdir().expect("workspace");
    // Web is disabled in the test config; the search fails and the failure
    // text goes back to the same agent as the next message.
    let (mut orch, backend) = orchestrator(
        dir.path(),
        &["[SEARCH:\"rust atomics\"]", "Proceeding without it. [DONE]"],
    );
    let (sink, events) = capture();

    let outcome = orch
        .process_message("look into atomics", Some(AgentRole::Researcher), &sink)
        .expect("process");
    assert_eq!(outcome, TurnOutcome::Finished);

    let events = events.lock().unwrap();
    assert!(handoffs(&events).is_empty());
    assert!(events.iter().any(|event| matches!(
        event,
        OrchestratorEvent::AgentStatus { status } if status.contains("searching the web")
    )));
    assert!(backend.prompts()[1].contains("failed"));
}

#[test]
fn completion_gate_blocks_incomplete_checklist() {
    let dir = tempfile::tempdir().expect("workspace");
    let (mut orch, backend) = orchestrator(
        dir.path(),
        &[
            "[MISSION_CHECKLIST]\nMission: Demo\n- [ ] 1. Build it (→JUNIOR)\n- [ ] 2. Test it (→TESTER)\n[/MISSION_CHECKLIST]\n[CHECKLIST_UPDATE]\n- [x] 1. Build it\n[/CHECKLIST_UPDATE]\nAll set. [PROJECT_COMPLETE]",
            "[CHECKLIST_UPDATE]\n- [x] 2. Test it\n[/CHECKLIST_UPDATE]\nNow truly done. [PROJECT_COMPLETE]",
        ],
    );
    let (sink, events) = capture();

    let outcome = orch
        .process_message("ship the demo", Some(AgentRole::SeniorDev), &sink)
        .expect("process");

    assert_eq!(outcome, TurnOutcome::MissionComplete);
    assert_eq!(orch.status(), MissionStatus::Idle);
    assert!(!orch.checklist().is_active());

    let events = events.lock().unwrap();
    assert!(events
        .iter()
        .any(|event| matches!(event, OrchestratorEvent::ChecklistCreated { items, .. } if items.len() == 2)));
    assert!(events
        .iter()
        .any(|event| matches!(event, OrchestratorEvent::Complete { turns: 2, .. })));
    // The corrective message enumerated the missing step.
    let prompts = backend.prompts();
    assert!(prompts[1].contains("2. Test it"));
    assert!(prompts[1].contains("[PROJECT_COMPLETE]"));
}

#[test]
fn self_handoff_is_a_noop_that_continues() {
    let dir = tempfile::tempdir().expect("workspace");
    let (mut orch, _) = orchestrator(
        dir.path(),
        &["Still working. [→JUNIOR]", "Finished. [DONE]"],
    );
    let (sink, events) = capture();

    let outcome = orch
        .process_message("keep going", Some(AgentRole::JuniorDev), &sink)
        .expect("process");
    assert_eq!(outcome, TurnOutcome::Finished);

    let events = events.lock().unwrap();
    assert!(handoffs(&events).is_empty());
    assert_eq!(
        agent_starts(&events),
        vec![(AgentRole::JuniorDev, 1), (AgentRole::JuniorDev, 2)]
    );
}

#[test]
fn queued_handoff_is_consumed_by_done() {
    let dir = tempfile::tempdir().expect("workspace");
    let (mut orch, _) = orchestrator(
        dir.path(),
        &[
            "Junior first, then the tester: [→JUNIOR] [→TESTER]",
            "Implemented. [DONE]",
            "Tested. [DONE]",
        ],
    );
    let (sink, events) = capture();

    let outcome = orch
        .process_message("build and test", Some(AgentRole::SeniorDev), &sink)
        .expect("process");
    assert_eq!(outcome, TurnOutcome::Finished);

    let events = events.lock().unwrap();
    assert_eq!(
        handoffs(&events),
        vec![
            (AgentRole::SeniorDev, AgentRole::JuniorDev),
            (AgentRole::JuniorDev, AgentRole::UnitTester),
        ]
    );
}

#[test]
fn max_turns_bounds_pathological_output() {
    let dir = tempfile::tempdir().expect("workspace");
    let script = ["No cues here, just looping. [→JUNIOR]"; 10];
    let (sink, events) = capture();

    let mut cfg = test_config();
    cfg.orchestrator.max_turns = 3;
    let backend = ScriptedBackend::with_replies(&script);
    let mut orch = Orchestrator::new(
        dir.path(),
        cfg,
        Box::new(backend),
        Box::new(PlatformShellRunner),
    )
    .expect("orchestrator");

    let outcome = orch
        .process_message("loop forever", Some(AgentRole::JuniorDev), &sink)
        .expect("process");
    assert_eq!(outcome, TurnOutcome::Finished);
    assert_eq!(agent_starts(&events.lock().unwrap()).len(), 3);
}

#[test]
fn thoughts_stream_separately_from_messages() {
    let dir = tempfile::tempdir().expect("workspace");
    let (mut orch, _) = orchestrator(
        dir.path(),
        &["<think>private plan</think>Public answer. [DONE]"],
    );
    let (sink, events) = capture();

    orch.process_message("answer", Some(AgentRole::SeniorDev), &sink)
        .expect("process");

    let events = events.lock().unwrap();
    let thought: String = events
        .iter()
        .filter_map(|event| match event {
            OrchestratorEvent::Thought { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    let message: String = events
        .iter()
        .filter_map(|event| match event {
            OrchestratorEvent::Message { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(thought, "private plan");
    assert_eq!(message, "Public answer. [DONE]");

    let entry = &orch.conversation()[0];
    assert_eq!(entry.thoughts.as_deref(), Some("private plan"));
    assert_eq!(entry.visible_content, "Public answer.");
}

#[test]
fn stream_failure_emits_error_and_ends_call() {
    let dir = tempfile::tempdir().expect("workspace");
    let (mut orch, _) = orchestrator(dir.path(), &[]);
    let (sink, events) = capture();

    let outcome = orch
        .process_message("anything", Some(AgentRole::SeniorDev), &sink)
        .expect("process");
    assert_eq!(outcome, TurnOutcome::Finished);
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, OrchestratorEvent::Error { .. })));
}

/// Delegates to a script and raises the cancel flag during the first stream,
/// the way a Ctrl-C lands while an agent is talking.
#[derive(Clone)]
struct CancelOnFirstStream {
    inner: ScriptedBackend,
    fired: Arc<AtomicBool>,
}

impl AgentBackend for CancelOnFirstStream {
    fn generate(&self, system: &str, prompt: &str) -> Result<String> {
        self.inner.generate(system, prompt)
    }

    fn stream(
        &self,
        system: &str,
        prompt: &str,
        cancel: &AtomicBool,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<String> {
        let text = self.inner.stream(system, prompt, cancel, on_delta)?;
        if !self.fired.swap(true, Ordering::Relaxed) {
            cancel.store(true, Ordering::Relaxed);
        }
        Ok(text)
    }
}

#[test]
fn cancellation_scopes_to_the_interrupted_call() {
    let dir = tempfile::tempdir().expect("workspace");
    let backend = CancelOnFirstStream {
        inner: ScriptedBackend::with_replies(&["Working on it.", "Recovered. [DONE]"]),
        fired: Arc::new(AtomicBool::new(false)),
    };
    let mut orch = Orchestrator::new(
        dir.path(),
        test_config(),
        Box::new(backend),
        Box::new(PlatformShellRunner),
    )
    .expect("orchestrator");
    let (sink, _) = capture();

    let outcome = orch
        .process_message("first attempt", Some(AgentRole::SeniorDev), &sink)
        .expect("process");
    assert_eq!(outcome, TurnOutcome::Cancelled);
    // The interrupted turn records nothing.
    assert!(orch.conversation().is_empty());

    // The flag is re-armed on the next call; the stale cancellation does
    // not bleed into it.
    let outcome = orch
        .process_message("second attempt", Some(AgentRole::SeniorDev), &sink)
        .expect("process");
    assert_eq!(outcome, TurnOutcome::Finished);
    assert_eq!(orch.conversation().len(), 1);
    assert_eq!(orch.conversation()[0].visible_content, "Recovered.");
}

#[test]
fn run_tests_cue_executes_shell_and_continues() {
    let dir = tempfile::tempdir().expect("workspace");
    let (mut orch, backend) = orchestrator(
        dir.path(),
        &["[RUN_TESTS:echo 2 passed]", "Suite is green. [DONE]"],
    );
    let (sink, _) = capture();

    let outcome = orch
        .process_message("run the tests", Some(AgentRole::UnitTester), &sink)
        .expect("process");
    assert_eq!(outcome, TurnOutcome::Finished);
    assert!(backend.prompts()[1].contains("2 passed"));
}
