use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand};
use ensemble_core::{AgentRole, AppConfig, EventSink, MissionStatus, OrchestratorEvent};
use ensemble_llm::HttpBackend;
use ensemble_orchestrator::{Orchestrator, PlatformShellRunner, TurnOutcome};
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "ensemble")]
#[command(about = "Multi-agent coding team driven by inline cues", long_about = None)]
struct Cli {
    /// Enable verbose logging (thoughts and status lines to stderr).
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Auto-approve all proposed file changes (non-interactive runs).
    #[arg(long = "yes", global = true)]
    auto_approve: bool,

    /// Agent that takes the first turn (senior, junior, tester, researcher).
    #[arg(long = "agent", global = true)]
    initial_agent: Option<String>,

    /// Override the per-mission turn ceiling.
    #[arg(long = "max-turns", global = true)]
    max_turns: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive mission loop (default).
    Chat,
    /// One non-streaming exchange, printed and exited.
    Ask(AskArgs),
    /// Show configuration and workspace state.
    Status,
    /// Write default settings for this workspace.
    Init,
}

#[derive(Args)]
struct AskArgs {
    prompt: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir()?;

    let mut cfg = AppConfig::ensure(&cwd)?;
    if let Some(max_turns) = cli.max_turns {
        cfg.orchestrator.max_turns = max_turns;
    }

    match cli.command.as_ref().unwrap_or(&Commands::Chat) {
        Commands::Chat => run_chat(&cwd, cfg, &cli),
        Commands::Ask(args) => run_ask(&cwd, cfg, &args.prompt),
        Commands::Status => run_status(&cwd, &cfg),
        Commands::Init => {
            cfg.save(&cwd)?;
            println!(
                "Wrote {}",
                AppConfig::project_settings_path(&cwd).display()
            );
            Ok(())
        }
    }
}

fn build_orchestrator(workspace: &Path, cfg: AppConfig) -> Result<Orchestrator> {
    let backend = HttpBackend::new(cfg.llm.clone())?;
    Orchestrator::new(
        workspace,
        cfg,
        Box::new(backend),
        Box::new(PlatformShellRunner),
    )
}

fn run_ask(workspace: &Path, cfg: AppConfig, prompt: &str) -> Result<()> {
    let mut orch = build_orchestrator(workspace, cfg)?;
    let reply = orch.respond_once(prompt)?;
    println!("{reply}");
    Ok(())
}

fn run_status(workspace: &Path, cfg: &AppConfig) -> Result<()> {
    println!("workspace: {}", workspace.display());
    println!("model:     {} ({})", cfg.llm.model, cfg.llm.endpoint);
    println!("max turns: {}", cfg.orchestrator.max_turns);
    println!(
        "settings:  {}",
        AppConfig::project_settings_path(workspace).display()
    );
    let key_set = std::env::var(&cfg.llm.api_key_env).is_ok_and(|v| !v.trim().is_empty());
    println!(
        "api key:   {} ({})",
        if key_set { "set" } else { "missing" },
        cfg.llm.api_key_env
    );
    Ok(())
}

fn run_chat(workspace: &Path, cfg: AppConfig, cli: &Cli) -> Result<()> {
    let initial_agent = cli
        .initial_agent
        .as_deref()
        .map(parse_agent)
        .transpose()?;
    let mut orch = build_orchestrator(workspace, cfg)?;
    orch.set_verbose(cli.verbose);
    let sink = printing_sink(cli.verbose);

    println!("ensemble: type a mission, /status, or /quit");
    let stdin = std::io::stdin();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(());
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        match input {
            "/quit" | "/exit" => return Ok(()),
            "/clear" => {
                orch.reset();
                println!("conversation cleared");
                continue;
            }
            "/status" => {
                let status = match orch.status() {
                    MissionStatus::Idle => "idle",
                    MissionStatus::InProgress => "in progress",
                };
                println!(
                    "mission {status}, {} messages, current agent {}",
                    orch.conversation().len(),
                    orch.current_agent()
                );
                if orch.checklist().is_active() {
                    print!("{}", orch.checklist().summary());
                }
                continue;
            }
            _ => {}
        }

        let outcome = orch.process_message(input, initial_agent, &sink)?;
        drive_to_rest(&mut orch, outcome, &sink, cli.auto_approve)?;
    }
}

/// Run the approval loop until the mission call reaches a non-resumable
/// outcome. A resumed turn may pause again; each pause goes back to the
/// human (or auto-approval).
fn drive_to_rest(
    orch: &mut Orchestrator,
    first: TurnOutcome,
    sink: &EventSink,
    auto_approve: bool,
) -> Result<()> {
    let mut outcome = first;
    while outcome == TurnOutcome::AwaitingApproval {
        let decision = ask_approval(orch, auto_approve)?;
        let ids: Vec<Uuid> = orch
            .files()
            .list_pending()
            .iter()
            .map(|change| change.id)
            .collect();
        for id in ids {
            if decision.approved {
                let change = orch.files().apply(id)?;
                println!("applied {} ({})", change.path, change.action.as_str());
            } else {
                let change = orch.files().reject(id)?;
                println!("rejected {}", change.path);
            }
        }
        let resume = orch.handle_approval_signal(decision.approved, decision.feedback.as_deref());
        match resume.next_agent {
            Some(agent) => outcome = orch.continue_with(agent, &resume.message, sink)?,
            None => {
                println!("{}", resume.message);
                return Ok(());
            }
        }
    }
    if outcome == TurnOutcome::MissionComplete {
        println!("mission complete");
    }
    Ok(())
}

struct ApprovalDecision {
    approved: bool,
    feedback: Option<String>,
}

fn ask_approval(orch: &mut Orchestrator, auto_approve: bool) -> Result<ApprovalDecision> {
    println!("\nproposed file changes:");
    for change in orch.files().list_pending() {
        println!(
            "  {} {} ({} bytes, by {})",
            change.action.as_str(),
            change.path,
            change.new_content.len(),
            change.proposed_by
        );
    }
    if auto_approve {
        println!("auto-approving (--yes)");
        return Ok(ApprovalDecision {
            approved: true,
            feedback: None,
        });
    }
    print!("approve? [y/N, or type feedback to reject with a note] ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let input = line.trim();
    match input.to_ascii_lowercase().as_str() {
        "y" | "yes" => Ok(ApprovalDecision {
            approved: true,
            feedback: None,
        }),
        "" | "n" | "no" => Ok(ApprovalDecision {
            approved: false,
            feedback: None,
        }),
        _ => Ok(ApprovalDecision {
            approved: false,
            feedback: Some(input.to_string()),
        }),
    }
}

fn printing_sink(verbose: bool) -> EventSink {
    Arc::new(move |event: &OrchestratorEvent| match event {
        OrchestratorEvent::AgentStart { agent, turn } => {
            println!("\n── {agent} (turn {turn}) ──");
        }
        OrchestratorEvent::Message { content, .. } => {
            print!("{content}");
            let _ = std::io::stdout().flush();
        }
        OrchestratorEvent::Thought { content, .. } => {
            if verbose {
                eprint!("{content}");
                let _ = std::io::stderr().flush();
            }
        }
        OrchestratorEvent::AgentDone { .. } => {
            println!();
        }
        OrchestratorEvent::AgentStatus { status } => {
            eprintln!("[{status}]");
        }
        OrchestratorEvent::Handoff { from, to, .. } => {
            println!("\n[{from} → {to}]");
        }
        OrchestratorEvent::FileChange { action, path, .. } => {
            println!("\n[proposed: {} {path}]", action.as_str());
        }
        OrchestratorEvent::ChecklistCreated { mission, items } => {
            println!("\n[checklist created: {mission} ({} steps)]", items.len());
        }
        OrchestratorEvent::ChecklistUpdated {
            newly_completed,
            remaining,
        } => {
            println!(
                "\n[checklist: {} step(s) done, {remaining} remaining]",
                newly_completed.len()
            );
        }
        OrchestratorEvent::Error { agent, content } => {
            eprintln!("\n[{agent} error: {content}]");
        }
        OrchestratorEvent::Complete {
            turns,
            conversation_length,
        } => {
            println!("\n[mission complete after {turns} turn(s), {conversation_length} messages]");
        }
    })
}

fn parse_agent(name: &str) -> Result<AgentRole> {
    let normalized = name.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "senior" | "senior dev" => Ok(AgentRole::SeniorDev),
        "junior" | "junior dev" => Ok(AgentRole::JuniorDev),
        "tester" | "unit tester" => Ok(AgentRole::UnitTester),
        "research" | "researcher" => Ok(AgentRole::Researcher),
        other => Err(anyhow!(
            "unknown agent '{other}' (expected senior, junior, tester or researcher)"
        )),
    }
}
