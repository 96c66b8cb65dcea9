//! Command-line surface (§6): interactive REPL, one-shot query, plan mode,
//! and the `models` admin subcommand. Flag/positional parsing only — the
//! agent wiring it drives lives in [`crate::agent`], [`crate::backend`],
//! [`crate::memory`], [`crate::security`] and [`crate::tools`].

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::agent::{AgentLoop, CancellationToken};
use crate::backend::{ModelBackend, OllamaClient};
use crate::cache::ToolResultCache;
use crate::config::{self, AppConfig, PermissionMode};
use crate::memory::MemoryLayer;
use crate::planner::Planner;
use crate::security::{ApprovalChoice, SecurityPolicy};
use crate::session::{self, SessionRecord};
use crate::tools::ToolRegistry;

#[derive(Parser, Debug)]
#[command(
    name = "vecai",
    about = "A local coding assistant driving an Ollama-backed model through an observe-decide-act loop.",
    disable_version_flag = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Override the configured model for this run.
    #[arg(long, value_name = "NAME")]
    model: Option<String>,

    /// Override the configured model backend base URL.
    #[arg(long = "ollama-url", value_name = "URL")]
    ollama_url: Option<String>,

    /// Approve every tool call automatically, no prompts.
    #[arg(long)]
    auto: bool,

    /// Prompt for every tool call, including reads.
    #[arg(long)]
    strict: bool,

    /// Read-only registry; writes and executes are denied outright.
    #[arg(short = 'a', long = "analyze")]
    analyze: bool,

    /// Print the version and exit.
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// One-shot query words. Absent with no subcommand, the REPL starts.
    #[arg(trailing_var_arg = true)]
    query: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plan a goal as a DAG of steps, then execute them in dependency order.
    Plan {
        #[arg(trailing_var_arg = true, required = true)]
        goal: Vec<String>,
    },
    /// Manage local models served by the backend.
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },
    /// Print the version and exit.
    Version,
}

#[derive(Subcommand, Debug)]
enum ModelsAction {
    /// List models available on the local backend.
    List,
    /// Send a small probe request to confirm the backend is reachable.
    Test,
    /// Download a model to the local backend.
    Pull {
        name: String,
    },
}

/// Parses `argv`, wires up the runtime, and runs to completion. Returns the
/// process exit code (§6: `0` success, `1` any error).
pub async fn run(argv: impl IntoIterator<Item = String>) -> i32 {
    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(e) => {
            // clap's own formatting already matches `help|--help|-h` / usage errors.
            let _ = e.print();
            return if e.exit_code() == 0 { 0 } else { 1 };
        }
    };

    if cli.version || matches!(cli.command, Some(Command::Version)) {
        println!("vecai {}", env!("CARGO_PKG_VERSION"));
        return 0;
    }

    match run_inner(cli).await {
        Ok(()) => 0,
        Err(message) => {
            eprintln!("Error: {message}");
            1
        }
    }
}

struct Runtime {
    backend: Arc<OllamaClient>,
    agent: AgentLoop,
    session: SessionRecord,
    sessions_dir: Option<PathBuf>,
    memory: Arc<MemoryLayer>,
}

async fn run_inner(cli: Cli) -> Result<(), String> {
    let mut config = config::load_default_config();
    apply_overrides(&mut config, &cli);

    let session_id = uuid::Uuid::new_v4().to_string();
    let log_dir = config
        .logging
        .debug_dir
        .as_ref()
        .map(PathBuf::from)
        .or_else(crate::logging::default_log_dir);
    let _logging_guard = crate::logging::init(&config.logging.level, std::env::var("NO_COLOR").is_ok(), log_dir.as_deref(), &session_id);

    match cli.command {
        Some(Command::Models { action }) => return run_models(&config, action).await,
        Some(Command::Version) => unreachable!("handled before run_inner"),
        Some(Command::Plan { goal }) => {
            let goal = goal.join(" ");
            let mut rt = build_runtime(&config, &session_id).await?;
            run_plan(&mut rt, &goal).await?;
            persist_session(&mut rt);
            rt.memory.close().await;
            return Ok(());
        }
        None => {}
    }

    let mut rt = build_runtime(&config, &session_id).await?;

    if cli.query.is_empty() {
        run_interactive(&mut rt).await?;
    } else {
        let query = cli.query.join(" ");
        run_one_shot(&mut rt, &query).await?;
    }

    persist_session(&mut rt);
    rt.memory.close().await;
    Ok(())
}

fn apply_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(model) = &cli.model {
        config.backend.default_model = model.clone();
    }
    if let Some(url) = &cli.ollama_url {
        config.backend.base_url = url.clone();
    }
    // Most-restrictive flag wins when more than one is passed.
    if cli.auto {
        config.permission.mode = PermissionMode::Auto;
    }
    if cli.strict {
        config.permission.mode = PermissionMode::Strict;
    }
    if cli.analyze {
        config.permission.mode = PermissionMode::Analysis;
    }
}

async fn build_runtime(config: &AppConfig, session_id: &str) -> Result<Runtime, String> {
    let backend = Arc::new(OllamaClient::new(
        config.backend.base_url.clone(),
        config.backend.default_model.clone(),
        config.backend.request_timeout_secs,
        config.backend.max_retries,
        config.backend.keep_alive.clone(),
    ));

    let workspace_root = config.permission.workspace_root.as_ref().map(PathBuf::from);
    let blocked_dirs = config.permission.blocked_dirs.iter().map(PathBuf::from).collect();
    let policy = Arc::new(SecurityPolicy::new(
        config.permission.mode,
        workspace_root,
        blocked_dirs,
        config.permission.rate_limit_window_secs,
        config.permission.rate_limit_max_actions,
    ));

    let cache = Arc::new(ToolResultCache::new(config.cache.clone()));

    let mut full_registry = ToolRegistry::new();
    crate::tools::register_builtin_tools(&mut full_registry, policy.clone(), cache.clone());
    let registry = if config.permission.mode == PermissionMode::Analysis {
        Arc::new(full_registry.read_only_subset())
    } else {
        Arc::new(full_registry)
    };

    let memory_root = default_memory_dir().unwrap_or_else(|| PathBuf::from(".vecai/memory"));
    let memory = Arc::new(
        MemoryLayer::open(&memory_root, &config.memory).map_err(|e| format!("failed to open memory stores: {e}"))?,
    );

    let agent = AgentLoop::new(backend.clone(), registry, policy, cache, memory.clone(), &config.agent)
        .with_approval_callback(Arc::new(prompt_for_approval));

    let session = SessionRecord::new(session_id, config.backend.default_model.clone());
    let sessions_dir = session::default_sessions_dir();

    Ok(Runtime { backend, agent, session, sessions_dir, memory })
}

fn default_memory_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".vecai").join("memory"))
}

/// Synchronous stdin prompt used as the permission policy's approval
/// callback (§4.2). Returns `None` — treated as a denial — for
/// non-interactive stdin (e.g. piped input) or an unparsable answer.
fn prompt_for_approval(tool_name: &str, capability: crate::backend::Capability) -> Option<ApprovalChoice> {
    if !io::stdin().is_terminal() {
        return None;
    }
    print!("Allow '{tool_name}' ({capability:?}) to run? [y]es / [s]ession / [N]o: ");
    let _ = io::stdout().flush();

    let mut line = String::new();
    io::stdin().read_line(&mut line).ok()?;
    match line.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(ApprovalChoice::AllowOnce),
        "s" | "session" => Some(ApprovalChoice::AllowSession),
        _ => Some(ApprovalChoice::Deny),
    }
}

async fn run_interactive(rt: &mut Runtime) -> Result<(), String> {
    println!("vecai — local coding assistant. Type 'exit' or Ctrl-D to quit.");
    let cancel = CancellationToken::new();
    install_ctrlc_handler(cancel.clone());

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush().map_err(|e| e.to_string())?;

        let mut line = String::new();
        let bytes = stdin.read_line(&mut line).map_err(|e| e.to_string())?;
        if bytes == 0 {
            break; // EOF (Ctrl-D)
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        rt.session.messages = rt.agent.context().messages();
        match rt.agent.handle_user_message(line, &cancel).await {
            Ok(reply) => println!("{reply}"),
            Err(e) if matches!(e, crate::error::VecaiError::Agent(crate::error::AgentError::Cancelled)) => {
                println!("(cancelled)");
                break;
            }
            Err(e) => eprintln!("Error: {e}"),
        }
        rt.session.messages = rt.agent.context().messages();
        persist_session(rt);
    }
    Ok(())
}

async fn run_one_shot(rt: &mut Runtime, query: &str) -> Result<(), String> {
    let cancel = CancellationToken::new();
    install_ctrlc_handler(cancel.clone());

    let reply = rt.agent.handle_user_message(query, &cancel).await.map_err(|e| e.to_string())?;
    println!("{reply}");
    rt.session.messages = rt.agent.context().messages();
    Ok(())
}

async fn run_plan(rt: &mut Runtime, goal: &str) -> Result<(), String> {
    let cancel = CancellationToken::new();
    install_ctrlc_handler(cancel.clone());

    let planner = Planner::new(rt.backend.clone());
    let mut plan = planner.plan(goal).await;
    println!("plan: {}", plan.summary);

    while !plan.is_complete() {
        let ready: Vec<String> = plan.ready_steps().into_iter().map(|s| s.id.clone()).collect();
        if ready.is_empty() {
            return Err("plan has no ready steps but is not complete (dependency cycle?)".into());
        }
        for step_id in ready {
            let step = plan.steps.iter().find(|s| s.id == step_id).expect("id came from plan.steps").clone();
            println!("→ [{}] {}", step.id, step.description);
            let step_query = format!("Goal: {goal}\nCurrent step ({:?}): {}", step.step_type, step.description);
            let reply = rt.agent.handle_user_message(&step_query, &cancel).await.map_err(|e| e.to_string())?;
            println!("{reply}");
            plan.mark_done(&step_id);
        }
    }
    println!("plan complete.");
    Ok(())
}

fn install_ctrlc_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
}

fn persist_session(rt: &mut Runtime) {
    let Some(dir) = &rt.sessions_dir else { return };
    rt.session.updated_at = chrono::Utc::now();
    if let Err(e) = session::save(dir, &rt.session) {
        tracing::warn!(error = %e, "failed to persist session");
    }
}

async fn run_models(config: &AppConfig, action: ModelsAction) -> Result<(), String> {
    let client = OllamaClient::new(
        config.backend.base_url.clone(),
        config.backend.default_model.clone(),
        config.backend.request_timeout_secs,
        config.backend.max_retries,
        config.backend.keep_alive.clone(),
    );

    match action {
        ModelsAction::List => {
            let models = client.list_models().await.map_err(|e| e.to_string())?;
            if models.is_empty() {
                println!("no models found on {}", config.backend.base_url);
            }
            for model in models {
                println!("{model}");
            }
        }
        ModelsAction::Test => {
            client
                .generate("respond with the single word: ok", Some("You are a health check probe."))
                .await
                .map_err(|e| e.to_string())?;
            println!("backend at {} is reachable with model {}", config.backend.base_url, config.backend.default_model);
        }
        ModelsAction::Pull { name } => {
            let status = client.pull_model(&name).await.map_err(|e| e.to_string())?;
            println!("{name}: {status}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["vecai".to_owned()];
        argv.extend(args.iter().map(|s| s.to_string()));
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn one_shot_query_is_captured_verbatim() {
        let cli = parse(&["explain", "internal/foo.txt"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.query, vec!["explain", "internal/foo.txt"]);
    }

    #[test]
    fn no_args_means_interactive() {
        let cli = parse(&[]);
        assert!(cli.command.is_none());
        assert!(cli.query.is_empty());
    }

    #[test]
    fn plan_subcommand_captures_goal_words() {
        let cli = parse(&["plan", "add", "logging"]);
        match cli.command {
            Some(Command::Plan { goal }) => assert_eq!(goal, vec!["add", "logging"]),
            other => panic!("expected Plan, got {other:?}"),
        }
    }

    #[test]
    fn models_pull_captures_model_name() {
        let cli = parse(&["models", "pull", "qwen2.5-coder:7b"]);
        match cli.command {
            Some(Command::Models { action: ModelsAction::Pull { name } }) => assert_eq!(name, "qwen2.5-coder:7b"),
            other => panic!("expected Models Pull, got {other:?}"),
        }
    }

    #[test]
    fn analyze_flag_forces_analysis_mode_regardless_of_auto() {
        let cli = parse(&["--auto", "--analyze", "do", "a", "thing"]);
        let mut config = AppConfig::default();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.permission.mode, PermissionMode::Analysis);
    }

    #[test]
    fn model_and_ollama_url_flags_override_config() {
        let cli = parse(&["--model", "llama3.1", "--ollama-url", "http://example:1234", "hi"]);
        let mut config = AppConfig::default();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.backend.default_model, "llama3.1");
        assert_eq!(config.backend.base_url, "http://example:1234");
    }

    #[test]
    fn version_flag_and_subcommand_are_both_recognized() {
        assert!(parse(&["--version"]).version);
        assert!(parse(&["-v"]).version);
        assert!(matches!(parse(&["version"]).command, Some(Command::Version)));
    }
}
