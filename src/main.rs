use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use agent_runtime::agent::engine::{LoopCallbacks, StreamReport};
use agent_runtime::approval::{ApprovalDecision, ApprovalRequest, Approver};
use agent_runtime::message::{ToolResult, ToolUse};
use agent_runtime::openai::OpenAICompatible;
use agent_runtime::project::{Project, SendOptions};
use agent_runtime::session::{Session, SessionConfigManager};
use agent_runtime::settings::{self, ApprovalMode, RequestOverrides};
use agent_runtime::storage::{JsonlSessionRepository, SessionRepository};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

const DEFAULT_MODEL: &str = "gpt-4o";

#[derive(Debug, Parser)]
#[command(name = "agent_runtime")]
#[command(about = "Terminal coding agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Send one message and stream the answer.
    Run {
        prompt: String,
        #[arg(long)]
        model: Option<String>,
        /// Continue an existing session.
        #[arg(long)]
        resume: Option<String>,
        /// Branch from this message instead of the latest one.
        #[arg(long)]
        parent: Option<Uuid>,
        #[arg(long, value_enum)]
        approval_mode: Option<ApprovalMode>,
        #[arg(long)]
        max_turns: Option<u32>,
        #[arg(long)]
        max_retry_turns: Option<u32>,
        #[arg(long)]
        no_auto_compact: bool,
        /// Read-only tools, no approval prompts.
        #[arg(long)]
        plan: bool,
        #[arg(long)]
        cwd: Option<PathBuf>,
    },
    /// List sessions, newest first.
    Sessions,
    /// Never ask again for this tool in the session.
    Allow { session_id: String, tool: String },
    /// Set the session approval mode.
    Mode {
        session_id: String,
        #[arg(value_enum)]
        mode: ApprovalMode,
    },
}

struct StdinApprover {
    lines: Mutex<BufReader<Stdin>>,
}

#[async_trait]
impl Approver for StdinApprover {
    async fn approve(&self, request: &ApprovalRequest) -> ApprovalDecision {
        let target = request.description.clone().unwrap_or_else(|| request.tool_use.params.to_string());
        eprint!("Allow {} {}? [y]es / [n]o / [a]lways: ", request.tool_use.name, target);
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        let mut lines = self.lines.lock().await;
        match lines.read_line(&mut line).await {
            Ok(_) => match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => ApprovalDecision::Approve,
                "a" | "always" => ApprovalDecision::ApproveAlways,
                _ => ApprovalDecision::Deny,
            },
            Err(e) => {
                warn!(error = %e, "failed to read approval answer");
                ApprovalDecision::Deny
            }
        }
    }
}

struct Terminal;

#[async_trait]
impl LoopCallbacks for Terminal {
    async fn on_text_delta(&self, delta: &str) {
        print!("{delta}");
        let _ = std::io::stdout().flush();
    }

    async fn on_text(&self, _text: &str) {
        println!();
    }

    fn on_stream_result(&self, report: &StreamReport) {
        if let Some(e) = &report.error {
            eprintln!("model error (attempt {}/{}): {e}", report.retry + 1, report.max_retries + 1);
        }
    }

    async fn on_tool_use(&self, tool_use: ToolUse) -> ToolUse {
        eprintln!("> {} {}", tool_use.name, tool_use.params);
        tool_use
    }

    async fn on_tool_result(&self, tool_use: &ToolUse, result: ToolResult, _approved: bool) -> ToolResult {
        if result.is_error {
            eprintln!("! {}: {}", tool_use.name, result.text());
        }
        result
    }
}

fn open_repo() -> anyhow::Result<JsonlSessionRepository> {
    JsonlSessionRepository::initialize(None)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { prompt, model, resume, parent, approval_mode, max_turns, max_retry_turns, no_auto_compact, plan, cwd } => {
            let cwd = match cwd {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            };
            let config_dir = settings::resolve_config_dir();
            let global = settings::load_global_config(&config_dir.join("config.json"))?;
            let repo = Arc::new(open_repo()?);
            let session = match resume {
                Some(id) => {
                    let log = repo.log_path(&id);
                    if !log.exists() {
                        anyhow::bail!("session {id} not found");
                    }
                    Session::resume(id, &log)?
                }
                None => Session::create(),
            };
            let overrides = RequestOverrides {
                model,
                approval_mode,
                max_turns,
                max_retry_turns,
                auto_compact: no_auto_compact.then_some(false),
                temperature: None,
            };
            let effective = settings::resolve_effective_settings(&global, &overrides);
            debug!(?effective, "resolved settings");

            let model_name = effective.model.clone().unwrap_or_else(|| DEFAULT_MODEL.into());
            let model = Arc::new(OpenAICompatible::from_env(model_name, effective.base_url.clone()));
            let session_id = session.id.clone();
            let mut project = Project::new(&cwd, session, effective.clone(), repo, model)
                .with_approver(Arc::new(StdinApprover { lines: Mutex::new(BufReader::new(tokio::io::stdin())) }))
                .with_global_config_dir(config_dir);
            if let Some(plan_model) = &effective.plan_model {
                project = project.with_plan_model(Arc::new(OpenAICompatible::from_env(plan_model.clone(), effective.base_url.clone())));
            }

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.cancel();
                }
            });
            let opts = SendOptions { parent_uuid: parent, cancel };
            let result = if plan { project.plan(&prompt, opts, &Terminal).await } else { project.send(&prompt, opts, &Terminal).await };
            eprintln!("session: {session_id}");
            match result {
                Ok(ok) => {
                    debug!(turns = ok.metadata.turns_count, tool_calls = ok.metadata.tool_calls_count, tokens = ok.usage.total_tokens(), "done");
                }
                Err(e) => {
                    eprintln!("error [{}]: {}", e.kind, e.message);
                    std::process::exit(1);
                }
            }
        }
        Commands::Sessions => {
            let repo = open_repo()?;
            for id in repo.list_sessions()? {
                println!("{id}");
            }
        }
        Commands::Allow { session_id, tool } => {
            let repo = open_repo()?;
            let mut manager = SessionConfigManager::new(repo.log_path(&session_id));
            manager.allow_tool(&tool)?;
            println!("{tool} allowed for session {session_id}");
        }
        Commands::Mode { session_id, mode } => {
            if mode == ApprovalMode::Yolo {
                anyhow::bail!("yolo can only be set in the global config or with --approval-mode");
            }
            let repo = open_repo()?;
            let mut manager = SessionConfigManager::new(repo.log_path(&session_id));
            manager.set_approval_mode(mode)?;
            println!("session {session_id} approval mode set");
        }
    }
    Ok(())
}
