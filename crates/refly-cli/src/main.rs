use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::Result;
use refly_collab::{
    ConnectionStatus, FileStore, RegistryConfig, SessionEvent, SessionRegistry, TracingSink,
    WsConnector,
};
use refly_common::telemetry::{self, TelemetryConfig};
use refly_common::{AuthError, BaseResponse, Config, SharedToken, SpawnRefresh};
use refly_skill::{EventMeta, InvokeOutcome, InvokeSkillRequest, SkillClient, SkillHandler};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(version, about = "Refly - stream skills and edit shared documents from the terminal", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to config file (.kdl or .json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a skill and stream its answer to stdout
    Invoke {
        /// Question or instruction for the skill
        query: String,

        /// Skill to run (server default if omitted)
        #[arg(long)]
        skill: Option<String>,

        /// Model to run it with
        #[arg(long)]
        model: Option<String>,

        /// Project the run belongs to
        #[arg(long)]
        project: Option<String>,
    },
    /// Collaborative documents
    Doc {
        #[command(subcommand)]
        command: DocCommand,
    },
}

#[derive(Subcommand)]
enum DocCommand {
    /// Follow a document's sync status and title until Ctrl-C
    Watch { doc_id: String },
    /// Set a document's shared title
    SetTitle { doc_id: String, title: String },
}

/// How long `set-title` waits for the server before saving offline.
const REMOTE_SYNC_WAIT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    init_miette();
    telemetry::init(TelemetryConfig::from_env("refly-cli"));

    let cli = Cli::parse();
    let config = load_config(cli.config.clone()).await?;
    let tokens = token_source(&config, cli.config);

    match cli.command {
        Commands::Invoke {
            query,
            skill,
            model,
            project,
        } => {
            let mut request = InvokeSkillRequest::new(query);
            request.skill_name = skill;
            request.model_name = model;
            request.project_id = project;
            invoke(&config, tokens, request).await?;
        }
        Commands::Doc { command } => {
            let registry = registry(&config, tokens);
            match command {
                DocCommand::Watch { doc_id } => watch(&registry, &config, &doc_id).await?,
                DocCommand::SetTitle { doc_id, title } => {
                    set_title(&registry, &config, &doc_id, &title).await?
                }
            }
        }
    }

    Ok(())
}

async fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            let store = refly_common::config::FileStore::new(&path);
            Config::load(&store)
                .await?
                .with_env_overrides(|key| std::env::var(key).ok())?
        }
        None => match Config::default_path() {
            Some(path) => Config::load_or_default(path).await?,
            None => Config::default().with_env_overrides(|key| std::env::var(key).ok())?,
        },
    };
    debug!(server = %config.server_origin, ws = %config.ws_server_origin, "loaded config");
    Ok(config)
}

/// The configured token. Refreshing re-reads the config file and
/// `REFLY_TOKEN`, and fails if neither holds a different token.
fn token_source(config: &Config, path: Option<PathBuf>) -> Arc<SharedToken> {
    let initial = config.token.clone();
    let tokens = SharedToken::new(initial.clone()).with_refresh(move || {
        let path = path.clone();
        let stale = initial.clone();
        Box::pin(async move {
            let config = load_config(path)
                .await
                .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;
            match config.token {
                Some(token) if Some(&token) != stale.as_ref() => Ok(token),
                _ => Err(AuthError::Expired),
            }
        })
    });
    Arc::new(tokens)
}

/// Cancelled on the first Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}

/// Writes streamed text to stdout and everything else to the log.
struct TerminalHandler {
    out: std::io::Stdout,
    wrote_text: bool,
}

impl TerminalHandler {
    fn new() -> Self {
        Self {
            out: std::io::stdout(),
            wrote_text: false,
        }
    }
}

impl SkillHandler for TerminalHandler {
    fn on_skill_start(&mut self, meta: &EventMeta) {
        info!(result_id = meta.result_id.as_deref(), "skill started");
    }

    fn on_log(&mut self, _meta: &EventMeta, log: &Value) {
        info!(%log, "skill log");
    }

    fn on_stream(&mut self, _meta: &EventMeta, content: &str, _reasoning: Option<&str>) {
        self.wrote_text |= !content.is_empty();
        let _ = self.out.write_all(content.as_bytes());
    }

    fn on_skill_end(&mut self, meta: &EventMeta) {
        info!(result_id = meta.result_id.as_deref(), "skill finished");
    }

    fn on_artifact(&mut self, _meta: &EventMeta, artifact: &Value) {
        info!(%artifact, "artifact");
    }

    fn on_structured_data(&mut self, _meta: &EventMeta, data: &Value) {
        debug!(%data, "structured data");
    }

    fn on_create_node(&mut self, _meta: &EventMeta, node: &Value) {
        info!(%node, "node created");
    }

    fn on_usage(&mut self, _meta: &EventMeta, usage: &Value) {
        info!(%usage, "token usage");
    }

    fn on_error(&mut self, _meta: &EventMeta, error: &BaseResponse) {
        eprintln!(
            "error {}: {}",
            error.err_code.as_deref().unwrap_or("?"),
            error.message()
        );
    }

    fn on_completed(&mut self, _failed: bool) {
        if self.wrote_text {
            let _ = writeln!(self.out);
        }
    }

    fn after_event(&mut self) {
        let _ = self.out.flush();
    }
}

async fn invoke(
    config: &Config,
    tokens: Arc<SharedToken>,
    request: InvokeSkillRequest,
) -> Result<()> {
    let client = SkillClient::from_config(config, tokens)?;
    let cancel = ctrl_c_token();

    let mut handler = TerminalHandler::new();
    match client.invoke(&request, &mut handler, &cancel).await {
        InvokeOutcome::Completed => Ok(()),
        InvokeOutcome::Aborted => {
            eprintln!("aborted");
            Ok(())
        }
        InvokeOutcome::Failed => Err(miette::miette!("skill invocation failed")),
    }
}

fn registry(config: &Config, tokens: Arc<SharedToken>) -> SessionRegistry {
    SessionRegistry::new(
        RegistryConfig::from_config(config),
        Arc::new(WsConnector::new()),
        Arc::new(FileStore::new(config.documents_dir())),
    )
    .with_metadata_sink(Arc::new(TracingSink))
    .with_refresher(Arc::new(SpawnRefresh(tokens)))
}

async fn watch(registry: &SessionRegistry, config: &Config, doc_id: &str) -> Result<()> {
    let lease = registry.acquire(doc_id, config.token.clone())?;
    let mut events = lease.subscribe();
    let cancel = ctrl_c_token();

    println!("watching {doc_id} (title: {:?})", lease.title());
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        match event {
            SessionEvent::Status(status) => println!("status: {status}"),
            SessionEvent::LocalSynced { at } => {
                println!("loaded local copy at {at} (title: {:?})", lease.title())
            }
            SessionEvent::RemoteSynced { at } => {
                println!("synced with server at {at} (title: {:?})", lease.title())
            }
            SessionEvent::TitleChanged(title) => println!("title: {title}"),
            SessionEvent::AuthenticationFailed => {
                println!("authentication failed, refresh your token");
                break;
            }
            SessionEvent::RetriesExhausted => {
                println!("disconnected after {} retries", lease.retry_count());
                break;
            }
        }
    }

    lease.release().await;
    Ok(())
}

async fn set_title(
    registry: &SessionRegistry,
    config: &Config,
    doc_id: &str,
    title: &str,
) -> Result<()> {
    let lease = registry.acquire(doc_id, config.token.clone())?;
    if tokio::time::timeout(REMOTE_SYNC_WAIT, lease.wait_remote_synced())
        .await
        .is_err()
    {
        warn!(%doc_id, status = %lease.status(), "server not reachable, saving title locally only");
        lease.wait_loaded().await;
    }

    lease.set_title(title)?;
    if lease.status() == ConnectionStatus::Connected {
        println!("title set to {title:?}");
    } else {
        println!("title saved locally as {title:?}, it will sync on next connect");
    }
    lease.release().await;
    Ok(())
}

fn init_miette() {
    let installed = miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .with_cause_chain()
                .color(true)
                .context_lines(5)
                .tab_width(2)
                .break_words(true)
                .build(),
        )
    }));
    if installed.is_err() {
        eprintln!("couldn't set the miette hook");
    }
    miette::set_panic_hook();
}
