//! Strand CLI - binary entry point.
//!
//! ```text
//! strand [chat] [-p PROMPT]   interactive chat, or one prompt and exit
//! strand auth                 sign in with Qwen OAuth (cache or device flow)
//! strand logout               forget cached Qwen credentials
//! strand logs [--show]        list recorded OpenAI-compatible interactions
//! ```
//!
//! Logs go to `~/.strand/logs/strand.log` (or `./.strand/logs/strand.log`),
//! never to the terminal.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use strand_auth::{
    AuthEvent, AuthStatus, CredentialStore, QWEN_OAUTH_BASE_URL, QwenOAuthClient, authenticate,
};
use strand_config::Settings;
use strand_engine::{Session, SessionConfig, SessionEvent, create_content_generator};
use strand_providers::http_client;
use strand_providers::interaction_log::InteractionLogger;
use strand_types::{AuthType, Part};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "strand")]
#[command(about = "Chat with Gemini, OpenAI-compatible and Qwen OAuth backends")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Model to use (overrides config and STRAND_MODEL)
    #[arg(short = 'm', long, global = true)]
    model: Option<String>,

    /// Auth type: gemini-api-key, vertex-ai, openai or qwen-oauth
    #[arg(short = 'a', long, global = true)]
    auth_type: Option<AuthType>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a chat (default)
    Chat {
        /// Send a single prompt and exit
        #[arg(short = 'p', long)]
        prompt: Option<String>,
    },
    /// Sign in with Qwen OAuth
    Auth,
    /// Remove cached Qwen OAuth credentials
    Logout,
    /// List recorded OpenAI-compatible interactions
    Logs {
        /// Number of entries to list
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
        /// Print the most recent entry
        #[arg(long)]
        show: bool,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // No log file: stay silent rather than interleave logs with chat output.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!("Failed to create log dir {}: {e}", parent.display()));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!("Failed to open log file {}: {e}", candidate.display()));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = strand_config::config_dir() {
        candidates.push(dir.join("logs").join("strand.log"));
    }
    candidates.push(PathBuf::from(".strand").join("logs").join("strand.log"));
    candidates
}

/// Explicit choice, then config, then whichever API key is present.
fn resolve_auth_type(args: &Args, settings: &Settings) -> AuthType {
    args.auth_type
        .or(settings.auth_type)
        .unwrap_or(if settings.openai_api_key.is_some() {
            AuthType::OpenAi
        } else if settings.gemini_api_key.is_some() {
            AuthType::GeminiApiKey
        } else {
            AuthType::QwenOAuth
        })
}

async fn print_auth_events(mut rx: mpsc::UnboundedReceiver<AuthEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            AuthEvent::DeviceAuthorization(authorization) => {
                eprintln!("To sign in, open:\n\n  {}\n", authorization.verification_uri_complete);
                eprintln!("and confirm the code {}.", authorization.user_code);
            }
            AuthEvent::Progress(progress) => match progress.status {
                AuthStatus::Polling { .. } => tracing::debug!("{}", progress.message),
                _ => eprintln!("{}", progress.message),
            },
        }
    }
}

fn qwen_store(settings: &Settings) -> Result<CredentialStore> {
    settings
        .qwen_credentials_path
        .clone()
        .map(CredentialStore::new)
        .or_else(CredentialStore::default_location)
        .context("cannot locate the Qwen credentials file; set qwen_credentials_path")
}

async fn run_auth(settings: &Settings) -> Result<()> {
    let store = qwen_store(settings)?;
    let http = http_client(settings.proxy.as_deref(), Some(settings.timeout))?;
    let client = QwenOAuthClient::new(http).with_base_url(
        settings
            .qwen_oauth_base_url
            .clone()
            .unwrap_or_else(|| QWEN_OAUTH_BASE_URL.to_string()),
    );

    let cancel = CancellationToken::new();
    let ctrl_c = spawn_ctrl_c(cancel.clone());
    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_auth_events(rx));
    let result = authenticate(&store, &client, tx, &cancel).await;
    ctrl_c.abort();
    printer.await?;

    result.map_err(|e| anyhow!("authentication failed: {e}"))?;
    eprintln!("Credentials saved to {}", store.path().display());
    Ok(())
}

fn run_logout(settings: &Settings) -> Result<()> {
    let store = qwen_store(settings)?;
    store
        .clear()
        .with_context(|| format!("failed to remove {}", store.path().display()))?;
    eprintln!("Removed cached credentials.");
    Ok(())
}

fn run_logs(settings: &Settings, limit: usize, show: bool) -> Result<()> {
    let dir = settings
        .openai_log_dir
        .clone()
        .or_else(InteractionLogger::default_dir)
        .context("cannot determine the interaction log directory")?;
    let logger = InteractionLogger::new(dir);
    let files = logger.log_files(Some(limit))?;
    if files.is_empty() {
        eprintln!("No interaction logs in {}", logger.dir().display());
        return Ok(());
    }
    if show {
        let entry = InteractionLogger::read_log_file(&files[0])?;
        println!("{}", serde_json::to_string_pretty(&entry)?);
        return Ok(());
    }
    for file in files {
        println!("{}", file.display());
    }
    Ok(())
}

fn spawn_ctrl_c(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    })
}

fn print_session_event(event: SessionEvent) {
    match event {
        SessionEvent::Content(text) => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        SessionEvent::FunctionCall(call) => {
            eprintln!("\n[tool call] {}({})", call.name, call.args);
        }
        SessionEvent::Usage(usage) => {
            tracing::debug!(
                prompt = usage.prompt_tokens,
                completion = usage.completion_tokens,
                "Token usage"
            );
        }
        SessionEvent::ChatCompressed(result) => {
            eprintln!(
                "[history compressed: {} -> {} tokens]",
                result.original_token_count, result.new_token_count
            );
        }
        SessionEvent::ModelSwitched { from, to } => {
            eprintln!("[rate limited on {from}; switched to {to}]");
        }
        SessionEvent::MaxSessionTurns => {
            eprintln!("Maximum session turns reached. Start a new session to continue.");
        }
        SessionEvent::SessionTokenLimitExceeded { message, .. } => eprintln!("{message}"),
        SessionEvent::LoopDetected => {
            eprintln!("\n[stopped: the model was repeating itself]");
        }
        SessionEvent::Finished(_) => println!(),
        SessionEvent::Error { stage, message } => eprintln!("\nError ({stage}): {message}"),
    }
}

async fn send(session: &mut Session, text: String) {
    let cancel = CancellationToken::new();
    let ctrl_c = spawn_ctrl_c(cancel.clone());
    let prompt_id = uuid::Uuid::new_v4().to_string();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatch = async move {
        session
            .send_message(vec![Part::text(text)], &prompt_id, &cancel, &tx)
            .await;
    };
    let print = async {
        while let Some(event) = rx.recv().await {
            print_session_event(event);
        }
    };
    tokio::join!(dispatch, print);
    ctrl_c.abort();
}

async fn run_chat(settings: Settings, auth_type: AuthType, prompt: Option<String>) -> Result<()> {
    let setup_cancel = CancellationToken::new();
    let ctrl_c = spawn_ctrl_c(setup_cancel.clone());
    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_auth_events(rx));
    let configured = create_content_generator(&settings, auth_type, tx, &setup_cancel).await;
    ctrl_c.abort();
    printer.await?;
    let configured = configured.map_err(|e| anyhow!("{} error: {e}", e.stage()))?;

    tracing::info!(model = %configured.model, %auth_type, "Starting session");
    let mut session = Session::new(
        configured.generator,
        configured.model,
        SessionConfig::from_settings(&settings, Some(auth_type)),
    );

    if let Some(prompt) = prompt {
        send(&mut session, prompt).await;
        return Ok(());
    }

    eprintln!("Model: {}. Commands: /compress, /clear, /quit", session.model_state().current());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => {}
            "/quit" | "/exit" => break,
            "/clear" => {
                session.reset_chat();
                eprintln!("[history cleared]");
            }
            "/compress" => match session.try_compress(true, &CancellationToken::new()).await {
                Ok(Some(result)) => eprintln!(
                    "[history compressed: {} -> {} tokens]",
                    result.original_token_count, result.new_token_count
                ),
                Ok(None) => eprintln!("[nothing to compress]"),
                Err(e) => eprintln!("Compression failed: {e}"),
            },
            text => send(&mut session, text.to_string()).await,
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let mut settings = Settings::load()?;
    if let Some(model) = &args.model {
        settings.model = Some(model.clone());
    }
    let auth_type = resolve_auth_type(&args, &settings);

    match args.command {
        Some(Command::Auth) => run_auth(&settings).await,
        Some(Command::Logout) => run_logout(&settings),
        Some(Command::Logs { limit, show }) => run_logs(&settings, limit, show),
        Some(Command::Chat { prompt }) => run_chat(settings, auth_type, prompt).await,
        None => run_chat(settings, auth_type, None).await,
    }
}
