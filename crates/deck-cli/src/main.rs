use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deck_channel::{ChannelConfig, ConnectionState, ControlChannel, LinkStatus, SessionSnapshot, Topic};
use deck_core::{NoticeLevel, TaskStatus};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

const EXIT_FAILED: i32 = 1;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "deck")]
#[command(about = "Drive a remote browser-automation agent", long_about = None)]
struct Cli {
    /// TOML config file
    #[arg(long, env = "DECK_CONFIG")]
    config: Option<PathBuf>,
    /// Agent endpoint (ws://, wss:// or unix://); overrides DECK_ADDRESS
    #[arg(long)]
    address: Option<String>,
    #[arg(long, env = "DECK_LOG_DIR", default_value = "")]
    log_dir: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream agent events until interrupted
    Watch {
        /// One JSON envelope per line
        #[arg(long)]
        json: bool,
    },
    /// Start a task and follow it to completion
    Run {
        #[arg(long)]
        task: String,
        /// Target window handle; repeatable
        #[arg(long = "window")]
        windows: Vec<i64>,
        /// Approve every confirmation without prompting
        #[arg(long)]
        auto_approve: bool,
        /// Resume a paused task without prompting
        #[arg(long)]
        resume_on_pause: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Prompt {
    Action(String),
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PauseChoice {
    Resume,
    Ask,
    Stop,
}

/// What to do when the task pauses; asking needs a readable stdin.
fn pause_choice(resume_on_pause: bool, stdin_open: bool) -> PauseChoice {
    if resume_on_pause {
        PauseChoice::Resume
    } else if stdin_open {
        PauseChoice::Ask
    } else {
        PauseChoice::Stop
    }
}

struct LogGuard {
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

struct MultiWriter {
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.address.as_deref(), |key| {
        std::env::var(key).ok()
    })?;
    let _log_guard = init_logging(&cli.log_dir);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let code = runtime.block_on(async move {
        match cli.command {
            Commands::Watch { json } => watch_agent(&config, json).await,
            Commands::Run {
                task,
                windows,
                auto_approve,
                resume_on_pause,
            } => run_task(&config, &task, windows, auto_approve, resume_on_pause).await,
        }
    })?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Flag > `DECK_*` environment > config file > defaults.
fn load_config<F>(path: Option<&Path>, address: Option<&str>, lookup: F) -> Result<ChannelConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match path {
        Some(path) => ChannelConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ChannelConfig::default(),
    };
    config
        .apply_env_with(lookup)
        .context("invalid DECK_* environment")?;
    if let Some(address) = address.map(str::trim).filter(|value| !value.is_empty()) {
        config.address = address.to_string();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_logging(log_dir: &str) -> Option<LogGuard> {
    let level = std::env::var("DECK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(log_dir) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter { file: file.clone() });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("deck-{stamp}-{}.log", std::process::id())))?;
    Ok(LogGuard {
        file: Some(Arc::new(StdMutex::new(file))),
    })
}

async fn watch_agent(config: &ChannelConfig, json: bool) -> Result<i32> {
    let channel = ControlChannel::from_config(config).context("unsupported agent address")?;
    channel.subscribe(Topic::All, move |envelope| {
        let line = if json {
            serde_json::to_string(envelope)?
        } else {
            format!("{:<16} {}", envelope.kind, envelope.data)
        };
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{line}")?;
        Ok(())
    });
    let mut link = channel.link();
    info!(event = "deck_watch_start", address = channel.address());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                channel.shutdown();
                return Ok(0);
            }
            changed = link.changed() => {
                if changed.is_err() {
                    return Ok(EXIT_FAILED);
                }
                let status = link.borrow_and_update().clone();
                log_link(&status);
            }
        }
    }
}

async fn run_task(
    config: &ChannelConfig,
    goal: &str,
    windows: Vec<i64>,
    auto_approve: bool,
    resume_on_pause: bool,
) -> Result<i32> {
    let channel = ControlChannel::from_config(config).context("unsupported agent address")?;
    let mut link = channel.link();
    if !wait_connected(&mut link, config.session.command_timeout()).await {
        warn!(event = "deck_agent_unreachable", address = channel.address());
    }

    let session = channel.session().clone();
    let task_id = match session.start(goal, windows).await {
        Ok(task_id) => task_id,
        Err(err) => {
            eprintln!("start failed: {err}");
            return Ok(EXIT_FAILED);
        }
    };
    println!("task {task_id} started");

    let mut updates = session.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut seen_notices = HashSet::new();
    let mut last_status = TaskStatus::Idle;
    let mut prompted: Option<Prompt> = None;

    loop {
        let snapshot = updates.borrow_and_update().clone();
        if snapshot.status != last_status {
            println!("{}", describe(&snapshot));
            last_status = snapshot.status;
        }
        for notice in &snapshot.notices {
            if seen_notices.insert(notice.id.clone()) {
                println!("[{}] {}", notice_tag(notice.level), notice.message);
            }
        }
        match snapshot.status {
            TaskStatus::Completed => return Ok(0),
            TaskStatus::Paused => match pause_choice(resume_on_pause, stdin_open) {
                PauseChoice::Resume => {
                    info!(event = "deck_auto_resume", task_id = %task_id);
                    if let Err(err) = session.resume().await {
                        eprintln!("resume failed: {err}");
                        let _ = session.stop().await;
                        return Ok(EXIT_FAILED);
                    }
                    continue;
                }
                PauseChoice::Ask if prompted != Some(Prompt::Resume) => {
                    prompted = Some(Prompt::Resume);
                    print!("task paused; resume? [y/n] ");
                    let _ = io::stdout().flush();
                }
                PauseChoice::Ask => {}
                PauseChoice::Stop => {
                    let _ = session.stop().await;
                    return Ok(EXIT_FAILED);
                }
            },
            TaskStatus::Failed | TaskStatus::Idle => {
                channel.shutdown();
                return Ok(EXIT_FAILED);
            }
            _ if prompted == Some(Prompt::Resume) => prompted = None,
            _ => {}
        }

        let pending = snapshot.pending.clone();
        match pending {
            Some(action) if prompted != Some(Prompt::Action(action.action_id.clone())) => {
                prompted = Some(Prompt::Action(action.action_id.clone()));
                if auto_approve {
                    info!(event = "deck_auto_approve", action_id = %action.action_id);
                    if let Err(err) = session.confirm(&action.action_id, true).await {
                        eprintln!("confirm failed: {err}");
                    }
                    continue;
                }
                print!(
                    "approve '{}' (risk {})? [y/n] ",
                    action.description, action.risk
                );
                let _ = io::stdout().flush();
            }
            None if matches!(prompted, Some(Prompt::Action(_))) => prompted = None,
            _ => {}
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let _ = session.stop().await;
                eprintln!("stopped");
                return Ok(EXIT_INTERRUPTED);
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    return Ok(EXIT_FAILED);
                }
            }
            line = stdin.next_line(), if stdin_open && prompted.is_some() => {
                match line {
                    Ok(Some(line)) => {
                        let Some(approved) = parse_answer(&line) else {
                            print!("please answer y or n: ");
                            let _ = io::stdout().flush();
                            continue;
                        };
                        match prompted.clone() {
                            Some(Prompt::Action(action_id)) => {
                                if let Err(err) = session.confirm(&action_id, approved).await {
                                    eprintln!("confirm failed: {err}");
                                }
                            }
                            Some(Prompt::Resume) if approved => {
                                if let Err(err) = session.resume().await {
                                    eprintln!("resume failed: {err}");
                                    let _ = session.stop().await;
                                    return Ok(EXIT_FAILED);
                                }
                            }
                            Some(Prompt::Resume) => {
                                let _ = session.stop().await;
                                return Ok(EXIT_FAILED);
                            }
                            None => {}
                        }
                    }
                    Ok(None) | Err(_) => stdin_open = false,
                }
            }
        }
    }
}

async fn wait_connected(link: &mut watch::Receiver<LinkStatus>, limit: Duration) -> bool {
    let wait = async {
        loop {
            if link.borrow_and_update().state == ConnectionState::Connected {
                return true;
            }
            if link.changed().await.is_err() {
                return false;
            }
        }
    };
    tokio::time::timeout(limit, wait).await.unwrap_or(false)
}

fn log_link(status: &LinkStatus) {
    if status.gave_up {
        warn!(event = "deck_link_gave_up", attempts = status.attempts);
    } else if let Some(delay) = status.next_retry_ms.filter(|_| status.state == ConnectionState::Reconnecting) {
        warn!(event = "deck_link_retry", attempt = status.attempts, delay_ms = delay);
    } else {
        info!(event = "deck_link", state = %status.state, generation = status.generation);
    }
}

fn describe(snapshot: &SessionSnapshot) -> String {
    let mut line = format!("status: {}", snapshot.status);
    if let Some(task) = &snapshot.task {
        let progress = &task.progress;
        if let Some(max) = progress.max_iterations {
            line.push_str(&format!(" ({}/{max})", progress.iteration));
        }
        if let Some(tool) = &task.last_tool {
            line.push_str(&format!(" last tool: {tool}"));
        }
        if snapshot.status == TaskStatus::Completed {
            if let Some(summary) = &task.summary {
                line.push_str(&format!("\n{summary}"));
            }
        }
    }
    if let Some(err) = &snapshot.last_error {
        line.push_str(&format!(" error: {err}"));
        if err.recoverable {
            line.push_str(" (recoverable)");
        }
    }
    line
}

fn notice_tag(level: NoticeLevel) -> &'static str {
    match level {
        NoticeLevel::Info => "info",
        NoticeLevel::Success => "ok",
        NoticeLevel::Warning => "warn",
        NoticeLevel::Error => "error",
    }
}

fn parse_answer(line: &str) -> Option<bool> {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}
