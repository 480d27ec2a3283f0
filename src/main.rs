mod ai;
mod autoresponder;
mod buffer;
mod classifier;
mod cli;
mod commands;
mod confirmation;
mod config;
mod dispatcher;
mod errors;
mod monitor;
mod notifier;
mod pane;
mod session;
mod sleep_detector;
mod store;
mod tokens;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use ai::AnthropicAdapter;
use classifier::Classifier;
use cli::{Cli, Command};
use config::{Preferences, Secrets};
use confirmation::ConfirmationManager;
use dispatcher::Dispatcher;
use errors::ErrorEscalation;
use monitor::PaneMonitor;
use notifier::telegram::TelegramAdapter;
use notifier::{Notifier, QuietHoursWindow};
use pane::tmux::TmuxPane;
use pane::PaneAdapter;
use session::{SessionManager, SessionStatus};
use store::Store;
use tokens::TokenEstimator;

/// Exit codes (§6): 0 normal shutdown, 64 configuration invalid, 70 fatal
/// internal error. `main` itself never returns an `Err` — every failure
/// path maps to one of these codes at a single exit point.
const EXIT_OK: u8 = 0;
const EXIT_CONFIG_INVALID: u8 = 64;
const EXIT_FATAL: u8 = 70;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Preferences are read synchronously here, before the runtime exists,
    // purely to size the logging layer — `run()` reads them again (async,
    // via the store-aware path) once it's actually wiring up the daemon.
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let logging = Preferences::load(&cwd).map(|(p, _)| p.logging).unwrap_or_default();
    let _log_guard = init_tracing(cli.verbose, &logging);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let code = runtime.block_on(async move {
        match cli.command {
            Command::Run => run().await,
            Command::Doctor => doctor().await,
            Command::Status { json } => status(json).await,
        }
    });

    ExitCode::from(code)
}

/// Wire up console and (if configured) rotating-file logging (§6 `logging`
/// preferences). Returns the file appender's guard — it must stay alive for
/// the process lifetime or buffered lines are silently dropped on exit.
fn init_tracing(verbose: u8, logging: &config::LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let default_filter = match verbose {
        0 => "conductor=info",
        1 => "conductor=debug",
        _ => "conductor=trace",
    };
    let filter = std::env::var("LOG_LEVEL").unwrap_or_else(|_| default_filter.to_string());
    let env_filter = tracing_subscriber::EnvFilter::new(filter);

    let console_layer = logging
        .console_output
        .then(|| tracing_subscriber::fmt::layer().with_target(false));

    let (file_layer, guard) = match &logging.file {
        Some(path) => {
            let path = Path::new(path);
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
            if let Err(err) = std::fs::create_dir_all(dir) {
                eprintln!("failed to create log directory {}: {err}", dir.display());
                (None, None)
            } else {
                let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "conductor.log".to_string());
                prune_old_logs(dir, &file_name, logging.backup_count);
                let appender = tracing_appender::rolling::daily(dir, &file_name);
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                let layer = tracing_subscriber::fmt::layer().with_target(false).with_ansi(false).with_writer(non_blocking);
                (Some(layer), Some(guard))
            }
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

/// `tracing_appender::rolling::daily` only rotates by date, it never prunes —
/// delete the oldest dated files for `file_name` beyond `backup_count` so a
/// long-running daemon doesn't accumulate logs forever (§6 `backup_count`).
fn prune_old_logs(dir: &Path, file_name: &str, backup_count: u32) {
    let prefix = format!("{file_name}.");
    let mut dated: Vec<(String, PathBuf)> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                if name.starts_with(&prefix) || name == *file_name {
                    Some((name, e.path()))
                } else {
                    None
                }
            })
            .collect(),
        Err(_) => return,
    };
    dated.sort();
    let keep = backup_count as usize + 1; // +1 for today's active file
    if dated.len() > keep {
        for (_, path) in &dated[..dated.len() - keep] {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn conductor_dir(cwd: &Path) -> PathBuf {
    cwd.join(".conductor")
}

async fn run() -> u8 {
    let cwd = match std::env::current_dir() {
        Ok(d) => d,
        Err(err) => {
            error!(%err, "failed to resolve current directory");
            return EXIT_FATAL;
        }
    };

    let secrets_path = match config::find_secrets_file(&cwd) {
        Some(p) => p,
        None => {
            error!("no .conductor/secrets.env found in {} or any parent directory", cwd.display());
            return EXIT_CONFIG_INVALID;
        }
    };
    let secrets = match Secrets::load(&secrets_path) {
        Ok(s) => s,
        Err(err) => {
            error!(%err, "invalid secrets file");
            return EXIT_CONFIG_INVALID;
        }
    };
    let (prefs, prefs_path) = match Preferences::load(&cwd) {
        Ok(v) => v,
        Err(err) => {
            error!(%err, "invalid preferences file");
            return EXIT_CONFIG_INVALID;
        }
    };
    match prefs_path {
        Some(ref p) => info!("loaded preferences from {}", p.display()),
        None => info!("no .conductor/config.toml found, using defaults"),
    }

    let db_path = conductor_dir(&cwd).join("conductor.db");
    let store = match Store::open(&db_path) {
        Ok(s) => s,
        Err(err) => {
            error!(%err, "failed to open store");
            return EXIT_FATAL;
        }
    };
    match store.prune_old().await {
        Ok(n) if n > 0 => info!(rows_pruned = n, "pruned stale commands/events at startup"),
        Ok(_) => {}
        Err(err) => error!(%err, "startup prune failed, continuing anyway"),
    }

    let persisted = match store.list_sessions().await {
        Ok(rows) => rows,
        Err(err) => {
            error!(%err, "failed to load persisted sessions, starting with none");
            Vec::new()
        }
    };
    let sessions = Arc::new(Mutex::new(SessionManager::restore(
        prefs.sessions.max_concurrent,
        persisted.clone(),
    )));
    let panes: Arc<Mutex<HashMap<String, Arc<dyn PaneAdapter>>>> = Arc::new(Mutex::new(HashMap::new()));

    let chat_adapter = Arc::new(TelegramAdapter::new(secrets.telegram_bot_token.clone(), secrets.telegram_user_id));
    let quiet_hours = parse_quiet_hours(&prefs.notifications.quiet_hours);
    let notifier = Arc::new(Notifier::new(chat_adapter, quiet_hours));

    let ai_adapter = Arc::new(AnthropicAdapter::new(secrets.anthropic_api_key.clone(), prefs.ai.model.clone()));
    let confirmations = Arc::new(ConfirmationManager::new());
    let tokens = Arc::new(Mutex::new(TokenEstimator::new(prefs.tokens.clone())));
    let error_escalation = Arc::new(Mutex::new(ErrorEscalation::new()));

    let dispatcher = Arc::new(Dispatcher::new(
        sessions.clone(),
        panes.clone(),
        store.clone(),
        notifier.clone(),
        ai_adapter,
        prefs.ai.clone(),
        prefs.auto_responder.clone(),
        confirmations.clone(),
        tokens,
        error_escalation,
    ));

    // New sessions are created on the (out-of-scope) chat command surface,
    // each spawning its own monitor at creation time. At boot there is no
    // such creation event to react to, so sessions the store already knew
    // about (surviving a restart) are reattached here instead — a pane per
    // non-exited row, fed into the same shared channel a freshly-created
    // session's monitor would use.
    let (events_tx, events_rx) = mpsc::channel(256);
    let _events_tx_keepalive = events_tx.clone();

    let classifier = Arc::new(Classifier::new());
    let mut monitor_handles = Vec::new();
    for row in persisted.into_iter().filter(|s| s.status != SessionStatus::Exited) {
        let pane: Arc<dyn PaneAdapter> = Arc::new(TmuxPane::new(row.mux_target.clone()));
        if !pane.is_alive() {
            warn!(session_id = %row.id, mux_target = %row.mux_target, "persisted session's pane is gone, marking exited");
            let updated = {
                let mut mgr = sessions.lock().await;
                if let Err(err) = mgr.set_status(&row.id, SessionStatus::Waiting) {
                    warn!(session_id = %row.id, %err, "failed to route through intermediate state before exit");
                }
                let _ = mgr.set_status(&row.id, SessionStatus::Exited);
                mgr.get(&row.id).cloned().unwrap_or(row)
            };
            let _ = store.upsert_session(&updated).await;
            continue;
        }

        #[cfg(unix)]
        {
            if let Ok(pid) = pane::tmux::pane_pid(&row.mux_target) {
                let mut mgr = sessions.lock().await;
                mgr.set_pid(&row.id, Some(pid));
                if let Some(updated) = mgr.get(&row.id).cloned() {
                    drop(mgr);
                    let _ = store.upsert_session(&updated).await;
                }
            }
        }

        panes.lock().await.insert(row.id.clone(), pane.clone());
        let monitor = PaneMonitor::new(row.id.clone(), pane, classifier.clone(), prefs.monitor.clone(), events_tx.clone());
        monitor_handles.push(tokio::spawn(monitor.run()));
        info!(session_id = %row.id, alias = %row.alias, "reattached to persisted session");
    }

    let dispatcher_task = tokio::spawn(dispatcher.clone().run(events_rx));

    let flush_window = Duration::from_secs(prefs.notifications.batch_window_s);
    let batch_flusher = tokio::spawn(notifier::run_batch_flusher(notifier.clone(), flush_window));
    let liveness_checker = tokio::spawn(notifier::run_liveness_checker(notifier.clone(), Duration::from_secs(30)));
    let confirmation_sweeper = tokio::spawn(confirmation::run_sweeper(confirmations.clone(), Duration::from_secs(10)));
    let sleep_watch = tokio::spawn(sleep_detector::run(dispatcher.clone(), panes.clone()));

    info!("conductor running, press Ctrl-C to stop");
    if let Err(err) = wait_for_shutdown_signal().await {
        error!(%err, "failed to install shutdown signal handler, running until killed");
        std::future::pending::<()>().await;
    }

    info!("shutdown signal received, draining");
    drop(events_tx);
    drop(_events_tx_keepalive);

    // Best-effort final flush (§5: bounded by 2s).
    let _ = tokio::time::timeout(Duration::from_secs(2), notifier.flush()).await;

    dispatcher_task.abort();
    batch_flusher.abort();
    liveness_checker.abort();
    confirmation_sweeper.abort();
    sleep_watch.abort();
    for handle in monitor_handles {
        handle.abort();
    }

    EXIT_OK
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    ctrlc::set_handler(move || {
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    })
    .context("failed to register Ctrl-C handler")?;
    let _ = rx.await;
    Ok(())
}

fn parse_quiet_hours(cfg: &config::QuietHours) -> QuietHoursWindow {
    use chrono::NaiveTime;
    let parse = |s: &Option<String>| -> Option<NaiveTime> {
        s.as_deref().and_then(|t| NaiveTime::parse_from_str(t, "%H:%M").ok())
    };
    QuietHoursWindow {
        enabled: cfg.enabled,
        start: parse(&cfg.start),
        end: parse(&cfg.end),
    }
}

async fn doctor() -> u8 {
    let cwd = std::env::current_dir().expect("current directory must be resolvable");
    let mut ok = true;

    match config::find_secrets_file(&cwd) {
        Some(path) => match Secrets::load(&path) {
            Ok(_) => println!("[ok]   secrets file: {}", path.display()),
            Err(err) => {
                println!("[fail] secrets file {}: {err}", path.display());
                ok = false;
            }
        },
        None => {
            println!("[fail] no .conductor/secrets.env found");
            ok = false;
        }
    }

    match Preferences::load(&cwd) {
        Ok((_, Some(path))) => println!("[ok]   preferences file: {}", path.display()),
        Ok((_, None)) => println!("[ok]   preferences: using defaults (no config.toml found)"),
        Err(err) => {
            println!("[fail] preferences file invalid: {err}");
            ok = false;
        }
    }

    match std::process::Command::new("tmux").arg("-V").output() {
        Ok(output) if output.status.success() => {
            println!("[ok]   tmux: {}", String::from_utf8_lossy(&output.stdout).trim());
        }
        _ => {
            println!("[fail] tmux binary not found on PATH");
            ok = false;
        }
    }

    if ok {
        println!("doctor: all checks passed");
        EXIT_OK
    } else {
        println!("doctor: one or more checks failed");
        EXIT_CONFIG_INVALID
    }
}

async fn status(json: bool) -> u8 {
    let cwd = std::env::current_dir().expect("current directory must be resolvable");
    let db_path = conductor_dir(&cwd).join("conductor.db");
    if !db_path.exists() {
        println!("no store found at {} — has conductor ever been run here?", db_path.display());
        return EXIT_OK;
    }

    let store = match Store::open(&db_path) {
        Ok(s) => s,
        Err(err) => {
            error!(%err, "failed to open store for status");
            return EXIT_FATAL;
        }
    };

    let sessions = match store.list_sessions().await {
        Ok(s) => s,
        Err(err) => {
            error!(%err, "failed to list sessions");
            return EXIT_FATAL;
        }
    };

    if json {
        match serde_json::to_string_pretty(&sessions) {
            Ok(text) => println!("{text}"),
            Err(err) => {
                error!(%err, "failed to serialize sessions");
                return EXIT_FATAL;
            }
        }
    } else if sessions.is_empty() {
        println!("no sessions recorded");
    } else {
        for s in &sessions {
            println!(
                "#{:<3} {:<16} {:?} {:?} {}",
                s.number, s.alias, s.session_type, s.status, s.working_dir
            );
        }
    }

    EXIT_OK
}
