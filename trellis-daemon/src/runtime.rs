use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::time::Instant;

use trellis_core::layout::is_inbox_candidate;
use trellis_core::registry;
use trellis_core::types::{Scope, ScopeId};
use trellis_core::ScopeLayout;

use crate::config::DaemonConfig;
use crate::error::{io_err, DaemonError};
use crate::paths::{run_dir, socket_path, DEBOUNCE_WINDOW};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::scheduler::{
    recover_interrupted_at, LocalRunner, Scheduler, TriggerOutcome, TriggerSource,
};

/// How long shutdown waits for in-flight runs.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon until `stop`, ctrl-c or SIGTERM.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let config = DaemonConfig::load_at(&home)?;
    ensure_runtime_dirs(&home)?;
    for scope in recover_interrupted_at(&home)? {
        tracing::info!(scope = %scope, "recovered interrupted run");
    }

    let runner = Arc::new(LocalRunner::new(&home, config.clone()));
    let scheduler = Scheduler::new(runner, config.max_workers);
    let started_at = Utc::now();
    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    tracing::info!(
        tick_secs = config.tick_secs,
        max_workers = config.max_workers,
        "trellis daemon started",
    );

    let ticker_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let scheduler = Arc::clone(&scheduler);
        let tick = config.tick();
        tokio::spawn(async move {
            let result = ticker_task(home, scheduler, tick, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let scheduler = Arc::clone(&scheduler);
        let refresh = config.tick();
        tokio::spawn(async move {
            let result = watcher_task(home, scheduler, refresh, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            let result = socket_server_task(
                home,
                scheduler,
                shutdown.clone(),
                shutdown.subscribe(),
                started_at,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move { signal_task(shutdown).await })
    };

    let (ticker_result, watcher_result, socket_result, signal_result) =
        tokio::join!(ticker_handle, watcher_handle, socket_handle, signal_handle);

    scheduler.drain(SHUTDOWN_GRACE).await;

    handle_join("ticker", ticker_result)?;
    handle_join("watcher", watcher_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("trellis daemon stopped");
    Ok(())
}

async fn signal_task(shutdown: broadcast::Sender<()>) -> Result<(), DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut shutdown_rx = shutdown.subscribe();
    let mut terminate = signal(SignalKind::terminate()).map_err(|e| io_err("SIGTERM handler", e))?;
    tokio::select! {
        _ = shutdown_rx.recv() => {}
        _ = terminate.recv() => {
            tracing::info!("received SIGTERM, shutting down daemon");
            let _ = shutdown.send(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| io_err("ctrl-c handler", e))?;
            tracing::info!("received ctrl-c, shutting down daemon");
            let _ = shutdown.send(());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Master loop
// ---------------------------------------------------------------------------

async fn ticker_task(
    home: PathBuf,
    scheduler: Arc<Scheduler>,
    tick: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                match scheduler.tick(&home).await {
                    Ok(dispatched) if !dispatched.is_empty() => {
                        tracing::info!(count = dispatched.len(), "scheduled reconciliations dispatched");
                    }
                    Ok(_) => {}
                    // A bad scope record must not stop the loop.
                    Err(err) => tracing::error!(error = %err, "schedule pass failed"),
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Inbox watcher
// ---------------------------------------------------------------------------

async fn watcher_task(
    home: PathBuf,
    scheduler: Arc<Scheduler>,
    refresh: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event: notify::Result<Event>| {
        let _ = event_tx.send(event);
    })?;

    let mut inboxes = InboxMap::default();
    inboxes.refresh(&mut watcher, &home);
    let mut debounce = HashMap::<PathBuf, Instant>::new();
    let mut rescan = tokio::time::interval(refresh);
    rescan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = rescan.tick() => inboxes.refresh(&mut watcher, &home),
            event = event_rx.recv() => {
                let Some(event) = event else {
                    return Err(DaemonError::ChannelClosed("watcher events"));
                };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_inbox_write(&event.kind) {
                    continue;
                }
                for path in event.paths {
                    if !is_inbox_candidate(&path) {
                        continue;
                    }
                    let Some(scope) = inboxes.scope_for(&path) else {
                        continue;
                    };
                    if !debounce_allows(&mut debounce, &path, Instant::now()) {
                        continue;
                    }
                    let record = match registry::load_scope_at(&home, &scope) {
                        Ok(record) => record,
                        Err(err) => {
                            tracing::warn!(scope = %scope, error = %err, "inbox change for unreadable scope");
                            continue;
                        }
                    };
                    let outcome =
                        scheduler.trigger_scope(&record, TriggerSource::Watcher, false, Utc::now());
                    tracing::info!(scope = %scope, path = %path.display(), outcome = ?outcome, "inbox change");
                }
            }
        }
    }
    Ok(())
}

/// Watched `raw/` directories and the scope each one belongs to.
#[derive(Default)]
struct InboxMap {
    dirs: HashMap<PathBuf, ScopeId>,
}

impl InboxMap {
    /// Watch inboxes of newly registered scopes and forget removed ones.
    fn refresh(&mut self, watcher: &mut RecommendedWatcher, home: &Path) {
        let scopes = match registry::list_scopes_at(home) {
            Ok(scopes) => scopes,
            Err(err) => {
                tracing::warn!(error = %err, "cannot list scopes for inbox watching");
                return;
            }
        };
        let wanted = inbox_dirs(&scopes);
        let current: HashSet<PathBuf> = self.dirs.keys().cloned().collect();
        for gone in current.iter().filter(|dir| !wanted.contains_key(*dir)) {
            let _ = watcher.unwatch(gone);
            self.dirs.remove(gone);
        }
        for (dir, scope) in wanted {
            if self.dirs.contains_key(&dir) {
                continue;
            }
            match watcher.watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    tracing::debug!(scope = %scope, path = %dir.display(), "watching inbox");
                    self.dirs.insert(dir, scope);
                }
                Err(err) => tracing::warn!(scope = %scope, error = %err, "cannot watch inbox"),
            }
        }
    }

    fn scope_for(&self, path: &Path) -> Option<ScopeId> {
        let parent = path.parent()?;
        let parent = fs::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf());
        self.dirs.get(&parent).cloned()
    }
}

/// Canonicalized `raw/` directory of every enabled scope.
fn inbox_dirs(scopes: &[Scope]) -> HashMap<PathBuf, ScopeId> {
    scopes
        .iter()
        .filter(|scope| scope.config.enabled)
        .filter_map(|scope| {
            let raw = ScopeLayout::new(&scope.root).raw_dir();
            // Canonicalize so that event paths (real paths, e.g.
            // /private/var/... on macOS) match.
            let raw = fs::canonicalize(&raw).ok()?;
            Some((raw, scope.id.clone()))
        })
        .collect()
}

fn is_inbox_write(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

fn debounce_allows(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
) -> bool {
    debounce_allows_within(debounce, path, now, DEBOUNCE_WINDOW)
}

fn debounce_allows_within(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
    threshold: Duration,
) -> bool {
    debounce.retain(|_, seen_at| now.duration_since(*seen_at) <= Duration::from_secs(30));
    match debounce.get(path) {
        Some(last_seen) if now.duration_since(*last_seen) < threshold => false,
        _ => {
            debounce.insert(path.to_path_buf(), now);
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Socket server
// ---------------------------------------------------------------------------

async fn socket_server_task(
    home: PathBuf,
    scheduler: Arc<Scheduler>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at: DateTime<Utc>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let home = home.clone();
                let scheduler = Arc::clone(&scheduler);
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, home, scheduler, shutdown_tx, started_at).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    home: PathBuf,
    scheduler: Arc<Scheduler>,
    shutdown_tx: broadcast::Sender<()>,
    started_at: DateTime<Utc>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = dispatch(&home, &scheduler, &shutdown_tx, started_at, &request).await;
        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

pub(crate) async fn dispatch(
    home: &Path,
    scheduler: &Arc<Scheduler>,
    shutdown_tx: &broadcast::Sender<()>,
    started_at: DateTime<Utc>,
    request: &DaemonRequest,
) -> DaemonResponse {
    match request.cmd.as_str() {
        "status" => match build_status_payload(home, scheduler, started_at, request.scope.as_deref()).await {
            Ok(payload) => DaemonResponse::ok(payload),
            Err(err) => DaemonResponse::error(err.to_string()),
        },
        "trigger" => {
            let Some(scope) = request.scope.as_deref() else {
                return DaemonResponse::error("trigger needs a scope");
            };
            let id = ScopeId::from(scope);
            let record = match registry::load_scope_at(home, &id) {
                Ok(record) => record,
                Err(err) => return DaemonResponse::error(err.to_string()),
            };
            let outcome =
                scheduler.trigger_scope(&record, TriggerSource::Manual, request.confirm, Utc::now());
            let mut data = json!({ "scope": id, "outcome": outcome });
            if outcome == TriggerOutcome::Deferred {
                data["retry_at"] = json!(record.next_eligible_at);
            }
            DaemonResponse::ok(data)
        }
        "stop" => {
            let _ = shutdown_tx.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        }
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

async fn build_status_payload(
    home: &Path,
    scheduler: &Scheduler,
    started_at: DateTime<Utc>,
    only: Option<&str>,
) -> Result<Value, DaemonError> {
    let home_for_list = home.to_path_buf();
    let mut scopes = tokio::task::spawn_blocking(move || registry::list_scopes_at(&home_for_list))
        .await
        .map_err(|err| DaemonError::Protocol(format!("scope listing join error: {err}")))??;
    if let Some(only) = only {
        scopes.retain(|scope| scope.id.0 == only);
        if scopes.is_empty() {
            return Err(DaemonError::Protocol(format!("unknown scope '{only}'")));
        }
    }

    let entries: Vec<Value> = scopes
        .iter()
        .map(|scope| {
            let slot = scheduler.status(&scope.id);
            json!({
                "scope": scope.id,
                "state": scope.state,
                "enabled": scope.config.enabled,
                "last_run": scope.last_run,
                "next_eligible_at": scope.next_eligible_at,
                "last_error": scope.last_error,
                "pending_conflicts": scope.pending_conflicts,
                "needs_attention": scope.needs_attention,
                "pending_push": scope.pending_push,
                "health": scope.health,
                "in_flight": slot.in_flight,
                "pending": slot.pending,
                "deferred": slot.deferred,
                "last_result": slot.last,
            })
        })
        .collect();

    Ok(json!({
        "running": true,
        "pid": std::process::id(),
        "started_at": started_at,
        "in_flight": scheduler.in_flight(),
        "scopes": entries,
        "socket": socket_path(home).display().to_string(),
    }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Clears a socket file left by a crashed daemon. A socket that still accepts
/// connections belongs to a live daemon and is an error.
fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if StdUnixStream::connect(socket).is_ok() {
        return Err(DaemonError::Protocol(format!(
            "another daemon is listening on {}",
            socket.display()
        )));
    }
    match fs::remove_file(socket) {
        Ok(()) => {
            tracing::warn!(socket = %socket.display(), "removed stale daemon socket");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let run = run_dir(home);
    if !run.exists() {
        fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    writer.write_all(&line).await.map_err(|e| io_err("daemon socket write", e))?;
    writer.flush().await.map_err(|e| io_err("daemon socket flush", e))
}

fn handle_join(
    task: &str,
    joined: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    joined.unwrap_or_else(|err| Err(DaemonError::Protocol(format!("{task} task failed: {err}"))))
}

/// `RUST_LOG` filters; `TRELLIS_LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("TRELLIS_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let _ = if json {
        fmt().json().with_env_filter(filter).try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
