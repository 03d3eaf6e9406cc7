use std::{
    env,
    fs,
    net::SocketAddr,
    panic,
    path::{Path, PathBuf},
    str::FromStr,
    thread,
    time::{Duration, SystemTime},
};
use tokio::net::TcpListener;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

const DEFAULT_LOG_DIR: &str = "/var/log/routeflow";
const SECS_PER_DAY: u64 = 24 * 60 * 60;

pub struct TracingGuards {
    _file_guard: Option<WorkerGuard>,
}

/// Installs the global subscriber: stdout always, plus a daily rolling file
/// under `LOG_DIR/<service>` when that directory is writable.
pub fn init_tracing(service_name: &str) -> TracingGuards {
    // RUST_LOG wins over the default filter.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_root = log_root(service_name);

    let (file_layer, file_guard) = match open_log_writer(&log_root, service_name) {
        Some((writer, guard)) => (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            Some(guard),
        ),
        None => (None, None),
    };

    let _ = Registry::default()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(file_layer)
        .try_init();

    if file_guard.is_some() {
        let retention = Duration::from_secs(env_or("LOG_RETENTION_DAYS", 14u64) * SECS_PER_DAY);
        let interval = Duration::from_secs(env_or("LOG_CLEANUP_INTERVAL_MINUTES", 360u64) * 60);
        spawn_log_cleanup(log_root, retention, interval);
    }

    TracingGuards {
        _file_guard: file_guard,
    }
}

fn log_root(service_name: &str) -> PathBuf {
    let log_dir = env::var("LOG_DIR").unwrap_or_else(|_| DEFAULT_LOG_DIR.to_string());
    PathBuf::from(log_dir).join(service_name)
}

fn open_log_writer(log_root: &Path, service_name: &str) -> Option<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(log_root).ok()?;
    // The rolling appender panics when the directory is not writable.
    let appender = panic::catch_unwind(|| {
        tracing_appender::rolling::daily(log_root, format!("{service_name}.log"))
    })
    .ok()?;
    Some(tracing_appender::non_blocking(appender))
}

/// Typed environment lookup; unset or unparsable values yield `default`.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

/// Like [`env_or`] but treats empty strings as unset.
pub fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn spawn_log_cleanup(log_root: PathBuf, retention: Duration, interval: Duration) {
    if retention.is_zero() || interval.is_zero() {
        return;
    }

    let spawned = thread::Builder::new()
        .name("log-cleanup".to_string())
        .spawn(move || loop {
            if let Some(cutoff) = SystemTime::now().checked_sub(retention) {
                cleanup_old_logs(&log_root, cutoff);
            }
            thread::sleep(interval);
        });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "log cleanup thread not started");
    }
}

/// Removes files under `root`, at any depth, last modified before `cutoff`.
fn cleanup_old_logs(root: &Path, cutoff: SystemTime) {
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for path in entries.flatten().map(|entry| entry.path()) {
            if path.is_dir() {
                dirs.push(path);
                continue;
            }
            let expired = fs::metadata(&path)
                .and_then(|metadata| metadata.modified())
                .map(|modified| modified < cutoff)
                .unwrap_or(false);
            if expired {
                let _ = fs::remove_file(&path);
            }
        }
    }
}

pub async fn bind_listener(port: u16) -> std::io::Result<TcpListener> {
    // All interfaces, so the service is reachable from inside a container.
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr).await
}

pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "sigterm handler unavailable, waiting on ctrl-c");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
