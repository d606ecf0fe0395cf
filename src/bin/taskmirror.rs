//! Sync daemon binary.
//!
//! Wires the Graph client, the derived-system services and the state store
//! into a [`SyncEngine`], then runs reconciliation cycles until stopped.
//! With `--once` it runs a single cycle and exits non-zero if anything in
//! the cycle failed, which suits external schedulers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use taskmirror::clock::SystemClock;
use taskmirror::config::StoreBackend;
use taskmirror::graph::auth::TOKEN_ENV_VAR;
use taskmirror::graph::{
    CalendarApi, FileTokens, GraphClient, NotesApi, StaticTokens, TodoApi, TokenProvider,
};
use taskmirror::store::open_store;
use taskmirror::{SyncConfig, SyncEngine, SyncError};

struct Cli {
    config: Option<PathBuf>,
    once: bool,
    backend: Option<StoreBackend>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Some(cli) = parse_args()? else {
        return Ok(());
    };

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(SyncConfig::default_config_path);
    let mut config = if config_path.exists() {
        SyncConfig::from_file(&config_path)?
    } else {
        SyncConfig::default()
    };
    if let Some(backend) = cli.backend {
        config.store.backend = backend;
    }
    config.validate()?;

    // Keep the non-blocking writer guard alive for the process lifetime.
    let _guard = init_tracing(&config);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        backend = ?config.store.backend,
        "taskmirror starting"
    );

    run(config, cli.once).await
}

/// Returns `None` after printing usage.
fn parse_args() -> taskmirror::Result<Option<Cli>> {
    let mut cli = Cli {
        config: None,
        once: false,
        backend: None,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().ok_or_else(|| {
                    SyncError::Config("--config requires a path".to_owned())
                })?;
                cli.config = Some(PathBuf::from(path));
            }
            "--once" => cli.once = true,
            "--store" => {
                let value = args.next().ok_or_else(|| {
                    SyncError::Config("--store requires a backend name".to_owned())
                })?;
                cli.backend = Some(match value.as_str() {
                    "sqlite" => StoreBackend::Sqlite,
                    "table" => StoreBackend::Table,
                    other => {
                        return Err(SyncError::Config(format!(
                            "unknown store backend `{other}` (use sqlite|table)"
                        )));
                    }
                });
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(None);
            }
            other => {
                return Err(SyncError::Config(format!("unknown argument `{other}`")));
            }
        }
    }
    Ok(Some(cli))
}

fn print_usage() {
    println!("taskmirror v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("usage: taskmirror [--config PATH] [--once] [--store sqlite|table]");
    println!();
    println!("  --config PATH   TOML configuration file");
    println!("  --once          run a single sync cycle and exit");
    println!("  --store NAME    override the configured state store backend");
}

/// Tracing to stderr, plus a rolling daily file when configured.
fn init_tracing(config: &SyncConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("taskmirror=info"));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if config.logging.file {
        let dir = config
            .logging
            .dir
            .clone()
            .unwrap_or_else(|| SyncConfig::default_data_dir().join("logs"));
        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "taskmirror.log"));
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        None
    }
}

async fn run(config: SyncConfig, once: bool) -> anyhow::Result<()> {
    let tokens: Arc<dyn TokenProvider> = match &config.api.token_path {
        Some(path) => Arc::new(FileTokens::new(path)),
        None => {
            let tokens = StaticTokens::from_env().ok_or_else(|| {
                SyncError::Auth(format!(
                    "no token source: set api.token_path or {TOKEN_ENV_VAR}"
                ))
            })?;
            Arc::new(tokens)
        }
    };

    let client = Arc::new(GraphClient::new(&config.api, tokens)?);
    let source = Arc::new(TodoApi::new(client.clone()));
    let artifacts = Arc::new(NotesApi::new(client.clone(), &config.engine.notebook));
    let events = Arc::new(CalendarApi::new(client, &config.calendar.timezone));

    let store = open_store(&config.store).await?;
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            signal_cancel.cancel();
        }
    });

    let interval = Duration::from_secs(config.engine.polling_interval_secs);
    let engine = SyncEngine::new(
        &config,
        source,
        artifacts,
        events,
        store.clone(),
        Arc::new(SystemClock),
        cancel.clone(),
    );

    let result = drive(&engine, &cancel, interval, once).await;

    // The store is released on every exit path, error or not.
    if let Err(e) = store.close().await {
        error!(error = %e, "store close failed");
    }

    if result.is_ok() {
        info!("taskmirror shut down cleanly");
    }
    result
}

async fn drive(
    engine: &SyncEngine,
    cancel: &CancellationToken,
    interval: Duration,
    once: bool,
) -> anyhow::Result<()> {
    loop {
        match engine.run_cycle().await {
            Ok(report) => {
                if report.has_failures() {
                    warn!(failed = report.total_failed(), "cycle finished with failures");
                }
                if once {
                    if report.has_failures() {
                        anyhow::bail!("cycle finished with failures");
                    }
                    return Ok(());
                }
            }
            Err(e) => {
                if once {
                    return Err(e.into());
                }
                // A fatal cycle (usually auth) is retried after the normal
                // pause; credentials may have been refreshed by then.
                error!(error = %e, "cycle failed");
            }
        }

        if cancel.is_cancelled() {
            info!("stop requested");
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("stop requested");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
