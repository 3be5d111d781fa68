use anyhow::{bail, Context, Result};
use authority_core::config::{AuthorityConfig, CONFIG};
use authority_core::manager::PermissionManager;
use authority_db::{DatabaseDriver, MySqlDriver, SqliteDriver};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily("logs", "authority.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    guard
}

fn build_driver(config: &AuthorityConfig) -> Result<Arc<dyn DatabaseDriver>> {
    match config.db_type.as_str() {
        "sqlite" => {
            info!("using sqlite database at '{}'", config.sqlite_path);
            Ok(Arc::new(SqliteDriver::open(&config.sqlite_path)?))
        }
        "mysql" => {
            let mysql = config
                .mysql
                .as_ref()
                .context("db_type is 'mysql' but the [mysql] section is missing")?;
            info!("using mysql database '{}' at {}", mysql.database, mysql.host);
            Ok(Arc::new(MySqlDriver::connect_with(
                &mysql.host,
                mysql.port,
                &mysql.username,
                &mysql.password,
                &mysql.database,
            )?))
        }
        other => bail!("unknown db_type '{other}' (expected 'sqlite' or 'mysql')"),
    }
}

fn main() -> Result<()> {
    let _log_guard = init_logging();
    let config = &*CONFIG;
    let driver = build_driver(config)?;

    let manager = PermissionManager::instance();
    let initialized = manager.init(
        driver,
        config.cache_warmup,
        config.invalidator_threads.max(0) as usize,
        Duration::from_secs(config.sweeper_interval_seconds.max(1) as u64),
    );
    if !initialized {
        bail!("permission manager failed to initialize");
    }

    info!("authority is running; press ctrl-c to stop");
    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;
    stop_rx.recv()?;

    manager.shutdown();
    Ok(())
}
