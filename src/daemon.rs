use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::lifecycle::Lifecycle;
use crate::locks::RecordLocks;
use crate::timers::Timers;
use crate::{db, filler, recover, scheduler, store, telegram};

pub async fn run(config: Config) -> Result<()> {
    let pool = db::create_pool(&config).await.context("creating database")?;
    info!(db_path = %config.db_path().display(), "database ready");

    // Seed the global fallback window from config
    let (start_min, end_min) = config.window_minutes();
    store::upsert_window_config(&pool, config.broadcast.window_enabled, start_min, end_min)
        .await
        .context("syncing broadcast window to database")?;

    let conn = telegram::connect(&config, &pool)
        .await
        .context("connecting to Telegram")?;
    match conn.client.is_authorized().await {
        Ok(true) => {}
        Ok(false) => anyhow::bail!("Telegram not authorized. Run 'crier tg login' first."),
        Err(e) => anyhow::bail!("Telegram auth check failed: {e}"),
    }

    let config = Arc::new(config);
    let cancel = CancellationToken::new();
    let timers = Timers::new();
    let locks = RecordLocks::new();
    let messenger = Arc::new(telegram::TelegramMessenger::new(conn.client.clone(), pool.clone()));

    let tz = config.timezone();
    let lifecycle = Lifecycle::new(
        pool.clone(),
        Arc::clone(&messenger),
        timers,
        Arc::clone(&locks),
        tz,
        config.crier.notify_chat,
        config.crier.primary_chat,
        config.reminder_lead(),
        config.send_delay(),
    );

    // Replay anything that became due while the process was down, before the
    // periodic driver takes over
    recover::reconcile(&lifecycle, &pool, Utc::now())
        .await
        .context("startup reconciliation")?;

    let broadcaster = Broadcaster::new(pool.clone(), Arc::clone(&messenger), locks, tz, config.send_delay());

    let scheduler_handle = tokio::spawn(scheduler::scheduler_loop(
        lifecycle,
        broadcaster,
        config.tick_interval(),
        cancel.clone(),
    ));

    let filler_handle = if config.idle.enabled {
        Some(tokio::spawn(filler::filler_loop(
            pool.clone(),
            Arc::clone(&config),
            Arc::clone(&messenger),
            cancel.clone(),
        )))
    } else {
        None
    };

    // Wait for shutdown signal
    wait_for_shutdown().await;
    info!("shutdown signal received");

    cancel.cancel();

    // Wait for tasks with timeout
    let shutdown_timeout = std::time::Duration::from_secs(10);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = scheduler_handle.await;
        if let Some(handle) = filler_handle {
            let _ = handle.await;
        }
    })
    .await;

    conn.client.disconnect();
    conn.runner_handle.abort();

    pool.close().await;
    info!("shutdown complete");

    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
