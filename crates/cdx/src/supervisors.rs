//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 *[a single cursor blinks in Redis]*
//! 🎬 "In a world where catalogs never stop changing..."
//! 🎬 "One supervisor polled them all."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The Supervisor owns the pipeline and the clock. It runs one pass, prints
//! the receipt, sleeps, and does it again until somebody says stop.
//!
//! A failed pass is logged and the loop keeps going. The cursor didn't move,
//! so the next pass redoes the same window. A shutdown signal interrupts a
//! pass or a nap alike: an interrupted pass never reaches `AdvanceCursor`, so
//! nothing is lost, just repeated.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::app_config::RuntimeConfig;
use crate::common::ChangeCursor;
use crate::pipeline::Pipeline;
use crate::progress::RunMetrics;

/// 📦 Part middle manager, part metronome.
#[derive(Debug)]
pub(crate) struct Supervisor {
    pipeline: Pipeline,
    poll_interval: Duration,
    stale_after: Duration,
    rebuild_on_start: bool,
    /// ⏰ The newest committed cursor: read from state at startup, then taken from each good pass.
    last_cursor: Option<ChangeCursor>,
}

impl Supervisor {
    pub(crate) fn new(pipeline: Pipeline, runtime: &RuntimeConfig) -> Self {
        Self {
            pipeline,
            poll_interval: Duration::from_secs(runtime.poll_interval_secs),
            stale_after: Duration::from_secs(runtime.stale_cursor_warn_secs),
            rebuild_on_start: runtime.rebuild_index_on_start,
            last_cursor: None,
        }
    }

    /// 🏓 Ping the index once before settling into the loop.
    pub(crate) async fn preflight(&self) -> Result<()> {
        self.pipeline.preflight().await
    }

    /// 🔄 Poll until `shutdown` resolves. Only setup failures (the optional
    /// rebuild) end the loop with an error; pass failures are logged and retried
    /// on the next tick.
    pub(crate) async fn run_until<S>(&mut self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        if self.rebuild_on_start {
            let rebuilt = tokio::select! {
                result = self.pipeline.rebuild_index() => Some(result),
                _ = &mut shutdown => None,
            };
            match rebuilt {
                Some(result) => result?,
                None => {
                    info!("🛑 shutdown requested during the rebuild");
                    return Ok(());
                }
            }
        }

        // -- a restart with an old cursor and a broken pipeline should still look stale
        let seeded = tokio::select! {
            result = self.pipeline.committed_cursor() => Some(result),
            _ = &mut shutdown => None,
        };
        match seeded {
            Some(Ok(cursor)) => self.last_cursor = cursor,
            Some(Err(err)) => warn!("⚠️ could not read the committed cursor, lag stays unknown until a pass succeeds: {err:#}"),
            None => {
                info!("🛑 shutdown requested before the first pass");
                return Ok(());
            }
        }
        self.warn_if_stale();

        loop {
            let started_at = Utc::now();
            let outcome = tokio::select! {
                result = self.pipeline.run_once(started_at) => Some(result),
                _ = &mut shutdown => None,
            };
            match outcome {
                Some(Ok(metrics)) => self.report(&metrics),
                Some(Err(err)) => {
                    error!("💀 pass failed, will retry in {:?}: {err:#}", self.poll_interval);
                    self.warn_if_stale();
                }
                None => {
                    info!("🛑 shutdown requested mid-pass; the cursor was not advanced");
                    return Ok(());
                }
            }

            let woke_up = tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => true,
                _ = &mut shutdown => false,
            };
            if !woke_up {
                info!("🛑 shutdown requested, see you next time 👋");
                return Ok(());
            }
        }
    }

    fn report(&mut self, metrics: &RunMetrics) {
        if metrics.cursor_after.is_some() {
            self.last_cursor = metrics.cursor_after;
        }
        info!("📊 pass finished\n{}", metrics.summary_table());
        self.warn_if_stale();
    }

    /// ⏰ How far the newest known cursor trails now. `None` before any cursor exists.
    fn cursor_lag(&self) -> Option<Duration> {
        let cursor = self.last_cursor?;
        Some((Utc::now() - cursor).to_std().unwrap_or(Duration::ZERO))
    }

    fn is_stale(&self) -> bool {
        self.cursor_lag().is_some_and(|lag| lag > self.stale_after)
    }

    fn warn_if_stale(&self) {
        let Some(lag) = self.cursor_lag() else {
            return;
        };
        if self.is_stale() {
            warn!(lag_secs = lag.as_secs(), cursor = ?self.last_cursor, "⚠️ cursor is stale, passes may be failing repeatedly");
        } else {
            info!(lag_secs = lag.as_secs(), "⏰ cursor lag");
        }
    }
}

/// 🛑 Resolves on Ctrl-C, or SIGTERM on unix.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("💀 could not listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("💀 could not listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("🛑 Ctrl-C received"),
        _ = terminate => info!("🛑 SIGTERM received"),
    }
}
