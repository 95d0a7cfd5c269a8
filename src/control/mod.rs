//! Outer supervisor for the feed connection.
//!
//! Polls the monitor feature flag on a fixed period and runs the monitor
//! while the flag is on. A crashed monitor is logged and restarted on the
//! next period. Termination signals cancel the loop.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::flags::FeatureFlags;

/// Something the control loop can supervise.
#[async_trait]
pub trait Monitor: Send {
    /// Run until cancelled or failed.
    async fn run(&mut self, cancel: CancellationToken) -> Result<()>;
}

pub struct ControlLoop {
    flags: Arc<dyn FeatureFlags>,
    flag_key: String,
    flag_default: bool,
    period: Duration,
    cancel: CancellationToken,
}

impl ControlLoop {
    pub fn new(
        flags: Arc<dyn FeatureFlags>,
        flag_key: &str,
        flag_default: bool,
        period: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            flags,
            flag_key: flag_key.to_string(),
            flag_default,
            period,
            cancel,
        }
    }

    pub async fn run<M: Monitor + ?Sized>(&self, monitor: &mut M) {
        info!(
            "Control loop started (flag={}, period={}s)",
            self.flag_key,
            self.period.as_secs()
        );

        while !self.cancel.is_cancelled() {
            if self.flags.is_enabled(&self.flag_key, self.flag_default).await {
                info!("Monitor enabled, starting");
                match monitor.run(self.cancel.child_token()).await {
                    Ok(()) => info!("Monitor stopped"),
                    Err(e) => error!("Monitor crashed: {:#}", e),
                }
            } else {
                info!("Monitor disabled by flag {}, waiting", self.flag_key);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.period) => {}
            }
        }

        info!("Control loop stopped");
    }
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Cancel `token` when a termination signal arrives.
pub fn cancel_on_shutdown(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });
}
