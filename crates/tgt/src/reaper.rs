//! Background sweep of expired tickets.
//!
//! One reaper task runs per started factory. It holds only a weak reference
//! to the factory state, so a factory dropped without [`stop`] still lets the
//! task end at its next tick.
//!
//! [`stop`]: crate::TgtFactory::stop

use std::{sync::Weak, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::factory::FactoryInner;

/// Handle to a running reaper task.
#[derive(Debug)]
pub(crate) struct ReaperHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signals the task without waiting for it.
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Signals the task and waits for it to finish its current sweep.
    pub(crate) async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "ticket reaper ended abnormally");
        }
    }
}

/// Spawns the reaper. Must be called within a Tokio runtime.
pub(crate) fn spawn(factory: Weak<FactoryInner>, interval: Duration) -> ReaperHandle {
    let token = CancellationToken::new();
    let cancelled = token.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancelled.cancelled() => {
                    info!("ticket reaper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let Some(factory) = factory.upgrade() else {
                        debug!("ticket factory dropped, reaper exiting");
                        break;
                    };
                    match factory.sweep_expired().await {
                        Ok(report) if report.expired > 0 => {
                            debug!(
                                expired = report.expired,
                                scanned = report.scanned,
                                "reaper sweep"
                            );
                        },
                        Ok(_) => {},
                        Err(e) => warn!(error = %e, "reaper sweep failed"),
                    }
                }
            }
        }
    });

    ReaperHandle { token, task }
}
