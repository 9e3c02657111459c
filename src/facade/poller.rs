//! Background tasks owned by a running facade.

use super::Inner;
use crate::proxy::ProxyUpdate;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// Spawn the periodic refresh task for one proxied attribute.
///
/// Each proxied attribute gets its own task, so a slow remote source only
/// delays its own refreshes.
pub(crate) fn spawn_poller(
    inner: Arc<Inner>,
    attribute: String,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("[Poll] {} every {:?}", attribute, period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = inner.refresh(&attribute) => {
                    if let Err(e) = result {
                        warn!("[Poll] Refresh of {} failed: {}", attribute, e);
                    }
                }
            }
        }

        debug!("[Poll] {} stopped", attribute);
    })
}

/// Spawn the task applying values pushed by remote sources.
pub(crate) fn spawn_ingest(
    inner: Arc<Inner>,
    mut updates: mpsc::Receiver<ProxyUpdate>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                update = updates.recv() => match update {
                    Some(update) => inner.ingest(update),
                    None => break,
                },
            }
        }
        debug!("[Poll] Push ingest stopped");
    })
}
