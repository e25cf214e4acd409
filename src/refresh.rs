//! Background data refresh system
//!
//! Periodically forces a refresh of the zero-key categories so requests for
//! global totals and the country list are normally answered from memory.
//! Progress is reported over a tokio channel.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cache::{Orchestrator, Source};
use crate::config::Config;
use crate::data::{Category, Query};

/// Messages sent from the background refresh task
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshMessage {
    /// A refresh cycle is starting
    RefreshStarted,
    /// One category was refreshed; `source` tells whether upstream answered
    Refreshed { category: Category, source: Source },
    /// A category could not be refreshed and had nothing to fall back to
    RefreshError(String),
    /// Every category in the cycle has been attempted
    RefreshCompleted,
}

/// Configuration for the refresh loop
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Time between refresh cycles
    pub interval: Duration,
    /// Whether auto-refresh is enabled
    pub enabled: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600), // 1 hour
            enabled: true,
        }
    }
}

impl From<&Config> for RefreshConfig {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.refresh_interval(),
            enabled: config.refresh.enabled,
        }
    }
}

/// Queries refreshed every cycle
const REFRESHED_QUERIES: [Query; 2] = [Query::Global, Query::AllCountries];

/// Handle for controlling the background refresh task
pub struct RefreshHandle {
    /// Channel for receiving refresh messages
    pub receiver: mpsc::Receiver<RefreshMessage>,
    shutdown_tx: mpsc::Sender<()>,
}

impl RefreshHandle {
    /// Spawns the refresh task
    ///
    /// The first cycle runs one `interval` after spawning. Refreshes go
    /// through the orchestrator's single-flight slots, so a cycle never
    /// duplicates a fetch a request has already started.
    pub fn spawn(orchestrator: Orchestrator, config: RefreshConfig) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        if config.enabled {
            let every = config.interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                // Skip the first tick (immediate)
                interval.tick().await;

                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            run_cycle(&orchestrator, &msg_tx).await;
                        }
                        _ = shutdown_rx.recv() => {
                            break;
                        }
                    }
                }
                info!("background refresh stopped");
            });
        }

        Self {
            receiver: msg_rx,
            shutdown_tx,
        }
    }

    /// Shuts down the background refresh task
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn run_cycle(orchestrator: &Orchestrator, tx: &mpsc::Sender<RefreshMessage>) {
    let _ = tx.send(RefreshMessage::RefreshStarted).await;

    for query in &REFRESHED_QUERIES {
        let category = query.category();
        let message = match orchestrator.refresh(query).await {
            Ok(resolved) => {
                info!(%category, source = ?resolved.source, "background refresh");
                RefreshMessage::Refreshed {
                    category,
                    source: resolved.source,
                }
            }
            Err(e) => {
                warn!(%category, "background refresh failed: {}", e);
                RefreshMessage::RefreshError(e.to_string())
            }
        };
        let _ = tx.send(message).await;
    }

    let _ = tx.send(RefreshMessage::RefreshCompleted).await;
}
