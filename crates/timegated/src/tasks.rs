//! Background maintenance tasks.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::EngineHandle;

/// How often the sweep task runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawns the maintenance sweep task.
///
/// Every interval it asks the engine to clear expired extensions and
/// apply any pending weekly reset. Runs until the token is cancelled.
pub fn spawn_sweep_task(
    engine: EngineHandle,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = SWEEP_INTERVAL.as_secs(), "Sweep task starting");

        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        // Skip the immediate first tick; startup just did this work
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Sweep task cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    if engine.sweep_expired_extensions().await.is_err() {
                        warn!("Engine is gone, sweep task exiting");
                        break;
                    }
                }
            }
        }

        info!("Sweep task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::storage::Storage;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sweep_task_stops_on_cancel() {
        let storage = Storage::new(Arc::new(MemoryStore::new()));
        let (engine, _join) = spawn_engine(storage).await.unwrap();

        let cancel = CancellationToken::new();
        let task = spawn_sweep_task(engine, cancel.clone());

        cancel.cancel();
        task.await.unwrap();
    }
}
