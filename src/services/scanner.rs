//! Periodic batch scanner and per-batch workers
//!
//! The scanner owns the only in-memory registry in the system: batch id ->
//! worker handle. Everything else lives in the store. One worker per active
//! batch ticks the state machines; workers retire when their batch reaches a
//! terminal status, and the scanner reaps them on its next sweep.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;
use crate::error::CoreResult;
use crate::infrastructure::store::Store;
use crate::services::engine::{Engine, TickOutcome};

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Sweeps for active batches and keeps one worker per batch alive
pub struct Scanner<S: Store> {
    engine: Arc<Engine<S>>,
    scan_interval: Duration,
    tick_interval: Duration,
    window: ChronoDuration,
    workers: HashMap<i64, Worker>,
}

impl<S: Store> Scanner<S> {
    pub fn new(engine: Arc<Engine<S>>, config: &ScannerConfig) -> Self {
        Self {
            engine,
            scan_interval: config.scan_interval,
            tick_interval: config.tick_interval,
            window: ChronoDuration::days(config.batch_window_days),
            workers: HashMap::new(),
        }
    }

    /// Run until the shutdown token fires, then stop every worker
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "Scanner running (sweep every {:?}, workers tick every {:?})",
            self.scan_interval, self.tick_interval
        );
        let mut ticker = tokio::time::interval(self.scan_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sweep().await {
                warn!("Scanner sweep failed: {e}");
            }
        }

        info!(
            "Scanner stopping, cancelling {} batch workers",
            self.workers.len()
        );
        for (_, worker) in self.workers.drain() {
            worker.token.cancel();
            let _ = worker.handle.await;
        }
    }

    /// One pass: reap dead workers, cancel stale ones, spawn missing ones
    async fn sweep(&mut self) -> CoreResult<()> {
        let cutoff = Utc::now() - self.window;
        let active = self.engine.store().active_batches(cutoff).await?;
        let active_ids: HashSet<i64> = active.iter().map(|b| b.id).collect();

        self.workers.retain(|batch_id, worker| {
            if worker.handle.is_finished() {
                debug!("Reaping finished worker for batch {batch_id}");
                return false;
            }
            if !active_ids.contains(batch_id) {
                info!("Batch {batch_id} left the working set, cancelling its worker");
                worker.token.cancel();
                return false;
            }
            true
        });

        for batch in active {
            if self.workers.contains_key(&batch.id) {
                continue;
            }
            debug!("Spawning worker for batch {}", batch.id);
            let token = CancellationToken::new();
            let handle = tokio::spawn(batch_worker(
                self.engine.clone(),
                batch.id,
                self.tick_interval,
                token.clone(),
            ));
            self.workers.insert(batch.id, Worker { token, handle });
        }
        Ok(())
    }

    #[cfg(test)]
    fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

/// Cooperative loop advancing one batch until it terminates
async fn batch_worker<S: Store>(
    engine: Arc<Engine<S>>,
    batch_id: i64,
    tick_interval: Duration,
    token: CancellationToken,
) {
    info!("Worker started for batch {batch_id}");
    let mut ticker = tokio::time::interval(tick_interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Worker for batch {batch_id} cancelled");
                break;
            }
            _ = ticker.tick() => {}
        }
        match engine.process_batch_tick(batch_id).await {
            Ok(TickOutcome::Terminal) => {
                info!("Batch {batch_id} reached a terminal status, worker retiring");
                break;
            }
            Ok(TickOutcome::Active) => {}
            Err(e) if e.is_conflict() => {
                debug!("Batch {batch_id} tick lost a race, retrying next tick");
            }
            Err(crate::error::CoreError::NotFound { .. }) => {
                warn!("Batch {batch_id} disappeared, worker retiring");
                break;
            }
            Err(e) => warn!("Batch {batch_id} tick failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BatchAction, Env};
    use crate::services::harness::TestWorld;

    #[tokio::test]
    async fn sweep_spawns_and_retires_workers() {
        let world = TestWorld::new().await;
        let app = world.add_app("cart", "backend", vec![], &[Env::Pre]).await;
        let build = world.add_build(app.id, "v1").await;
        let (batch, _) = world.draft_batch(&[(app.id, Some(build.id))]).await;
        world.action(batch.id, BatchAction::Seal).await.unwrap();

        let TestWorld { engine, .. } = world;
        let engine = Arc::new(engine);
        let mut scanner = Scanner::new(engine.clone(), &ScannerConfig::default());

        scanner.sweep().await.unwrap();
        assert_eq!(scanner.worker_count(), 1);

        // Draft batches are not part of the working set.
        engine
            .process_batch_action(batch.id, BatchAction::Cancel, "gao", None)
            .await
            .unwrap();
        scanner.sweep().await.unwrap();
        assert_eq!(scanner.worker_count(), 0);
    }

    #[tokio::test]
    async fn draft_batches_get_no_worker() {
        let world = TestWorld::new().await;
        let app = world.add_app("cart", "backend", vec![], &[Env::Pre]).await;
        let build = world.add_build(app.id, "v1").await;
        let (_batch, _) = world.draft_batch(&[(app.id, Some(build.id))]).await;

        let TestWorld { engine, .. } = world;
        let mut scanner = Scanner::new(Arc::new(engine), &ScannerConfig::default());
        scanner.sweep().await.unwrap();
        assert_eq!(scanner.worker_count(), 0);
    }

    #[tokio::test]
    async fn worker_retires_on_terminal_batch() {
        let world = TestWorld::new().await;
        let app = world.add_app("cart", "backend", vec![], &[Env::Pre]).await;
        let build = world.add_build(app.id, "v1").await;
        let (batch, _) = world.draft_batch(&[(app.id, Some(build.id))]).await;
        world.action(batch.id, BatchAction::Seal).await.unwrap();
        world.action(batch.id, BatchAction::Cancel).await.unwrap();

        let TestWorld { engine, .. } = world;
        let token = CancellationToken::new();
        let handle = tokio::spawn(batch_worker(
            Arc::new(engine),
            batch.id,
            Duration::from_millis(5),
            token,
        ));
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker should retire on its own")
            .unwrap();
    }
}
