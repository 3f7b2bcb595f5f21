//! Target registry and worker supervision.
//!
//! The supervisor is the only component that starts or stops workers. It
//! owns the per-target sample buffers and the status board the dashboard
//! reads from.

mod worker;

pub use worker::{Worker, WorkerState};

use crate::buffer::SampleBuffer;
use crate::config::{GlobalConfig, TargetConfig};
use crate::db::Store;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Point-in-time view of one worker, published for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub state: WorkerState,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub poll_count: u64,
    pub auth_failures: u32,
}

impl Default for TargetStatus {
    fn default() -> Self {
        Self {
            state: WorkerState::Starting,
            last_success: None,
            last_error: None,
            poll_count: 0,
            auth_failures: 0,
        }
    }
}

/// Shared mutable status map. Workers write, status surfaces read.
#[derive(Default)]
pub struct StatusBoard {
    entries: RwLock<HashMap<String, TargetStatus>>,
}

impl StatusBoard {
    pub fn update<F>(&self, name: &str, f: F)
    where
        F: FnOnce(&mut TargetStatus),
    {
        let mut entries = self.entries.write().unwrap();
        f(entries.entry(name.to_string()).or_default());
    }

    pub fn snapshot(&self) -> HashMap<String, TargetStatus> {
        self.entries.read().unwrap().clone()
    }
}

struct WorkerHandle {
    name: String,
    stop_tx: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

/// Owns the set of active targets and their workers.
pub struct Supervisor {
    global: GlobalConfig,
    store: Arc<Store>,
    targets: Mutex<Vec<TargetConfig>>,
    buffers: Mutex<HashMap<String, Arc<SampleBuffer>>>,
    status: Arc<StatusBoard>,
    workers: tokio::sync::Mutex<Vec<WorkerHandle>>,
}

impl Supervisor {
    pub fn new(global: GlobalConfig, store: Arc<Store>) -> Self {
        Self {
            global,
            store,
            targets: Mutex::new(Vec::new()),
            buffers: Mutex::new(HashMap::new()),
            status: Arc::new(StatusBoard::default()),
            workers: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Add a target to the registry. Disabled targets are tracked but get
    /// no worker.
    pub fn register(&self, config: TargetConfig) {
        let buffer = Arc::new(SampleBuffer::new(
            self.global.buffer_max_samples,
            self.global.buffer_max_age_seconds,
        ));
        self.buffers.lock().unwrap().insert(config.name.clone(), buffer);
        if config.enabled {
            self.status.update(&config.name, |_| {});
        }
        self.targets.lock().unwrap().push(config);
    }

    /// Spawn a worker per enabled target. Idempotent while running.
    pub async fn start_all(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            tracing::warn!("collection is already running");
            return;
        }

        let targets: Vec<TargetConfig> = self
            .targets
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.enabled)
            .cloned()
            .collect();

        tracing::info!(count = targets.len(), "starting collection workers");

        for target in targets {
            if let Err(e) = self.store.register_firewall(&target.name, &target.host) {
                tracing::error!(firewall = %target.name, error = %e, "failed to register firewall");
            }

            let buffer = self
                .buffers
                .lock()
                .unwrap()
                .get(&target.name)
                .cloned()
                .unwrap_or_else(|| {
                    Arc::new(SampleBuffer::new(
                        self.global.buffer_max_samples,
                        self.global.buffer_max_age_seconds,
                    ))
                });

            let (stop_tx, stop_rx) = broadcast::channel(1);
            let name = target.name.clone();
            let worker = Worker::new(
                target,
                self.global.clone(),
                buffer,
                self.store.clone(),
                self.status.clone(),
            );

            let join = tokio::spawn(async move {
                worker.run(stop_rx).await;
            });

            workers.push(WorkerHandle { name, stop_tx, join });
        }
    }

    /// Stop every worker and wait for each to finish.
    ///
    /// Returns only after all workers have joined, which in turn means
    /// every held store connection went back to the pool.
    pub async fn stop_all(&self) {
        let mut workers = self.workers.lock().await;
        if workers.is_empty() {
            return;
        }

        tracing::info!(count = workers.len(), "stopping collection workers");
        for handle in workers.iter() {
            let _ = handle.stop_tx.send(());
        }

        for handle in workers.drain(..) {
            if let Err(e) = handle.join.await {
                tracing::warn!(firewall = %handle.name, error = %e, "worker did not stop cleanly");
            }
        }
        tracing::info!("all collection workers stopped");
    }

    /// Read-only per-target status for dashboards and the health check.
    pub fn snapshot(&self) -> HashMap<String, TargetStatus> {
        self.status.snapshot()
    }

    /// In-memory sample counts per target, for the health surface.
    pub fn buffer_occupancy(&self) -> HashMap<String, usize> {
        self.buffers
            .lock()
            .unwrap()
            .iter()
            .map(|(name, buf)| (name.clone(), buf.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn test_target(name: &str, enabled: bool) -> TargetConfig {
        TargetConfig {
            name: name.to_string(),
            // Nothing listens here; connections are refused immediately.
            host: "https://127.0.0.1:1".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            verify_ssl: false,
            enabled,
            poll_interval: 1,
            session_sample_interval: 0.2,
        }
    }

    fn test_supervisor(pool_size: usize) -> (Supervisor, Arc<Store>, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::open(tmp.path(), pool_size).unwrap());
        let global = GlobalConfig {
            auth_failure_limit: 2,
            ..Default::default()
        };
        (Supervisor::new(global, store.clone()), store, tmp)
    }

    #[tokio::test]
    async fn test_disabled_targets_get_no_worker() {
        let (supervisor, _store, _tmp) = test_supervisor(2);
        supervisor.register(test_target("off", false));
        supervisor.start_all().await;

        assert!(supervisor.snapshot().is_empty());
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_all_joins_workers_and_releases_pool() {
        let (supervisor, store, _tmp) = test_supervisor(2);
        supervisor.register(test_target("fw1", true));
        supervisor.register(test_target("fw2", true));
        supervisor.start_all().await;

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        supervisor.stop_all().await;

        // Every worker joined; nothing still holds a store connection.
        assert_eq!(store.pool().checked_out(), 0);
        for status in supervisor.snapshot().values() {
            assert_eq!(status.state, WorkerState::Stopped);
        }
    }

    #[tokio::test]
    async fn test_unreachable_target_stops_after_auth_failure_limit() {
        let (supervisor, _store, _tmp) = test_supervisor(2);
        supervisor.register(test_target("dead", true));
        supervisor.start_all().await;

        // Two failed auth attempts one poll interval apart, then give up.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            let snap = supervisor.snapshot();
            if snap.get("dead").map(|s| s.state) == Some(WorkerState::Stopped) {
                assert!(snap["dead"].last_error.is_some());
                assert!(snap["dead"].auth_failures >= 2);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "worker never stopped");
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_buffer_occupancy_reported_per_target() {
        let (supervisor, _store, _tmp) = test_supervisor(2);
        supervisor.register(test_target("fw1", true));
        supervisor.register(test_target("fw2", false));

        let occupancy = supervisor.buffer_occupancy();
        assert_eq!(occupancy.len(), 2);
        assert_eq!(occupancy["fw1"], 0);
    }
}
