//! Per-target sampling worker.
//!
//! Each worker runs two cadences against one firewall: a fast session
//! sampler feeding the in-memory buffer, and a slow structural poller that
//! closes each boundary window, aggregates it, and writes the record.

use super::StatusBoard;
use crate::aggregate::{aggregate_window, StreamStats};
use crate::buffer::{MetricStream, RawSample, SampleBuffer};
use crate::client::{
    self, ClientError, PanClient, CMD_RESOURCE_MONITOR, CMD_SESSION_INFO, CMD_SYSTEM_INFO,
    CMD_SYSTEM_RESOURCES,
};
use crate::config::{GlobalConfig, TargetConfig};
use crate::db::{FirewallIdentity, MetricRecord, Store};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Bounded timeout for session samples; a slow target must not back up
/// the sampler for long.
const FAST_TIMEOUT: Duration = Duration::from_secs(5);
/// Structural queries are heavier on the management plane.
const STRUCT_TIMEOUT: Duration = Duration::from_secs(30);

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Authenticated,
    Running,
    Stopping,
    Stopped,
}

enum CycleError {
    /// Authentication failed even after the single retry.
    Auth(String),
    /// Every structural query failed for non-auth reasons.
    Unreachable(String),
}

/// One target's collection worker.
pub struct Worker {
    cfg: TargetConfig,
    global: GlobalConfig,
    buffer: Arc<SampleBuffer>,
    store: Arc<Store>,
    status: Arc<StatusBoard>,
}

impl Worker {
    pub fn new(
        cfg: TargetConfig,
        global: GlobalConfig,
        buffer: Arc<SampleBuffer>,
        store: Arc<Store>,
        status: Arc<StatusBoard>,
    ) -> Self {
        Self {
            cfg,
            global,
            buffer,
            store,
            status,
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.status.update(&self.cfg.name, |s| s.state = state);
    }

    fn record_error(&self, error: &str) {
        let error = error.to_string();
        self.status.update(&self.cfg.name, |s| s.last_error = Some(error));
    }

    /// Drive the worker until a stop request, a fatal error, or too many
    /// consecutive authentication failures.
    pub async fn run(self, mut stop_rx: broadcast::Receiver<()>) {
        self.set_state(WorkerState::Starting);

        let client = match PanClient::new(&self.cfg.host, self.cfg.verify_ssl) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                tracing::error!(firewall = %self.cfg.name, error = %e, "failed to build client");
                self.record_error(&e.to_string());
                self.set_state(WorkerState::Stopped);
                return;
            }
        };

        if !self.initial_authentication(&client, &mut stop_rx).await {
            return;
        }
        self.set_state(WorkerState::Authenticated);
        tracing::info!(firewall = %self.cfg.name, "authenticated");

        // The session sampler runs beside the poll loop so a slow
        // structural query never starves it.
        let (fast_stop_tx, fast_stop_rx) = broadcast::channel(1);
        let fast = tokio::spawn(run_fast_sampler(
            client.clone(),
            self.cfg.clone(),
            self.buffer.clone(),
            fast_stop_rx,
        ));

        self.poll_loop(&client, &mut stop_rx).await;

        self.set_state(WorkerState::Stopping);
        let _ = fast_stop_tx.send(());
        let _ = fast.await;
        self.set_state(WorkerState::Stopped);
        tracing::info!(firewall = %self.cfg.name, "worker stopped");
    }

    /// Acquire the first API key, retrying once per poll interval until the
    /// failure limit is reached. Returns false when the worker should exit.
    async fn initial_authentication(
        &self,
        client: &PanClient,
        stop_rx: &mut broadcast::Receiver<()>,
    ) -> bool {
        let mut failures = 0u32;
        loop {
            match client
                .authenticate(&self.cfg.username, &self.cfg.password)
                .await
            {
                Ok(()) => {
                    self.status.update(&self.cfg.name, |s| s.auth_failures = 0);
                    return true;
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        firewall = %self.cfg.name,
                        attempt = failures,
                        error = %e,
                        "authentication failed"
                    );
                    self.status.update(&self.cfg.name, |s| {
                        s.auth_failures = failures;
                        s.last_error = Some(e.to_string());
                    });
                    if failures >= self.global.auth_failure_limit {
                        tracing::error!(
                            firewall = %self.cfg.name,
                            "giving up after {failures} authentication failures; target unreachable"
                        );
                        self.set_state(WorkerState::Stopped);
                        return false;
                    }
                }
            }

            tokio::select! {
                _ = stop_rx.recv() => {
                    self.set_state(WorkerState::Stopped);
                    return false;
                }
                _ = tokio::time::sleep(Duration::from_secs(self.cfg.poll_interval)) => {}
            }
        }
    }

    async fn poll_loop(&self, client: &Arc<PanClient>, stop_rx: &mut broadcast::Receiver<()>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.cfg.poll_interval));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Consume the immediate first tick: the first window should span a
        // full poll interval of fast samples.
        interval.tick().await;

        self.set_state(WorkerState::Running);
        let mut boundary = Utc::now();
        let mut identity_done = false;
        let mut auth_streak = 0u32;

        loop {
            tokio::select! {
                _ = stop_rx.recv() => return,
                _ = interval.tick() => {
                    match self.poll_cycle(client, boundary, &mut identity_done).await {
                        Ok(now) => {
                            boundary = now;
                            auth_streak = 0;
                            self.status.update(&self.cfg.name, |s| {
                                s.state = WorkerState::Running;
                                s.last_success = Some(now);
                                s.poll_count += 1;
                                s.auth_failures = 0;
                            });
                        }
                        Err(CycleError::Auth(msg)) => {
                            auth_streak += 1;
                            tracing::warn!(
                                firewall = %self.cfg.name,
                                streak = auth_streak,
                                error = %msg,
                                "poll cycle hit authentication failure"
                            );
                            self.status.update(&self.cfg.name, |s| {
                                s.state = WorkerState::Authenticated;
                                s.last_error = Some(msg.clone());
                                s.auth_failures = auth_streak;
                            });
                            if auth_streak >= self.global.auth_failure_limit {
                                tracing::error!(
                                    firewall = %self.cfg.name,
                                    "authentication failing persistently; marking target unreachable"
                                );
                                return;
                            }
                            boundary = self.skip_window();
                        }
                        Err(CycleError::Unreachable(msg)) => {
                            tracing::warn!(
                                firewall = %self.cfg.name,
                                error = %msg,
                                "poll cycle failed, retrying at next interval"
                            );
                            self.record_error(&msg);
                            boundary = self.skip_window();
                        }
                    }
                }
            }
        }
    }

    /// Abandon the current window after a failed cycle. Its samples are
    /// dropped so the next record never spans more than one poll interval.
    fn skip_window(&self) -> DateTime<Utc> {
        let now = Utc::now();
        self.buffer.evict_older_than(now);
        now
    }

    /// One structural poll: query the management plane, close the boundary
    /// window, and write the aggregated record.
    async fn poll_cycle(
        &self,
        client: &Arc<PanClient>,
        boundary: DateTime<Utc>,
        identity_done: &mut bool,
    ) -> Result<DateTime<Utc>, CycleError> {
        let mut mgmt = client::MgmtCpuReading::default();
        let mut dp_cores: Vec<f64> = Vec::new();
        let mut pbuf: Option<f64> = None;
        let mut errors: Vec<String> = Vec::new();
        let mut auth_failed = false;
        let mut any_ok = false;

        match self.op(client, CMD_SYSTEM_RESOURCES).await {
            Ok(xml) => {
                mgmt = client::parse::parse_mgmt_cpu(&xml);
                any_ok = true;
            }
            Err(e) => {
                auth_failed |= is_auth_error(&e);
                errors.push(format!("system resources: {e}"));
            }
        }

        match self.op(client, CMD_RESOURCE_MONITOR).await {
            Ok(xml) => {
                dp_cores = client::parse::parse_dp_core_loads(&xml);
                pbuf = client::parse::parse_packet_buffer(&xml);
                any_ok = true;
            }
            Err(e) => {
                auth_failed |= is_auth_error(&e);
                errors.push(format!("resource monitor: {e}"));
            }
        }

        if !*identity_done {
            match self.op(client, CMD_SYSTEM_INFO).await {
                Ok(xml) => {
                    let identity = client::parse::parse_system_info(&xml);
                    if !identity.is_empty() {
                        match self.write_identity(&identity) {
                            Ok(()) => *identity_done = true,
                            Err(e) => tracing::warn!(
                                firewall = %self.cfg.name,
                                error = %e,
                                "failed to store identity"
                            ),
                        }
                    }
                    any_ok = true;
                }
                Err(e) => {
                    auth_failed |= is_auth_error(&e);
                    errors.push(format!("system info: {e}"));
                }
            }
        }

        if !any_ok {
            let joined = errors.join("; ");
            return if auth_failed {
                Err(CycleError::Auth(joined))
            } else {
                Err(CycleError::Unreachable(joined))
            };
        }

        let now = Utc::now();
        let window = self.buffer.drain_window(boundary, now);
        let summary = aggregate_window(&window);
        let dp = StreamStats::compute(&dp_cores);

        let record = MetricRecord {
            firewall_name: self.cfg.name.clone(),
            timestamp: now,
            cpu_user: mgmt.cpu_user,
            cpu_system: mgmt.cpu_system,
            cpu_idle: mgmt.cpu_idle,
            mgmt_cpu: mgmt.mgmt_cpu,
            data_plane_cpu_mean: dp.mean,
            data_plane_cpu_max: dp.max,
            data_plane_cpu_p95: dp.p95,
            throughput_mbps_mean: summary.throughput.mean,
            throughput_mbps_max: summary.throughput.max,
            throughput_mbps_min: summary.throughput.min,
            throughput_mbps_p95: summary.throughput.p95,
            pps_mean: summary.packet_rate.mean,
            pps_max: summary.packet_rate.max,
            pps_min: summary.packet_rate.min,
            pps_p95: summary.packet_rate.p95,
            pbuf_util_percent: pbuf,
            session_sample_count: summary.quality.sample_count,
            session_success_rate: summary.quality.success_rate,
            session_sampling_period: summary.quality.sampling_period_seconds,
        };

        if let Err(e) = self.store.write_record(&record) {
            // The record is gone, but the worker keeps collecting.
            tracing::error!(
                firewall = %record.firewall_name,
                timestamp = %record.timestamp,
                error = %e,
                "dropping metric record after store failure"
            );
        }

        tracing::debug!(
            firewall = %self.cfg.name,
            samples = summary.quality.sample_count,
            success_rate = summary.quality.success_rate,
            "poll cycle complete"
        );

        Ok(now)
    }

    async fn op(&self, client: &Arc<PanClient>, cmd: &str) -> Result<String, ClientError> {
        client
            .op_with_reauth(cmd, STRUCT_TIMEOUT, &self.cfg.username, &self.cfg.password)
            .await
    }

    fn write_identity(&self, identity: &client::IdentityReading) -> Result<(), crate::db::StoreError> {
        self.store.write_identity(
            &self.cfg.name,
            &FirewallIdentity {
                model: identity.model.clone(),
                family: identity.family.clone(),
                platform_family: identity.platform_family.clone(),
                serial: identity.serial.clone(),
                hostname: identity.hostname.clone(),
                sw_version: identity.sw_version.clone(),
            },
        )
    }
}

fn is_auth_error(e: &ClientError) -> bool {
    matches!(e, ClientError::Auth(_) | ClientError::AuthExpired)
}

/// The fast cadence: one bounded session query per tick, every outcome
/// recorded as a sample.
async fn run_fast_sampler(
    client: Arc<PanClient>,
    cfg: TargetConfig,
    buffer: Arc<SampleBuffer>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval =
        tokio::time::interval(Duration::from_secs_f64(cfg.session_sample_interval));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                // Spread ticks out so a fleet of workers doesn't align.
                let jitter = rand::random::<u64>() % 100;
                tokio::time::sleep(Duration::from_millis(jitter)).await;

                let ts = Utc::now();
                match client
                    .op_with_reauth(CMD_SESSION_INFO, FAST_TIMEOUT, &cfg.username, &cfg.password)
                    .await
                {
                    Ok(xml) => {
                        let reading = client::parse::parse_session_info(&xml);
                        buffer.append(match reading.throughput_mbps {
                            Some(v) => RawSample::success(MetricStream::Throughput, ts, v),
                            None => RawSample::failure(MetricStream::Throughput, ts),
                        });
                        buffer.append(match reading.pps {
                            Some(v) => RawSample::success(MetricStream::PacketRate, ts, v),
                            None => RawSample::failure(MetricStream::PacketRate, ts),
                        });
                    }
                    Err(e) => {
                        tracing::debug!(firewall = %cfg.name, error = %e, "session sample failed");
                        buffer.append(RawSample::failure(MetricStream::Throughput, ts));
                        buffer.append(RawSample::failure(MetricStream::PacketRate, ts));
                    }
                }
            }
        }
    }
}
