//! Database model types.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One aggregated metrics row, keyed by `(firewall_name, timestamp)`.
///
/// Statistical fields are `None` when the source window held no successful
/// sample for the stream.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricRecord {
    pub firewall_name: String,
    pub timestamp: DateTime<Utc>,

    // Management plane, point-in-time.
    pub cpu_user: Option<f64>,
    pub cpu_system: Option<f64>,
    pub cpu_idle: Option<f64>,
    pub mgmt_cpu: Option<f64>,

    // Data plane CPU aggregated across cores.
    pub data_plane_cpu_mean: Option<f64>,
    pub data_plane_cpu_max: Option<f64>,
    pub data_plane_cpu_p95: Option<f64>,

    // Session sampler aggregates over the boundary window.
    pub throughput_mbps_mean: Option<f64>,
    pub throughput_mbps_max: Option<f64>,
    pub throughput_mbps_min: Option<f64>,
    pub throughput_mbps_p95: Option<f64>,
    pub pps_mean: Option<f64>,
    pub pps_max: Option<f64>,
    pub pps_min: Option<f64>,
    pub pps_p95: Option<f64>,

    pub pbuf_util_percent: Option<f64>,

    // Sampling quality.
    pub session_sample_count: i64,
    pub session_success_rate: f64,
    pub session_sampling_period: f64,
}

/// Hardware and version identity for one firewall.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FirewallIdentity {
    pub model: Option<String>,
    pub family: Option<String>,
    pub platform_family: Option<String>,
    pub serial: Option<String>,
    pub hostname: Option<String>,
    pub sw_version: Option<String>,
}

/// A registered firewall with identity and activity summary.
#[derive(Debug, Clone, Serialize)]
pub struct FirewallRow {
    pub name: String,
    pub host: String,
    pub identity: FirewallIdentity,
    pub metric_count: i64,
    pub last_metric_time: Option<DateTime<Utc>>,
}

/// Store-level statistics for the health surface.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub db_size_bytes: i64,
    pub total_metrics: i64,
}
