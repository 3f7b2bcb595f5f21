//! Window aggregation: reduces a boundary window of raw samples into
//! per-stream statistics plus quality metadata.
//!
//! Pure functions of their input; the worker owns all I/O around them.

use crate::buffer::{MetricStream, RawSample};

/// Summary statistics for one metric stream within a window.
///
/// Computed over successful values only. `None` when the window held no
/// successful sample for the stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamStats {
    pub mean: Option<f64>,
    pub max: Option<f64>,
    pub min: Option<f64>,
    pub p95: Option<f64>,
}

impl StreamStats {
    /// Compute mean/max/min/p95 over the given values.
    ///
    /// p95 uses the nearest-rank method: with the values sorted ascending,
    /// index `ceil(0.95 * n) - 1`. Fixtures elsewhere assume this method.
    pub fn compute(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let sum: f64 = sorted.iter().sum();
        let mean = sum / sorted.len() as f64;

        Self {
            mean: Some(mean),
            max: sorted.last().copied(),
            min: sorted.first().copied(),
            p95: nearest_rank(&sorted, 0.95),
        }
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn nearest_rank(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = (q * n as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(n - 1);
    Some(sorted[idx])
}

/// How representative a window's aggregate is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowQuality {
    /// Attempted sampler ticks in the window (success or failure).
    pub sample_count: i64,
    /// Successful ticks / attempted ticks; exactly 0.0 for an empty window.
    pub success_rate: f64,
    /// Span between first and last sample timestamp; 0 with <= 1 sample.
    pub sampling_period_seconds: f64,
}

/// Aggregate of one boundary window of session samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowSummary {
    pub throughput: StreamStats,
    pub packet_rate: StreamStats,
    pub quality: WindowQuality,
}

/// Reduce one window of raw samples into a summary.
///
/// Every sampler tick emits a Throughput-stream sample whether or not the
/// query succeeded, so that stream's attempts are the quality denominator.
pub fn aggregate_window(samples: &[RawSample]) -> WindowSummary {
    let throughput_values: Vec<f64> = stream_values(samples, MetricStream::Throughput);
    let packet_rate_values: Vec<f64> = stream_values(samples, MetricStream::PacketRate);

    let attempted = samples
        .iter()
        .filter(|s| s.stream == MetricStream::Throughput)
        .count() as i64;
    let successful = throughput_values.len() as i64;

    let success_rate = if attempted > 0 {
        successful as f64 / attempted as f64
    } else {
        0.0
    };

    let sampling_period_seconds = match (samples.first(), samples.last()) {
        (Some(first), Some(last)) if samples.len() > 1 => {
            (last.timestamp - first.timestamp)
                .num_milliseconds()
                .max(0) as f64
                / 1000.0
        }
        _ => 0.0,
    };

    WindowSummary {
        throughput: StreamStats::compute(&throughput_values),
        packet_rate: StreamStats::compute(&packet_rate_values),
        quality: WindowQuality {
            sample_count: attempted,
            success_rate,
            sampling_period_seconds,
        },
    }
}

fn stream_values(samples: &[RawSample], stream: MetricStream) -> Vec<f64> {
    samples
        .iter()
        .filter(|s| s.stream == stream && s.success)
        .map(|s| s.value)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample(stream: MetricStream, secs: i64, value: f64, success: bool) -> RawSample {
        RawSample {
            stream,
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            value,
            success,
        }
    }

    #[test]
    fn test_stream_stats_dataplane_fixture() {
        // Eight data-plane CPU readings.
        let values = [5.0, 12.0, 8.0, 3.0, 45.0, 67.0, 23.0, 15.0];
        let stats = StreamStats::compute(&values);

        assert!((stats.mean.unwrap() - 22.25).abs() < 1e-9);
        assert_eq!(stats.max, Some(67.0));
        assert_eq!(stats.min, Some(3.0));
        // Nearest rank: ceil(0.95 * 8) = 8 -> highest value.
        assert_eq!(stats.p95, Some(67.0));
    }

    #[test]
    fn test_stats_ordering_invariants() {
        let values = [9.0, 1.0, 4.0, 4.0, 7.0, 2.0, 8.0, 3.0, 6.0, 5.0];
        let stats = StreamStats::compute(&values);
        let (min, max, mean, p95) = (
            stats.min.unwrap(),
            stats.max.unwrap(),
            stats.mean.unwrap(),
            stats.p95.unwrap(),
        );
        assert!(min <= p95 && p95 <= max);
        assert!(min <= mean && mean <= max);
    }

    #[test]
    fn test_nearest_rank_small_inputs() {
        assert_eq!(nearest_rank(&[42.0], 0.95), Some(42.0));
        assert_eq!(nearest_rank(&[1.0, 2.0], 0.95), Some(2.0));
        assert_eq!(nearest_rank(&[], 0.95), None);
    }

    #[test]
    fn test_empty_stats() {
        let stats = StreamStats::compute(&[]);
        assert_eq!(stats, StreamStats::default());
    }

    #[test]
    fn test_quality_counts_attempts_not_successes() {
        // 30 attempted ticks, 2 of them failed.
        let mut samples = Vec::new();
        for i in 0..30 {
            let ok = i != 10 && i != 20;
            if ok {
                samples.push(sample(MetricStream::Throughput, i, 100.0 + i as f64, true));
                samples.push(sample(MetricStream::PacketRate, i, 1000.0, true));
            } else {
                samples.push(sample(MetricStream::Throughput, i, 0.0, false));
                samples.push(sample(MetricStream::PacketRate, i, 0.0, false));
            }
        }

        let summary = aggregate_window(&samples);
        assert_eq!(summary.quality.sample_count, 30);
        assert!((summary.quality.success_rate - 28.0 / 30.0).abs() < 1e-9);
        assert!((summary.quality.sampling_period_seconds - 29.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_window_yields_zero_rate_not_nan() {
        let summary = aggregate_window(&[]);
        assert_eq!(summary.quality.sample_count, 0);
        assert_eq!(summary.quality.success_rate, 0.0);
        assert!(!summary.quality.success_rate.is_nan());
        assert_eq!(summary.throughput.mean, None);
    }

    #[test]
    fn test_all_failures_window() {
        let samples = vec![
            sample(MetricStream::Throughput, 0, 0.0, false),
            sample(MetricStream::Throughput, 1, 0.0, false),
        ];
        let summary = aggregate_window(&samples);
        assert_eq!(summary.quality.sample_count, 2);
        assert_eq!(summary.quality.success_rate, 0.0);
        // No successful values: statistics stay unset.
        assert_eq!(summary.throughput.max, None);
    }

    #[test]
    fn test_single_sample_period_is_zero() {
        let samples = vec![sample(MetricStream::Throughput, 5, 10.0, true)];
        let summary = aggregate_window(&samples);
        assert_eq!(summary.quality.sampling_period_seconds, 0.0);
        assert_eq!(summary.throughput.mean, Some(10.0));
    }

    #[test]
    fn test_failed_pps_degrades_only_that_stream() {
        // Tick succeeded for throughput but the response lacked pps.
        let samples = vec![
            sample(MetricStream::Throughput, 0, 200.0, true),
            sample(MetricStream::PacketRate, 0, 0.0, false),
        ];
        let summary = aggregate_window(&samples);
        assert_eq!(summary.quality.success_rate, 1.0);
        assert_eq!(summary.throughput.mean, Some(200.0));
        assert_eq!(summary.packet_rate.mean, None);
    }
}
