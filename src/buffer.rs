//! In-memory buffer of raw samples for one target.
//!
//! Bounded by both count and age so memory stays flat over multi-day runs
//! no matter how fast the sampler ticks.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;

/// The metric streams produced by the session sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricStream {
    Throughput,
    PacketRate,
}

/// One raw observation from the session sampler.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub stream: MetricStream,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub success: bool,
}

impl RawSample {
    pub fn success(stream: MetricStream, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            stream,
            timestamp,
            value,
            success: true,
        }
    }

    /// Failed attempts are recorded too; they feed the success-rate denominator.
    pub fn failure(stream: MetricStream, timestamp: DateTime<Utc>) -> Self {
        Self {
            stream,
            timestamp,
            value: 0.0,
            success: false,
        }
    }
}

/// Fixed-capacity sample buffer shared by one target's two sampling loops.
pub struct SampleBuffer {
    inner: Mutex<VecDeque<RawSample>>,
    max_samples: usize,
    max_age: ChronoDuration,
}

impl SampleBuffer {
    pub fn new(max_samples: usize, max_age_seconds: i64) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(max_samples.min(1024))),
            max_samples: max_samples.max(1),
            max_age: ChronoDuration::seconds(max_age_seconds.max(1)),
        }
    }

    /// Append one sample, evicting the oldest entries past either bound.
    pub fn append(&self, sample: RawSample) {
        let mut buf = self.inner.lock().unwrap();

        let horizon = sample.timestamp - self.max_age;
        while buf.front().is_some_and(|s| s.timestamp < horizon) {
            buf.pop_front();
        }
        while buf.len() >= self.max_samples {
            buf.pop_front();
        }
        buf.push_back(sample);
    }

    /// Remove and return samples with `start <= ts < end`, leaving newer ones.
    ///
    /// Half-open on the right so adjacent boundary windows never double-count.
    pub fn drain_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<RawSample> {
        let mut buf = self.inner.lock().unwrap();
        let mut window = Vec::new();
        let mut keep = VecDeque::with_capacity(buf.len());

        for sample in buf.drain(..) {
            if sample.timestamp < start {
                // Older than the window: already aggregated or expired.
                continue;
            }
            if sample.timestamp < end {
                window.push(sample);
            } else {
                keep.push_back(sample);
            }
        }
        *buf = keep;
        window.sort_by_key(|s| s.timestamp);
        window
    }

    /// Drop everything older than the horizon.
    pub fn evict_older_than(&self, horizon: DateTime<Utc>) {
        let mut buf = self.inner.lock().unwrap();
        while buf.front().is_some_and(|s| s.timestamp < horizon) {
            buf.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_count_cap_enforced() {
        let buf = SampleBuffer::new(10, 3600);
        for i in 0..100 {
            buf.append(RawSample::success(MetricStream::Throughput, ts(i), i as f64));
        }
        assert_eq!(buf.len(), 10);

        // Oldest were evicted first.
        let window = buf.drain_window(ts(0), ts(1000));
        assert_eq!(window.first().unwrap().value, 90.0);
    }

    #[test]
    fn test_age_cap_enforced() {
        let buf = SampleBuffer::new(1000, 60);
        buf.append(RawSample::success(MetricStream::Throughput, ts(0), 1.0));
        buf.append(RawSample::success(MetricStream::Throughput, ts(30), 2.0));
        // 100s later: both prior samples are past the 60s horizon.
        buf.append(RawSample::success(MetricStream::Throughput, ts(100), 3.0));
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_drain_window_is_half_open() {
        let buf = SampleBuffer::new(100, 3600);
        for i in 0..10 {
            buf.append(RawSample::success(MetricStream::Throughput, ts(i), i as f64));
        }

        let window = buf.drain_window(ts(2), ts(5));
        let values: Vec<f64> = window.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);

        // ts(5) onward stayed for the next boundary; no double counting.
        let next = buf.drain_window(ts(5), ts(20));
        let values: Vec<f64> = next.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_drain_discards_samples_before_window() {
        let buf = SampleBuffer::new(100, 3600);
        buf.append(RawSample::success(MetricStream::PacketRate, ts(0), 1.0));
        buf.append(RawSample::success(MetricStream::PacketRate, ts(10), 2.0));

        let window = buf.drain_window(ts(5), ts(20));
        assert_eq!(window.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_evict_older_than() {
        let buf = SampleBuffer::new(100, 3600);
        for i in 0..10 {
            buf.append(RawSample::success(MetricStream::Throughput, ts(i), i as f64));
        }
        buf.evict_older_than(ts(7));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_failures_are_kept() {
        let buf = SampleBuffer::new(100, 3600);
        buf.append(RawSample::failure(MetricStream::Throughput, ts(0)));
        buf.append(RawSample::success(MetricStream::Throughput, ts(1), 5.0));
        let window = buf.drain_window(ts(0), ts(10));
        assert_eq!(window.len(), 2);
        assert!(!window[0].success);
    }
}
