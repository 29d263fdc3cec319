//! Second/minute/hour/day rolling trend plus CDF quantile aggregation.
//!
//! Ported from the reference implementation's `monitor.cc`: a 174-slot ring
//! laid out `[0:30)` days, `[30:54)` hours, `[54:114)` minutes,
//! `[114:174)` seconds, rotated once per wall-clock second by modulo gates
//! on an iteration counter (60 for minutes, 3600 for hours, 86400 for days).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::RwLock;

/// How a named series' raw events are reduced into its trend slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind {
    /// Arithmetic mean over the window.
    Avg,
    /// Maximum value in the window.
    Max,
    /// Minimum value in the window.
    Min,
    /// Sum over the window (treated as a per-second rate).
    Inc,
    /// Percentile distribution rather than a single trend value.
    Cdf,
}

const TREND_SLOTS: usize = 174;
const CDF_SLOTS: usize = 20;
const DAY_END: usize = 30;
const HOUR_END: usize = 54;
const MINUTE_END: usize = 114;
const SECOND_END: usize = 174;

const CDF_PERCENTILES: [f64; CDF_SLOTS] = [
    10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 91.0, 92.0, 93.0, 94.0, 95.0, 96.0, 97.0,
    98.0, 99.0, 99.9, 99.99,
];

struct EventBuffer {
    events: Vec<(i64, f64)>,
}

impl EventBuffer {
    fn new() -> Self {
        Self { events: Vec::new() }
    }

    fn push(&mut self, second_epoch: i64, value: f64) {
        self.events.push((second_epoch, value));
    }

    /// Drop entries older than `cur_second - 1`, then split off everything
    /// from exactly `cur_second - 1` as the prior-second window.
    fn take_prior_second_window(&mut self, cur_second: i64) -> Vec<f64> {
        let floor = cur_second - 1;
        self.events.retain(|(ts, _)| *ts >= floor);
        let (window, keep): (Vec<_>, Vec<_>) = self.events.drain(..).partition(|(ts, _)| *ts < cur_second);
        self.events = keep;
        window.into_iter().map(|(_, v)| v).collect()
    }
}

/// One named, aggregation-typed series.
struct MetricsSeries {
    kind: AggKind,
    buffer: EventBuffer,
    trend: [f64; TREND_SLOTS],
    cdf: [f64; CDF_SLOTS],
    iter: u64,
}

impl MetricsSeries {
    fn new(kind: AggKind) -> Self {
        Self {
            kind,
            buffer: EventBuffer::new(),
            trend: [0.0; TREND_SLOTS],
            cdf: [0.0; CDF_SLOTS],
            iter: 0,
        }
    }

    fn tick(&mut self, cur_second: i64) {
        let window = self.buffer.take_prior_second_window(cur_second);
        match self.kind {
            AggKind::Cdf => self.tick_cdf(&window),
            _ => self.tick_trend(&window),
        }
        self.iter += 1;
        if self.iter % 60 == 0 {
            // Seconds window [114:174) has just completed a full minute;
            // fold its mean into the minutes window [54:114).
            rotate_in(&mut self.trend, HOUR_END, MINUTE_END, SECOND_END);
        }
        if self.iter % 3600 == 0 {
            // Minutes window [54:114) has just completed a full hour.
            rotate_in(&mut self.trend, DAY_END, HOUR_END, MINUTE_END);
        }
        if self.iter % 86400 == 0 {
            // Hours window [30:54) has just completed a full day.
            rotate_in(&mut self.trend, 0, DAY_END, HOUR_END);
            self.iter = 0;
        }
    }

    fn tick_trend(&mut self, window: &[f64]) {
        let value = match self.kind {
            AggKind::Avg => avg(window),
            AggKind::Max => {
                if window.is_empty() {
                    0.0
                } else {
                    window.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
                }
            }
            AggKind::Min => {
                if window.is_empty() {
                    0.0
                } else {
                    window.iter().cloned().fold(f64::INFINITY, f64::min)
                }
            }
            AggKind::Inc => window.iter().sum(),
            AggKind::Cdf => unreachable!(),
        };
        self.trend.copy_within(MINUTE_END + 1..SECOND_END, MINUTE_END);
        self.trend[SECOND_END - 1] = value;
    }

    fn tick_cdf(&mut self, window: &[f64]) {
        if window.is_empty() {
            self.cdf = [0.0; CDF_SLOTS];
            return;
        }
        let mut sorted = window.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let n = sorted.len();
        for (i, pct) in CDF_PERCENTILES.iter().enumerate() {
            let idx = ((pct / 100.0) * n as f64).ceil() as usize;
            let idx = idx.clamp(1, n) - 1;
            self.cdf[i] = sorted[idx];
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self.kind {
            AggKind::Cdf => {
                let data: Vec<_> = CDF_PERCENTILES
                    .iter()
                    .zip(self.cdf.iter())
                    .map(|(pct, val)| json!([pct, val]))
                    .collect();
                json!({"label": "cdf", "data": data})
            }
            _ => {
                let data: Vec<_> = self
                    .trend
                    .iter()
                    .enumerate()
                    .map(|(i, val)| json!([i, val]))
                    .collect();
                json!({"label": "trend", "data": data})
            }
        }
    }
}

/// Fold the mean of the just-completed finer-grained window `[dst_end,
/// src_end)` into the coarser window `[dst_start, dst_end)`: shift the
/// coarser window left by one slot and write the mean at its last index.
fn rotate_in(trend: &mut [f64; TREND_SLOTS], dst_start: usize, dst_end: usize, src_end: usize) {
    let mean = avg(&trend[dst_end..src_end]);
    trend.copy_within(dst_start + 1..dst_end, dst_start);
    trend[dst_end - 1] = mean;
}

fn avg(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Process-wide registry of named metrics series.
pub struct MetricsAggregator {
    series: Arc<RwLock<HashMap<String, MetricsSeries>>>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    /// Construct an empty aggregator. Does not start the per-second ticker;
    /// call [`Self::spawn_ticker`] once at bootstrap.
    pub fn new() -> Self {
        Self {
            series: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Non-blocking: append `(cur_second, value)` to the named series,
    /// creating it with `kind` on first use. A later call with a different
    /// `kind` for the same name is rejected and logged.
    pub async fn record(&self, name: &str, value: f64, kind: AggKind, cur_second: i64) {
        let mut guard = self.series.write().await;
        match guard.get_mut(name) {
            Some(series) => {
                if series.kind != kind {
                    tracing::warn!(series = name, ?kind, existing = ?series.kind, "metric kind mismatch, dropping");
                    return;
                }
                series.buffer.push(cur_second, value);
            }
            None => {
                let mut series = MetricsSeries::new(kind);
                series.buffer.push(cur_second, value);
                guard.insert(name.to_string(), series);
            }
        }
    }

    /// Snapshot a named series in its canonical JSON shape.
    pub async fn snapshot(&self, name: &str) -> Option<serde_json::Value> {
        self.series.read().await.get(name).map(MetricsSeries::to_json)
    }

    /// All currently-registered series names.
    pub async fn names(&self) -> Vec<String> {
        self.series.read().await.keys().cloned().collect()
    }

    /// Drive every series' per-second tick once.
    pub async fn tick_all(&self, cur_second: i64) {
        let mut guard = self.series.write().await;
        for (name, series) in guard.iter_mut() {
            series.tick(cur_second);
            if series.iter == 0 {
                tracing::trace!(series = name, "metrics: completed daily rotation");
            }
        }
    }

    /// Spawn the background task that ticks every series once per wall-clock
    /// second, matching the source's dedicated per-second scheduler.
    pub fn spawn_ticker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let cur_second = chrono::Utc::now().timestamp();
                this.tick_all(cur_second).await;
            }
        })
    }

    /// The latest seconds-window value, slot 173 of the trend ring.
    #[cfg(test)]
    async fn latest_second(&self, name: &str) -> Option<f64> {
        self.series.read().await.get(name).map(|s| s.trend[SECOND_END - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trend_slot_reflects_prior_second_then_decays_to_zero() {
        let agg = MetricsAggregator::new();
        agg.record("latency", 10.0, AggKind::Avg, 100).await;
        agg.record("latency", 20.0, AggKind::Avg, 100).await;
        agg.tick_all(101).await;
        assert_eq!(agg.latest_second("latency").await, Some(15.0));

        agg.tick_all(102).await;
        assert_eq!(agg.latest_second("latency").await, Some(0.0));
    }

    #[tokio::test]
    async fn cdf_with_empty_window_is_all_zero() {
        let agg = MetricsAggregator::new();
        agg.record("lat_cdf", 1.0, AggKind::Cdf, 5).await;
        agg.tick_all(100).await;
        let snap = agg.snapshot("lat_cdf").await.unwrap();
        let data = snap["data"].as_array().unwrap();
        assert!(data.iter().all(|pair| pair[1].as_f64() == Some(0.0)));
    }

    #[tokio::test]
    async fn mismatched_kind_is_dropped_not_panicking() {
        let agg = MetricsAggregator::new();
        agg.record("x", 1.0, AggKind::Avg, 1).await;
        agg.record("x", 1.0, AggKind::Max, 1).await;
        agg.tick_all(2).await;
        assert_eq!(agg.latest_second("x").await, Some(1.0));
    }

    #[tokio::test]
    async fn minute_rotation_happens_every_sixty_ticks() {
        let agg = MetricsAggregator::new();
        let mut cur = 0i64;
        for _ in 0..61 {
            cur += 1;
            agg.record("m", 2.0, AggKind::Avg, cur).await;
            agg.tick_all(cur + 1).await;
        }
        let snap = agg.snapshot("m").await.unwrap();
        let data = snap["data"].as_array().unwrap();
        let minute_slot = data[MINUTE_END - 1][1].as_f64().unwrap();
        assert!((minute_slot - 2.0).abs() < 1e-9);
    }
}
