use crate::metrics::*;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Group readings into epoch-aligned buckets of `bucket_width` and reduce each
/// bucket per [`Metric::reduction`]. Output is ascending by bucket start; buckets
/// without readings are not emitted.
pub fn aggregate(readings: &[Reading], bucket_width: TimeDelta) -> Vec<BucketPoint> {
    let width_ms = bucket_width.num_milliseconds();
    if readings.is_empty() || width_ms <= 0 {
        return Vec::new();
    }

    let mut buckets: BTreeMap<i64, Vec<&Reading>> = BTreeMap::new();
    for reading in readings {
        let t = reading.effective_time().timestamp_millis();
        let key = t.div_euclid(width_ms) * width_ms;
        buckets.entry(key).or_default().push(reading);
    }

    buckets
        .into_iter()
        .filter_map(|(key, points)| {
            let bucket_start = DateTime::from_timestamp_millis(key)?;
            Some(reduce_bucket(bucket_start, &points))
        })
        .collect()
}

fn reduce_bucket(bucket_start: DateTime<Utc>, points: &[&Reading]) -> BucketPoint {
    let values = Metric::BUCKETED
        .iter()
        .map(|metric| {
            let samples = points.iter().map(|r| r.metric(*metric));
            let value = match metric.reduction() {
                Reduction::Max => samples.fold(f64::NEG_INFINITY, f64::max),
                Reduction::Mean => (samples.sum::<f64>() / points.len() as f64).round(),
            };
            (*metric, value)
        })
        .collect();

    BucketPoint {
        bucket_start,
        samples: points.len(),
        values,
    }
}

/// Weighting used to fold a bucket into a single 0-100 activity level.
/// The per-mode defaults are a starting point, not a calibrated model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityWeights {
    pub terms: Vec<(Metric, f64)>,
}

impl ActivityWeights {
    pub fn for_mode(mode: SensorMode) -> Self {
        let terms = match mode {
            SensorMode::FallDetection => vec![
                (Metric::HumanExistence, 30.0),
                (Metric::MotionDetected, 20.0),
                (Metric::BodyMovement, 0.5),
            ],
            SensorMode::Sleep => vec![
                (Metric::InBed, 10.0),
                (Metric::CompositeTurnOverCount, 10.0),
                (Metric::BodyMovement, 0.5),
            ],
        };
        Self { terms }
    }
}

pub fn activity_level(point: &BucketPoint, weights: &ActivityWeights) -> f64 {
    weights
        .terms
        .iter()
        .map(|(metric, weight)| point.value(*metric) * weight)
        .sum::<f64>()
        .clamp(0.0, 100.0)
}

/// Low-activity span on a timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuietPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Spans where the activity level stays under `threshold`. A span still open at
/// the end of the series is not reported.
pub fn quiet_periods(points: &[BucketPoint], weights: &ActivityWeights, threshold: f64) -> Vec<QuietPeriod> {
    let mut periods = Vec::new();
    let mut start = None;

    for point in points {
        let quiet = activity_level(point, weights) < threshold;
        match (quiet, start) {
            (true, None) => start = Some(point.bucket_start),
            (false, Some(s)) => {
                periods.push(QuietPeriod { start: s, end: point.bucket_start });
                start = None;
            }
            _ => {}
        }
    }

    periods
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPoint {
    pub at: DateTime<Utc>,
    pub status: DeviceStatus,
}

/// Online/offline step series drawn under the 12h timeline. Every bucket counts
/// as online; if the newest bucket is older than `online_threshold` the series
/// steps to offline `online_threshold` after it.
pub fn device_status_timeline(
    points: &[BucketPoint],
    now: DateTime<Utc>,
    window: TimeDelta,
    online_threshold: TimeDelta,
) -> Vec<StatusPoint> {
    let Some(last) = points.last() else {
        return vec![
            StatusPoint { at: now - window, status: DeviceStatus::Offline },
            StatusPoint { at: now, status: DeviceStatus::Offline },
        ];
    };

    let mut series: Vec<StatusPoint> = points
        .iter()
        .map(|p| StatusPoint { at: p.bucket_start, status: DeviceStatus::Online })
        .collect();

    if now - last.bucket_start > online_threshold {
        series.push(StatusPoint { at: last.bucket_start, status: DeviceStatus::Online });
        series.push(StatusPoint {
            at: last.bucket_start + online_threshold,
            status: DeviceStatus::Offline,
        });
        series.push(StatusPoint { at: now, status: DeviceStatus::Offline });
    } else {
        series.push(StatusPoint { at: now, status: DeviceStatus::Online });
    }

    series
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn fall(ts: &str) -> Reading {
        Reading::new("ESP32C6_001", SensorMode::FallDetection, at(ts)).recorded(at(ts))
    }

    #[test]
    fn test_empty_input_yields_no_buckets() {
        assert!(aggregate(&[], TimeDelta::minutes(5)).is_empty());
    }

    #[test]
    fn test_presence_reduces_by_max() {
        let readings = vec![
            fall("2026-10-16T10:00:10Z").with(Metric::HumanExistence, 0.0),
            fall("2026-10-16T10:01:10Z").with(Metric::HumanExistence, 1.0),
            fall("2026-10-16T10:02:10Z").with(Metric::HumanExistence, 0.0),
        ];

        let points = aggregate(&readings, TimeDelta::minutes(5));
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value(Metric::HumanExistence), 1.0);
        assert_eq!(points[0].samples, 3);
    }

    #[test]
    fn test_movement_reduces_by_mean() {
        let readings = vec![
            fall("2026-10-16T10:00:10Z").with(Metric::BodyMovement, 10.0),
            fall("2026-10-16T10:01:10Z").with(Metric::BodyMovement, 20.0),
            fall("2026-10-16T10:02:10Z").with(Metric::BodyMovement, 30.0),
        ];

        let points = aggregate(&readings, TimeDelta::minutes(5));
        assert_eq!(points[0].value(Metric::BodyMovement), 20.0);
    }

    #[test]
    fn test_absent_fields_count_as_zero() {
        let readings = vec![
            fall("2026-10-16T10:00:10Z").with(Metric::BodyMovement, 30.0),
            fall("2026-10-16T10:01:10Z"),
        ];

        let points = aggregate(&readings, TimeDelta::minutes(5));
        assert_eq!(points[0].value(Metric::BodyMovement), 15.0);
        assert_eq!(points[0].value(Metric::HeartRateBpm), 0.0);
    }

    #[test]
    fn test_buckets_align_to_epoch_and_sort() {
        let readings = vec![
            fall("2026-10-16T10:07:00Z"),
            fall("2026-10-16T10:04:59Z"),
            fall("2026-10-16T10:05:00Z"),
        ];

        let points = aggregate(&readings, TimeDelta::minutes(5));
        let starts: Vec<_> = points.iter().map(|p| p.bucket_start).collect();
        assert_eq!(starts, vec![at("2026-10-16T10:00:00Z"), at("2026-10-16T10:05:00Z")]);
        assert_eq!(points[1].samples, 2);
    }

    #[test]
    fn test_receipt_time_used_without_device_time() {
        let reading = Reading::new("dev", SensorMode::FallDetection, at("2026-10-16T10:12:00Z"));
        let points = aggregate(&[reading], TimeDelta::minutes(10));
        assert_eq!(points[0].bucket_start, at("2026-10-16T10:10:00Z"));
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let start = at("2026-10-16T00:00:00Z");
        let readings: Vec<Reading> = (0..500)
            .map(|i| {
                let t = start + TimeDelta::seconds(i * 37);
                Reading::new("dev", SensorMode::FallDetection, t)
                    .recorded(t)
                    .with(Metric::HumanExistence, (i % 3 == 0) as i32 as f64)
                    .with(Metric::BodyMovement, (i % 17) as f64 * 3.3)
            })
            .collect();

        let first = aggregate(&readings, TimeDelta::minutes(5));
        let second = aggregate(&readings, TimeDelta::minutes(5));
        assert_eq!(first, second);
    }

    #[test]
    fn test_twelve_hours_with_gap_has_no_synthetic_buckets() {
        let start = at("2026-10-16T00:00:00Z");
        let gap_start = start + TimeDelta::hours(6);
        let gap_end = gap_start + TimeDelta::minutes(10);

        let readings: Vec<Reading> = (0..(12 * 120))
            .map(|i| start + TimeDelta::seconds(i * 30))
            .filter(|t| *t < gap_start || *t >= gap_end)
            .map(|t| {
                Reading::new("dev", SensorMode::FallDetection, t)
                    .recorded(t)
                    .with(Metric::HumanExistence, 1.0)
            })
            .collect();

        let points = aggregate(&readings, TimeDelta::minutes(5));

        // 144 five-minute buckets over 12h, two of them fall inside the gap
        assert_eq!(points.len(), 142);
        assert!(points.iter().all(|p| p.value(Metric::HumanExistence) == 1.0));
        assert!(points
            .iter()
            .all(|p| p.bucket_start < gap_start || p.bucket_start >= gap_end));

        let before = points.iter().rposition(|p| p.bucket_start < gap_start).unwrap();
        assert_eq!(points[before].bucket_start, gap_start - TimeDelta::minutes(5));
        assert_eq!(points[before + 1].bucket_start, gap_end);
    }

    #[test]
    fn test_status_timeline_steps_offline() {
        let readings = vec![fall("2026-10-16T10:00:10Z"), fall("2026-10-16T10:05:10Z")];
        let points = aggregate(&readings, TimeDelta::minutes(5));
        let now = at("2026-10-16T10:30:00Z");

        let series = device_status_timeline(&points, now, TimeDelta::hours(12), TimeDelta::seconds(20));
        let tail: Vec<_> = series.iter().rev().take(2).collect();
        assert_eq!(tail[0].status, DeviceStatus::Offline);
        assert_eq!(tail[0].at, now);
        assert_eq!(tail[1].at, at("2026-10-16T10:05:20Z"));

        let empty = device_status_timeline(&[], now, TimeDelta::hours(12), TimeDelta::seconds(20));
        assert_eq!(empty.len(), 2);
        assert!(empty.iter().all(|p| p.status == DeviceStatus::Offline));
    }

    #[test]
    fn test_quiet_periods_close_on_activity() {
        let weights = ActivityWeights::for_mode(SensorMode::FallDetection);
        let readings = vec![
            fall("2026-10-16T10:00:10Z").with(Metric::HumanExistence, 1.0).with(Metric::MotionDetected, 2.0),
            fall("2026-10-16T10:05:10Z"),
            fall("2026-10-16T10:10:10Z"),
            fall("2026-10-16T10:15:10Z").with(Metric::HumanExistence, 1.0),
            fall("2026-10-16T10:20:10Z"),
        ];
        let points = aggregate(&readings, TimeDelta::minutes(5));

        let periods = quiet_periods(&points, &weights, 20.0);
        assert_eq!(
            periods,
            vec![QuietPeriod {
                start: at("2026-10-16T10:05:00Z"),
                end: at("2026-10-16T10:15:00Z"),
            }]
        );
        assert_eq!(activity_level(&points[0], &weights), 70.0);
    }
}
