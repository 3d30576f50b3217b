use crate::aggregator::{self, ActivityWeights};
use crate::alerts::{self, AlertKind};
use crate::annotations::{self, Annotation};
use crate::buffers::{fetch_window, WindowName};
use crate::config::DashboardConfig;
use crate::gateway::RemoteDataGateway;
use crate::metrics::*;
use chrono::{DateTime, Local, TimeDelta, Timelike, Utc};
use statrs::statistics::{Data, Distribution, Max, Median, Min, OrderStatistics};
use std::collections::BTreeMap;

const RULE: &str = "───────────────────────────────────────────────────────────────────\n";
const DOUBLE_RULE: &str = "═══════════════════════════════════════════════════════════════════\n";

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSummary {
    pub metric: Metric,
    pub samples: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub p95: f64,
}

/// Statistics over readings that carry `metric`; absent fields are not counted
pub fn summarize(readings: &[Reading], metric: Metric) -> Option<MetricSummary> {
    let values: Vec<f64> = readings.iter().filter_map(|r| r.payload.get(metric)).collect();
    if values.is_empty() {
        return None;
    }

    let samples = values.len();
    let mut data = Data::new(values);
    Some(MetricSummary {
        metric,
        samples,
        mean: data.mean().unwrap_or_default(),
        std_dev: data.std_dev().unwrap_or_default(),
        min: data.min(),
        max: data.max(),
        median: data.median(),
        p95: data.percentile(95),
    })
}

/// Share of `width` buckets in `window` that hold at least one reading
pub fn coverage_percent(readings: &[Reading], width: TimeDelta, window: TimeDelta) -> f64 {
    let expected = (window.num_milliseconds() / width.num_milliseconds().max(1)).max(1) as f64;
    let filled = aggregator::aggregate(readings, width).len() as f64;
    (filled / expected * 100.0).min(100.0)
}

fn metric_label(metric: Metric) -> &'static str {
    match metric {
        Metric::HeartRateBpm => "Heart Rate (bpm)",
        Metric::RespirationRate => "Respiration (/min)",
        Metric::SleepState => "Sleep State",
        Metric::InBed => "In Bed",
        Metric::CompositeApneaEvents => "Apnea Events",
        Metric::CompositeTurnOverCount => "Turn Overs",
        Metric::StatsSleepQualityScore => "Sleep Quality",
        Metric::StatsSleepTimeMin => "Sleep Time (min)",
        Metric::AbnormalStruggle => "Abnormal Struggle",
        Metric::UnattendedState => "Unattended",
        Metric::BodyMovement => "Body Movement",
        Metric::HumanExistence => "Presence",
        Metric::MotionDetected => "Motion",
        Metric::FallState => "Fall State",
        Metric::StaticResidencyTimeSec => "Floor Residency (s)",
        Metric::FallTimeSec => "Fall Time (s)",
    }
}

fn section(report: &mut String, title: &str) {
    report.push_str(RULE);
    report.push_str(&format!("{:^67}\n", title));
    report.push_str(RULE);
    report.push('\n');
}

fn alert_counts(readings: &[Reading], mode: SensorMode) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for reading in readings {
        let hour = reading.effective_time().with_timezone(&Local).hour();
        for alert in alerts::check(reading, mode, hour) {
            *counts.entry(format!("{:?}", alert.kind)).or_insert(0) += 1;
        }
    }
    counts
}

fn analyze_issues(readings: &[Reading], mode: SensorMode, coverage: f64) -> Vec<String> {
    let mut issues = Vec::new();

    if coverage < 90.0 {
        issues.push(format!(
            "Data coverage is {:.1}%; the device was silent for part of the period",
            coverage
        ));
    }

    let flagged = |kind: AlertKind| {
        readings
            .iter()
            .filter(|r| {
                let hour = r.effective_time().with_timezone(&Local).hour();
                alerts::check(r, mode, hour).iter().any(|a| a.kind == kind)
            })
            .count()
    };

    match mode {
        SensorMode::Sleep => {
            let apnea = flagged(AlertKind::ApneaEvent);
            if apnea > 0 {
                issues.push(format!("{} readings reported apnea events", apnea));
            }
            if let Some(heart) = summarize(readings, Metric::HeartRateBpm) {
                if heart.mean > 0.0 && (heart.mean < 60.0 || heart.mean > 100.0) {
                    issues.push(format!("Average heart rate {:.0} bpm is outside 60-100", heart.mean));
                }
            }
        }
        SensorMode::FallDetection => {
            let falls = flagged(AlertKind::FallDetected);
            if falls > 0 {
                issues.push(format!("{} readings reported a fall", falls));
            }
            let floor = flagged(AlertKind::ProlongedFloorResidency);
            if floor > 0 {
                issues.push(format!("{} readings showed prolonged time on the floor", floor));
            }
        }
    }

    issues
}

/// Text report over one period of readings (both modes) and its annotations
pub fn build_report(
    readings: &[Reading],
    annotations: &[Annotation],
    config: &DashboardConfig,
    now: DateTime<Utc>,
    period: TimeDelta,
) -> String {
    let mut report = String::new();

    report.push_str(DOUBLE_RULE);
    report.push_str(&format!("{:^67}\n", "moveOmeter Activity Report"));
    report.push_str(DOUBLE_RULE);
    report.push('\n');

    report.push_str(&format!("Device:        {}\n", config.device_id));
    report.push_str(&format!(
        "Report Period: {} to {}\n",
        (now - period).format("%Y-%m-%d %H:%M:%S UTC"),
        now.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    report.push_str(&format!("Total Samples: {}\n\n", readings.len()));

    if readings.is_empty() {
        report.push_str("  No readings in this period.\n\n");
    }

    for mode in [SensorMode::Sleep, SensorMode::FallDetection] {
        let in_mode: Vec<Reading> = readings.iter().filter(|r| r.sensor_mode == mode).cloned().collect();
        if in_mode.is_empty() {
            continue;
        }

        section(&mut report, &mode.label().to_uppercase());

        let width = config.twenty_four_hour_bucket;
        let coverage = coverage_percent(&in_mode, width, period);
        report.push_str(&format!("  Samples:              {:>8}\n", in_mode.len()));
        report.push_str(&format!("  Coverage ({}-min):    {:>7.1}%\n\n", width.num_minutes(), coverage));

        report.push_str(&format!(
            "  {:<22} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
            "Metric", "Mean", "StdDev", "Median", "P95", "Max"
        ));
        for metric in Metric::cards(mode) {
            if let Some(s) = summarize(&in_mode, *metric) {
                report.push_str(&format!(
                    "  {:<22} {:>8.1} {:>8.1} {:>8.1} {:>8.1} {:>8.1}\n",
                    metric_label(s.metric),
                    s.mean,
                    s.std_dev,
                    s.median,
                    s.p95,
                    s.max
                ));
            }
        }
        report.push('\n');

        let weights = ActivityWeights::for_mode(mode);
        let points = aggregator::aggregate(&in_mode, width);
        let quiet = aggregator::quiet_periods(&points, &weights, config.quiet_threshold);
        if !quiet.is_empty() {
            report.push_str("  Quiet Periods:\n");
            for period in &quiet {
                report.push_str(&format!(
                    "    - {} to {} ({} min)\n",
                    period.start.format("%H:%M"),
                    period.end.format("%H:%M"),
                    (period.end - period.start).num_minutes()
                ));
            }
            report.push('\n');
        }

        let counts = alert_counts(&in_mode, mode);
        if !counts.is_empty() {
            report.push_str("  Alerts by Type:\n");
            for (kind, count) in &counts {
                report.push_str(&format!("    - {}: {}\n", kind, count));
            }
            report.push('\n');
        }

        let issues = analyze_issues(&in_mode, mode, coverage);
        if issues.is_empty() {
            report.push_str("  No significant issues detected.\n\n");
        } else {
            report.push_str("  Issues Detected:\n");
            for (i, issue) in issues.iter().enumerate() {
                report.push_str(&format!("    {}. {}\n", i + 1, issue));
            }
            report.push('\n');
        }
    }

    if !annotations.is_empty() {
        section(&mut report, "ANNOTATIONS");
        for annotation in annotations {
            report.push_str(&format!(
                "  [{}] {} ({})\n",
                annotation.annotation_timestamp.format("%Y-%m-%d %H:%M"),
                annotation.title,
                annotation.annotation_type
            ));
        }
        report.push('\n');
    }

    report.push_str(DOUBLE_RULE);
    report.push_str(&format!("{:^67}\n", "END OF REPORT"));
    report.push_str(DOUBLE_RULE);

    report
}

/// Report over the last 24 hours
pub async fn generate_report<G: RemoteDataGateway>(
    gateway: &G,
    config: &DashboardConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<String> {
    let period = config.buffers.duration(WindowName::TwentyFourHour);
    let readings = fetch_window(
        gateway,
        &config.buffers,
        WindowName::TwentyFourHour,
        &config.device_id,
        None,
        now,
    )
    .await?;
    let annotations = annotations::list_recent(gateway, &config.device_id, now, period).await?;

    Ok(build_report(&readings, &annotations, config, now, period))
}

/// JSON export of the 24-hour window, trimmed to the last `hours` (1 to 24),
/// with both aggregated timelines
pub async fn export_json<G: RemoteDataGateway>(
    gateway: &G,
    config: &DashboardConfig,
    now: DateTime<Utc>,
    hours: i64,
) -> anyhow::Result<String> {
    let hours = hours.clamp(1, 24);
    let start = now - TimeDelta::hours(hours);
    let readings: Vec<Reading> = fetch_window(
        gateway,
        &config.buffers,
        WindowName::TwentyFourHour,
        &config.device_id,
        None,
        now,
    )
    .await?
    .into_iter()
    .filter(|r| r.effective_time() >= start)
    .collect();

    let twelve_hour_start = now - config.buffers.duration(WindowName::TwelveHour);
    let twelve_hour: Vec<Reading> = readings
        .iter()
        .filter(|r| r.effective_time() >= twelve_hour_start)
        .cloned()
        .collect();

    let export = serde_json::json!({
        "device_id": config.device_id,
        "exported_at": now,
        "hours": hours,
        "readings": readings,
        "twenty_four_hour": {
            "bucket_width_secs": config.twenty_four_hour_bucket.num_seconds(),
            "points": aggregator::aggregate(&readings, config.twenty_four_hour_bucket),
        },
        "twelve_hour": {
            "bucket_width_secs": config.twelve_hour_bucket.num_seconds(),
            "points": aggregator::aggregate(&twelve_hour, config.twelve_hour_bucket),
        },
    });

    Ok(serde_json::to_string_pretty(&export)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn sleep_reading(t: DateTime<Utc>, heart: f64) -> Reading {
        Reading::new("ESP32C6_001", SensorMode::Sleep, t)
            .recorded(t)
            .with(Metric::HeartRateBpm, heart)
            .with(Metric::InBed, 1.0)
    }

    #[test]
    fn test_summarize_skips_absent_fields() {
        let t = at("2026-10-16T01:00:00Z");
        let readings = vec![
            sleep_reading(t, 60.0),
            sleep_reading(t, 70.0),
            sleep_reading(t, 80.0),
            Reading::new("ESP32C6_001", SensorMode::Sleep, t),
        ];

        let s = summarize(&readings, Metric::HeartRateBpm).unwrap();
        assert_eq!(s.samples, 3);
        assert_eq!(s.mean, 70.0);
        assert_eq!(s.min, 60.0);
        assert_eq!(s.max, 80.0);
        assert_eq!(s.median, 70.0);
        assert!(summarize(&readings, Metric::FallState).is_none());
    }

    #[test]
    fn test_coverage() {
        let start = at("2026-10-16T00:00:00Z");
        // One reading in each of 6 of the 12 ten-minute buckets of two hours
        let readings: Vec<Reading> = (0..6)
            .map(|i| sleep_reading(start + TimeDelta::minutes(i * 20), 65.0))
            .collect();
        let coverage = coverage_percent(&readings, TimeDelta::minutes(10), TimeDelta::hours(2));
        assert_eq!(coverage, 50.0);
    }

    #[test]
    fn test_report_sections() {
        let now = at("2026-10-16T12:00:00Z");
        let readings: Vec<Reading> = (0..10)
            .map(|i| sleep_reading(now - TimeDelta::minutes(i * 10), 110.0))
            .collect();
        let config = DashboardConfig::default();

        let report = build_report(&readings, &[], &config, now, TimeDelta::hours(24));
        assert!(report.contains("moveOmeter Activity Report"));
        assert!(report.contains("SLEEP MONITORING"));
        assert!(!report.contains("FALL DETECTION"));
        assert!(report.contains("Heart Rate (bpm)"));
        assert!(report.contains("Average heart rate 110 bpm is outside 60-100"));
        assert!(report.contains("Data coverage"));
    }

    #[test]
    fn test_empty_report() {
        let now = at("2026-10-16T12:00:00Z");
        let report = build_report(&[], &[], &DashboardConfig::default(), now, TimeDelta::hours(24));
        assert!(report.contains("No readings in this period."));
        assert!(report.contains("END OF REPORT"));
    }

    #[tokio::test]
    async fn test_export_trims_to_requested_hours() {
        use crate::gateway::READINGS_TABLE;
        use crate::storage::SqliteGateway;

        let gateway = SqliteGateway::in_memory().unwrap();
        let now = Utc::now();
        let rows: Vec<serde_json::Value> = (0..6)
            .map(|i| serde_json::to_value(sleep_reading(now - TimeDelta::minutes(i * 30 + 1), 62.0)).unwrap())
            .collect();
        gateway.insert_batch(READINGS_TABLE, &rows).unwrap();

        let exported = export_json(&gateway, &DashboardConfig::default(), now, 1).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&exported).unwrap();

        // 1 and 31 minutes old
        assert_eq!(value["readings"].as_array().unwrap().len(), 2);
        assert_eq!(value["twelve_hour"]["bucket_width_secs"], 300);
        assert!(!value["twenty_four_hour"]["points"].as_array().unwrap().is_empty());
    }
}
