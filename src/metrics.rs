use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Mutually exclusive operating configuration of the mmWave sensor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorMode {
    #[default]
    Sleep,
    FallDetection,
}

impl SensorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorMode::Sleep => "sleep",
            SensorMode::FallDetection => "fall_detection",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SensorMode::Sleep => "Sleep Monitoring",
            SensorMode::FallDetection => "Fall Detection",
        }
    }
}

impl fmt::Display for SensorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "sleep" => Ok(SensorMode::Sleep),
            "fall_detection" | "fall" => Ok(SensorMode::FallDetection),
            other => Err(format!("unknown sensor mode '{}'", other)),
        }
    }
}

/// One sensor sample as stored in the readings table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    /// Device-reported time of the sample; authoritative for windowing
    #[serde(rename = "device_timestamp", default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
    /// Gateway receipt time
    #[serde(rename = "created_at")]
    pub received_at: DateTime<Utc>,
    pub sensor_mode: SensorMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Reading {
    pub fn new(device_id: &str, sensor_mode: SensorMode, received_at: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            recorded_at: None,
            received_at,
            sensor_mode,
            location: None,
            data_type: None,
            payload: Payload::default(),
        }
    }

    pub fn recorded(mut self, at: DateTime<Utc>) -> Self {
        self.recorded_at = Some(at);
        self
    }

    pub fn with(mut self, metric: Metric, value: f64) -> Self {
        self.payload.set(metric, value);
        self
    }

    /// Reading time if the device reported one, otherwise receipt time
    pub fn effective_time(&self) -> DateTime<Utc> {
        self.recorded_at.unwrap_or(self.received_at)
    }

    /// Metric value with absent fields read as zero
    pub fn metric(&self, metric: Metric) -> f64 {
        self.payload.get(metric).unwrap_or(0.0)
    }

    pub fn flag(&self, metric: Metric) -> bool {
        self.metric(metric) > 0.0
    }
}

/// Mode-dependent sample fields. Fields not relevant to the reading's mode stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    // Sleep mode
    #[serde(default, deserialize_with = "flex_number", skip_serializing_if = "Option::is_none")]
    pub heart_rate_bpm: Option<f64>,
    #[serde(default, deserialize_with = "flex_number", skip_serializing_if = "Option::is_none")]
    pub respiration_rate: Option<f64>,
    #[serde(default, deserialize_with = "flex_number", skip_serializing_if = "Option::is_none")]
    pub sleep_state: Option<f64>,
    #[serde(default, deserialize_with = "flex_number", skip_serializing_if = "Option::is_none")]
    pub in_bed: Option<f64>,
    #[serde(default, deserialize_with = "flex_number", skip_serializing_if = "Option::is_none")]
    pub composite_apnea_events: Option<f64>,
    #[serde(default, deserialize_with = "flex_number", skip_serializing_if = "Option::is_none")]
    pub composite_turn_over_count: Option<f64>,
    #[serde(default, deserialize_with = "flex_number", skip_serializing_if = "Option::is_none")]
    pub stats_sleep_quality_score: Option<f64>,
    #[serde(default, deserialize_with = "flex_number", skip_serializing_if = "Option::is_none")]
    pub stats_sleep_time_min: Option<f64>,
    #[serde(default, deserialize_with = "flex_number", skip_serializing_if = "Option::is_none")]
    pub abnormal_struggle: Option<f64>,
    #[serde(default, deserialize_with = "flex_number", skip_serializing_if = "Option::is_none")]
    pub unattended_state: Option<f64>,

    // Shared
    #[serde(default, deserialize_with = "flex_number", skip_serializing_if = "Option::is_none")]
    pub body_movement: Option<f64>,

    // Fall detection mode
    #[serde(default, deserialize_with = "flex_number", skip_serializing_if = "Option::is_none")]
    pub human_existence: Option<f64>,
    #[serde(default, deserialize_with = "flex_number", skip_serializing_if = "Option::is_none")]
    pub motion_detected: Option<f64>,
    #[serde(default, deserialize_with = "flex_number", skip_serializing_if = "Option::is_none")]
    pub fall_state: Option<f64>,
    #[serde(default, deserialize_with = "flex_number", skip_serializing_if = "Option::is_none")]
    pub static_residency_time_sec: Option<f64>,
    #[serde(default, deserialize_with = "flex_number", skip_serializing_if = "Option::is_none")]
    pub fall_time_sec: Option<f64>,
}

impl Payload {
    pub fn get(&self, metric: Metric) -> Option<f64> {
        *self.slot(metric)
    }

    pub fn set(&mut self, metric: Metric, value: f64) {
        *self.slot_mut(metric) = Some(value);
    }

    fn slot(&self, metric: Metric) -> &Option<f64> {
        match metric {
            Metric::HeartRateBpm => &self.heart_rate_bpm,
            Metric::RespirationRate => &self.respiration_rate,
            Metric::SleepState => &self.sleep_state,
            Metric::InBed => &self.in_bed,
            Metric::CompositeApneaEvents => &self.composite_apnea_events,
            Metric::CompositeTurnOverCount => &self.composite_turn_over_count,
            Metric::StatsSleepQualityScore => &self.stats_sleep_quality_score,
            Metric::StatsSleepTimeMin => &self.stats_sleep_time_min,
            Metric::AbnormalStruggle => &self.abnormal_struggle,
            Metric::UnattendedState => &self.unattended_state,
            Metric::BodyMovement => &self.body_movement,
            Metric::HumanExistence => &self.human_existence,
            Metric::MotionDetected => &self.motion_detected,
            Metric::FallState => &self.fall_state,
            Metric::StaticResidencyTimeSec => &self.static_residency_time_sec,
            Metric::FallTimeSec => &self.fall_time_sec,
        }
    }

    fn slot_mut(&mut self, metric: Metric) -> &mut Option<f64> {
        match metric {
            Metric::HeartRateBpm => &mut self.heart_rate_bpm,
            Metric::RespirationRate => &mut self.respiration_rate,
            Metric::SleepState => &mut self.sleep_state,
            Metric::InBed => &mut self.in_bed,
            Metric::CompositeApneaEvents => &mut self.composite_apnea_events,
            Metric::CompositeTurnOverCount => &mut self.composite_turn_over_count,
            Metric::StatsSleepQualityScore => &mut self.stats_sleep_quality_score,
            Metric::StatsSleepTimeMin => &mut self.stats_sleep_time_min,
            Metric::AbnormalStruggle => &mut self.abnormal_struggle,
            Metric::UnattendedState => &mut self.unattended_state,
            Metric::BodyMovement => &mut self.body_movement,
            Metric::HumanExistence => &mut self.human_existence,
            Metric::MotionDetected => &mut self.motion_detected,
            Metric::FallState => &mut self.fall_state,
            Metric::StaticResidencyTimeSec => &mut self.static_residency_time_sec,
            Metric::FallTimeSec => &mut self.fall_time_sec,
        }
    }
}

/// The device sends booleans either as JSON booleans or as 0/1.
#[derive(Deserialize)]
#[serde(untagged)]
enum FlexNumber {
    Number(f64),
    Bool(bool),
}

fn flex_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<FlexNumber>::deserialize(deserializer)?.map(|v| match v {
        FlexNumber::Number(n) => n,
        FlexNumber::Bool(true) => 1.0,
        FlexNumber::Bool(false) => 0.0,
    }))
}

/// Named payload field
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    HeartRateBpm,
    RespirationRate,
    SleepState,
    InBed,
    CompositeApneaEvents,
    CompositeTurnOverCount,
    StatsSleepQualityScore,
    StatsSleepTimeMin,
    AbnormalStruggle,
    UnattendedState,
    BodyMovement,
    HumanExistence,
    MotionDetected,
    FallState,
    StaticResidencyTimeSec,
    FallTimeSec,
}

/// How a bucket collapses many samples of one metric into a display value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Presence and motion style values; a single nonzero sample must survive
    Max,
    /// Continuous magnitudes; averaged and rounded to the nearest integer
    Mean,
}

impl Metric {
    /// Metrics that are reduced into timeline buckets
    pub const BUCKETED: [Metric; 11] = [
        Metric::HumanExistence,
        Metric::MotionDetected,
        Metric::BodyMovement,
        Metric::FallState,
        Metric::StaticResidencyTimeSec,
        Metric::HeartRateBpm,
        Metric::RespirationRate,
        Metric::SleepState,
        Metric::InBed,
        Metric::CompositeApneaEvents,
        Metric::CompositeTurnOverCount,
    ];

    pub fn reduction(&self) -> Reduction {
        match self {
            Metric::BodyMovement
            | Metric::HeartRateBpm
            | Metric::RespirationRate
            | Metric::StaticResidencyTimeSec
            | Metric::StatsSleepQualityScore
            | Metric::StatsSleepTimeMin
            | Metric::FallTimeSec => Reduction::Mean,
            _ => Reduction::Max,
        }
    }

    /// Metric cards shown for a mode
    pub fn cards(mode: SensorMode) -> &'static [Metric] {
        match mode {
            SensorMode::Sleep => &[
                Metric::HeartRateBpm,
                Metric::RespirationRate,
                Metric::SleepState,
                Metric::InBed,
                Metric::StatsSleepQualityScore,
                Metric::StatsSleepTimeMin,
                Metric::CompositeApneaEvents,
                Metric::CompositeTurnOverCount,
                Metric::BodyMovement,
            ],
            SensorMode::FallDetection => &[
                Metric::FallState,
                Metric::HumanExistence,
                Metric::MotionDetected,
                Metric::BodyMovement,
                Metric::StaticResidencyTimeSec,
            ],
        }
    }
}

/// One reduced display point of a bucketed timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketPoint {
    pub bucket_start: DateTime<Utc>,
    pub samples: usize,
    pub values: BTreeMap<Metric, f64>,
}

impl BucketPoint {
    pub fn value(&self, metric: Metric) -> f64 {
        self.values.get(&metric).copied().unwrap_or(0.0)
    }
}

/// Values shown on the metric cards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayMetrics {
    pub mode: SensorMode,
    pub live: bool,
    pub values: BTreeMap<Metric, f64>,
}

impl DisplayMetrics {
    pub fn zeroed(mode: SensorMode) -> Self {
        Self {
            mode,
            live: false,
            values: Metric::cards(mode).iter().map(|m| (*m, 0.0)).collect(),
        }
    }

    pub fn from_reading(reading: &Reading, mode: SensorMode) -> Self {
        let mut values: BTreeMap<Metric, f64> = Metric::cards(mode)
            .iter()
            .map(|m| (*m, reading.metric(*m)))
            .collect();

        // Floor residency only means something while a person is present
        if mode == SensorMode::FallDetection && !reading.flag(Metric::HumanExistence) {
            values.insert(Metric::StaticResidencyTimeSec, 0.0);
        }

        Self { mode, live: true, values }
    }
}

/// Persisted device configuration row, keyed by device id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub operational_mode: Option<SensorMode>,
    #[serde(default)]
    pub config_updated: bool,
    #[serde(default)]
    pub pending_command: Option<String>,
    #[serde(default)]
    pub command_timestamp: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reading_decodes_mixed_boolean_shapes() {
        let row = json!({
            "id": 42,
            "device_id": "ESP32C6_001",
            "created_at": "2026-10-16T10:00:05Z",
            "device_timestamp": "2026-10-16T10:00:00Z",
            "sensor_mode": "fall_detection",
            "human_existence": true,
            "motion_detected": 2,
            "fall_state": false,
            "body_movement": 37.5,
            "heart_rate_bpm": null
        });

        let reading: Reading = serde_json::from_value(row).unwrap();
        assert_eq!(reading.sensor_mode, SensorMode::FallDetection);
        assert_eq!(reading.metric(Metric::HumanExistence), 1.0);
        assert_eq!(reading.metric(Metric::MotionDetected), 2.0);
        assert_eq!(reading.metric(Metric::FallState), 0.0);
        assert_eq!(reading.metric(Metric::BodyMovement), 37.5);
        assert_eq!(reading.payload.heart_rate_bpm, None);
        assert_eq!(reading.metric(Metric::HeartRateBpm), 0.0);
    }

    #[test]
    fn test_effective_time_falls_back_to_receipt() {
        let received = "2026-10-16T10:00:05Z".parse().unwrap();
        let recorded = "2026-10-16T09:59:58Z".parse().unwrap();

        let reading = Reading::new("dev", SensorMode::Sleep, received);
        assert_eq!(reading.effective_time(), received);

        let reading = reading.recorded(recorded);
        assert_eq!(reading.effective_time(), recorded);
    }

    #[test]
    fn test_display_hides_residency_without_presence() {
        let at = "2026-10-16T10:00:00Z".parse().unwrap();
        let reading = Reading::new("dev", SensorMode::FallDetection, at)
            .with(Metric::HumanExistence, 0.0)
            .with(Metric::StaticResidencyTimeSec, 45.0);

        let display = DisplayMetrics::from_reading(&reading, SensorMode::FallDetection);
        assert!(display.live);
        assert_eq!(display.values[&Metric::StaticResidencyTimeSec], 0.0);

        let zeroed = DisplayMetrics::zeroed(SensorMode::Sleep);
        assert!(!zeroed.live);
        assert!(zeroed.values.values().all(|v| *v == 0.0));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("fall_detection".parse::<SensorMode>().unwrap(), SensorMode::FallDetection);
        assert_eq!("sleep".parse::<SensorMode>().unwrap(), SensorMode::Sleep);
        assert!("awake".parse::<SensorMode>().is_err());
    }
}
