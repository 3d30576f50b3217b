use crate::metrics::{Metric, Reading, SensorMode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertKind {
    ApneaEvent,
    AbnormalStruggle,
    OutOfBedAtNight,
    LeftMonitoredArea,
    FallDetected,
    ProlongedFloorResidency,
    FallDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
}

impl Alert {
    fn new(kind: AlertKind, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
        }
    }
}

/// Floor residency beyond this many seconds raises an alert
pub const FLOOR_RESIDENCY_ALERT_SECS: f64 = 30.0;

fn is_night(local_hour: u32) -> bool {
    local_hour >= 22 || local_hour <= 6
}

/// Alerts raised by the newest reading. `local_hour` is the wall-clock hour at
/// the dashboard, used for the night-time out-of-bed rule.
pub fn check(reading: &Reading, mode: SensorMode, local_hour: u32) -> Vec<Alert> {
    let mut alerts = Vec::new();

    match mode {
        SensorMode::Sleep => {
            let apnea = reading.metric(Metric::CompositeApneaEvents);
            if apnea > 0.0 {
                alerts.push(Alert::new(
                    AlertKind::ApneaEvent,
                    AlertSeverity::Critical,
                    format!("Apnea event detected! Count: {}", apnea),
                ));
            }

            if reading.flag(Metric::AbnormalStruggle) {
                alerts.push(Alert::new(
                    AlertKind::AbnormalStruggle,
                    AlertSeverity::Warning,
                    "Abnormal struggle detected!",
                ));
            }

            // An absent in_bed field says nothing about the bed
            let out_of_bed = reading.payload.get(Metric::InBed) == Some(0.0);
            if out_of_bed && reading.flag(Metric::SleepState) && is_night(local_hour) {
                alerts.push(Alert::new(
                    AlertKind::OutOfBedAtNight,
                    AlertSeverity::Warning,
                    "Person out of bed during night hours",
                ));
            }

            if reading.flag(Metric::UnattendedState) {
                alerts.push(Alert::new(
                    AlertKind::LeftMonitoredArea,
                    AlertSeverity::Warning,
                    "Person has left the monitored area",
                ));
            }
        }
        SensorMode::FallDetection => {
            if reading.flag(Metric::FallState) {
                alerts.push(Alert::new(
                    AlertKind::FallDetected,
                    AlertSeverity::Critical,
                    "FALL DETECTED! Immediate attention required!",
                ));
            }

            // Residency and fall time only mean something while someone is present
            if reading.flag(Metric::HumanExistence) {
                let residency = reading.metric(Metric::StaticResidencyTimeSec);
                if residency > FLOOR_RESIDENCY_ALERT_SECS {
                    alerts.push(Alert::new(
                        AlertKind::ProlongedFloorResidency,
                        AlertSeverity::Critical,
                        format!("Person has been on floor for {} seconds", residency),
                    ));
                }

                let fall_time = reading.metric(Metric::FallTimeSec);
                if fall_time > 0.0 {
                    alerts.push(Alert::new(
                        AlertKind::FallDuration,
                        AlertSeverity::Warning,
                        format!("Fall duration: {} seconds", fall_time),
                    ));
                }
            }
        }
    }

    alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn reading(mode: SensorMode) -> Reading {
        let at: DateTime<Utc> = "2026-10-16T02:00:00Z".parse().unwrap();
        Reading::new("ESP32C6_001", mode, at)
    }

    fn kinds(alerts: &[Alert]) -> Vec<AlertKind> {
        alerts.iter().map(|a| a.kind).collect()
    }

    #[test]
    fn test_severity_serializes_lowercase() {
        let alert = Alert::new(AlertKind::FallDetected, AlertSeverity::Critical, "Fall detected");
        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["severity"], "critical");
        assert_eq!(serde_json::to_string(&AlertSeverity::Warning).unwrap(), "\"warning\"");
    }

    #[test]
    fn test_quiet_readings_raise_nothing() {
        assert!(check(&reading(SensorMode::Sleep), SensorMode::Sleep, 3).is_empty());
        assert!(check(&reading(SensorMode::FallDetection), SensorMode::FallDetection, 3).is_empty());
    }

    #[test]
    fn test_apnea_message_carries_count() {
        let r = reading(SensorMode::Sleep).with(Metric::CompositeApneaEvents, 2.0);
        let alerts = check(&r, SensorMode::Sleep, 14);
        assert_eq!(alerts[0].message, "Apnea event detected! Count: 2");
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    }

    #[test]
    fn test_out_of_bed_only_at_night() {
        let r = reading(SensorMode::Sleep)
            .with(Metric::InBed, 0.0)
            .with(Metric::SleepState, 1.0);
        assert_eq!(kinds(&check(&r, SensorMode::Sleep, 23)), vec![AlertKind::OutOfBedAtNight]);
        assert_eq!(kinds(&check(&r, SensorMode::Sleep, 6)), vec![AlertKind::OutOfBedAtNight]);
        assert!(check(&r, SensorMode::Sleep, 12).is_empty());

        let no_bed_field = reading(SensorMode::Sleep).with(Metric::SleepState, 1.0);
        assert!(check(&no_bed_field, SensorMode::Sleep, 23).is_empty());
    }

    #[test]
    fn test_floor_alerts_require_presence() {
        let absent = reading(SensorMode::FallDetection)
            .with(Metric::StaticResidencyTimeSec, 45.0)
            .with(Metric::FallTimeSec, 10.0);
        assert!(check(&absent, SensorMode::FallDetection, 12).is_empty());

        let present = absent.clone().with(Metric::HumanExistence, 1.0);
        assert_eq!(
            kinds(&check(&present, SensorMode::FallDetection, 12)),
            vec![AlertKind::ProlongedFloorResidency, AlertKind::FallDuration]
        );
    }

    #[test]
    fn test_fall_flag() {
        let r = reading(SensorMode::FallDetection).with(Metric::FallState, 1.0);
        let alerts = check(&r, SensorMode::FallDetection, 12);
        assert_eq!(kinds(&alerts), vec![AlertKind::FallDetected]);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    }
}
