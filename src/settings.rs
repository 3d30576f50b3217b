use crate::gateway::*;
use crate::metrics::{DeviceConfig, SensorMode};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("no device record for {0}")]
    UnknownDevice(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataCollectionMode {
    #[default]
    Quick,
    Medium,
}

/// Tunable fields of the device record. Missing columns take the factory default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    // Sampling
    pub fall_detection_interval_ms: u32,
    pub sleep_mode_interval_ms: u32,
    pub config_check_interval_ms: u32,
    pub ota_check_interval_ms: u32,

    // Sensor queries
    pub data_collection_mode: DataCollectionMode,
    pub sensor_query_delay_ms: u32,
    pub query_retry_attempts: u32,
    pub query_retry_delay_ms: u32,
    pub enable_supplemental_queries: bool,
    /// Firmware-defined cycle name, `rotating` by default
    pub supplemental_cycle_mode: String,

    // Installation
    pub install_height_cm: u32,
    pub install_angle: i32,
    pub room_width_ft: f64,
    pub room_length_ft: f64,
    pub position_tracking_enabled: bool,

    // Fall detection
    pub fall_sensitivity: u32,
    pub fall_break_height_cm: u32,
    pub seated_distance_threshold_cm: u32,
    pub motion_distance_threshold_cm: u32,

    // Sleep
    pub sleep_detection_distance_cm: u32,
    pub breathing_alert_min: u32,
    pub breathing_alert_max: u32,
    pub heart_rate_alert_min: u32,
    pub heart_rate_alert_max: u32,
    pub apnea_alert_threshold: u32,
}

impl Default for DeviceSettings {
    /// Factory defaults
    fn default() -> Self {
        Self {
            fall_detection_interval_ms: 20_000,
            sleep_mode_interval_ms: 20_000,
            config_check_interval_ms: 20_000,
            ota_check_interval_ms: 3_600_000,
            data_collection_mode: DataCollectionMode::Quick,
            sensor_query_delay_ms: 0,
            query_retry_attempts: 1,
            query_retry_delay_ms: 100,
            enable_supplemental_queries: true,
            supplemental_cycle_mode: "rotating".to_string(),
            install_height_cm: 250,
            install_angle: 0,
            room_width_ft: 15.0,
            room_length_ft: 20.0,
            position_tracking_enabled: true,
            fall_sensitivity: 5,
            fall_break_height_cm: 100,
            seated_distance_threshold_cm: 100,
            motion_distance_threshold_cm: 150,
            sleep_detection_distance_cm: 250,
            breathing_alert_min: 10,
            breathing_alert_max: 25,
            heart_rate_alert_min: 60,
            heart_rate_alert_max: 100,
            apnea_alert_threshold: 3,
        }
    }
}

fn check_range<T>(field: &'static str, value: T, range: RangeInclusive<T>) -> Result<(), SettingsError>
where
    T: PartialOrd + fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(SettingsError::Invalid {
            field,
            reason: format!("{} is outside {}..={}", value, range.start(), range.end()),
        })
    }
}

fn check_order(min_field: &'static str, min: u32, max_field: &'static str, max: u32) -> Result<(), SettingsError> {
    if min > max {
        return Err(SettingsError::Invalid {
            field: min_field,
            reason: format!("{} ({}) exceeds {} ({})", min_field, min, max_field, max),
        });
    }
    Ok(())
}

impl DeviceSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        check_range("fall_detection_interval_ms", self.fall_detection_interval_ms, 1_000..=600_000)?;
        check_range("sleep_mode_interval_ms", self.sleep_mode_interval_ms, 1_000..=600_000)?;
        check_range("config_check_interval_ms", self.config_check_interval_ms, 1_000..=600_000)?;
        check_range("ota_check_interval_ms", self.ota_check_interval_ms, 60_000..=86_400_000)?;

        check_range("sensor_query_delay_ms", self.sensor_query_delay_ms, 0..=5_000)?;
        check_range("query_retry_attempts", self.query_retry_attempts, 1..=10)?;
        check_range("query_retry_delay_ms", self.query_retry_delay_ms, 0..=5_000)?;

        check_range("install_height_cm", self.install_height_cm, 100..=400)?;
        check_range("install_angle", self.install_angle, -90..=90)?;
        check_range("room_width_ft", self.room_width_ft, 1.0..=100.0)?;
        check_range("room_length_ft", self.room_length_ft, 1.0..=100.0)?;

        check_range("fall_sensitivity", self.fall_sensitivity, 0..=10)?;
        check_range("fall_break_height_cm", self.fall_break_height_cm, 0..=300)?;
        check_range("seated_distance_threshold_cm", self.seated_distance_threshold_cm, 0..=500)?;
        check_range("motion_distance_threshold_cm", self.motion_distance_threshold_cm, 0..=500)?;

        check_range("sleep_detection_distance_cm", self.sleep_detection_distance_cm, 0..=500)?;
        check_range("breathing_alert_max", self.breathing_alert_max, 0..=60)?;
        check_range("heart_rate_alert_max", self.heart_rate_alert_max, 0..=250)?;
        check_range("apnea_alert_threshold", self.apnea_alert_threshold, 0..=30)?;
        check_order(
            "breathing_alert_min",
            self.breathing_alert_min,
            "breathing_alert_max",
            self.breathing_alert_max,
        )?;
        check_order(
            "heart_rate_alert_min",
            self.heart_rate_alert_min,
            "heart_rate_alert_max",
            self.heart_rate_alert_max,
        )?;

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCommand {
    Reconfigure,
    ResetSensor,
    Reboot,
}

impl DeviceCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCommand::Reconfigure => "reconfigure",
            DeviceCommand::ResetSensor => "reset_sensor",
            DeviceCommand::Reboot => "reboot",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeviceCommand::Reconfigure => "Reconfigure Sensor",
            DeviceCommand::ResetSensor => "Hardware Reset Sensor",
            DeviceCommand::Reboot => "Reboot ESP32",
        }
    }
}

impl FromStr for DeviceCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "reconfigure" => Ok(DeviceCommand::Reconfigure),
            "reset_sensor" => Ok(DeviceCommand::ResetSensor),
            "reboot" => Ok(DeviceCommand::Reboot),
            other => Err(format!("unknown device command '{}'", other)),
        }
    }
}

fn device_filter(device_id: &str) -> [Filter; 1] {
    [Filter::eq("device_id", device_id)]
}

async fn update_device<G: RemoteDataGateway>(
    gateway: &G,
    device_id: &str,
    patch: &Value,
) -> Result<(), SettingsError> {
    let updated = gateway.update(DEVICES_TABLE, &device_filter(device_id), patch).await?;
    if updated == 0 {
        return Err(SettingsError::UnknownDevice(device_id.to_string()));
    }
    Ok(())
}

/// Null columns decode like missing ones, taking the field default
fn decode_device_row<T: DeserializeOwned>(mut row: Value) -> serde_json::Result<T> {
    if let Value::Object(map) = &mut row {
        map.retain(|_, v| !v.is_null());
    }
    serde_json::from_value(row)
}

pub async fn load_device_config<G: RemoteDataGateway>(
    gateway: &G,
    device_id: &str,
) -> GatewayResult<Option<DeviceConfig>> {
    match gateway.get_one(DEVICES_TABLE, &device_filter(device_id)).await? {
        Some(row) => Ok(Some(decode_device_row(row)?)),
        None => Ok(None),
    }
}

pub async fn load_settings<G: RemoteDataGateway>(
    gateway: &G,
    device_id: &str,
) -> GatewayResult<Option<DeviceSettings>> {
    match gateway.get_one(DEVICES_TABLE, &device_filter(device_id)).await? {
        Some(row) => Ok(Some(decode_device_row(row)?)),
        None => Ok(None),
    }
}

/// Validate and write settings, flagging the device to re-sync
pub async fn save_settings<G: RemoteDataGateway>(
    gateway: &G,
    device_id: &str,
    settings: &DeviceSettings,
) -> Result<(), SettingsError> {
    settings.validate()?;

    let mut patch = serde_json::to_value(settings).map_err(GatewayError::from)?;
    if let Value::Object(map) = &mut patch {
        map.insert("config_updated".to_string(), Value::Bool(true));
    }

    update_device(gateway, device_id, &patch).await?;
    info!("Saved settings for {}", device_id);
    Ok(())
}

pub async fn write_operational_mode<G: RemoteDataGateway>(
    gateway: &G,
    device_id: &str,
    mode: SensorMode,
) -> Result<(), SettingsError> {
    let patch = json!({
        "operational_mode": mode.as_str(),
        "config_updated": true,
    });
    update_device(gateway, device_id, &patch).await?;
    info!("Device {} will switch to {} on its next config check", device_id, mode);
    Ok(())
}

/// Queue a command for the device. Its acknowledgement is not awaited.
pub async fn send_command<G: RemoteDataGateway>(
    gateway: &G,
    device_id: &str,
    command: DeviceCommand,
    now: DateTime<Utc>,
) -> Result<(), SettingsError> {
    let patch = json!({
        "pending_command": command.as_str(),
        "command_timestamp": timestamp_value(now),
    });
    match update_device(gateway, device_id, &patch).await {
        Ok(()) => {
            info!("Command sent to {}: {}", device_id, command.label());
            Ok(())
        }
        Err(e) => {
            warn!("Failed to send {} to {}: {}", command.as_str(), device_id, e);
            Err(e)
        }
    }
}
