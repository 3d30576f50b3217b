use crate::gateway::*;
use crate::metrics::*;
use crate::settings::DeviceSettings;
use crate::storage::SqliteGateway;
use chrono::{DateTime, TimeDelta, Timelike, Utc};
use rand::Rng;
use serde_json::Value;
use tracing::info;

#[derive(Debug, Clone)]
pub struct SimulationPlan {
    pub device_id: String,
    pub mode: SensorMode,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub interval: TimeDelta,
}

/// Receipt lags the device clock by a second or two
fn received_after(recorded: DateTime<Utc>, rng: &mut impl Rng) -> DateTime<Utc> {
    recorded + TimeDelta::milliseconds(rng.gen_range(300..2500))
}

fn sleep_reading(device_id: &str, at: DateTime<Utc>, rng: &mut impl Rng) -> Reading {
    let night = !(7..22).contains(&at.hour());
    let in_bed = if night { rng.gen_bool(0.95) } else { rng.gen_bool(0.15) };

    let mut reading = Reading::new(device_id, SensorMode::Sleep, received_after(at, rng))
        .recorded(at)
        .with(Metric::InBed, if in_bed { 1.0 } else { 0.0 });

    if in_bed {
        let movement: f64 = if rng.gen_bool(0.1) { rng.gen_range(20.0..70.0) } else { rng.gen_range(0.0..8.0) };
        reading = reading
            .with(Metric::HeartRateBpm, rng.gen_range(54.0..78.0_f64).round())
            .with(Metric::RespirationRate, rng.gen_range(11.0..19.0_f64).round())
            .with(Metric::SleepState, rng.gen_range(0..3) as f64)
            .with(Metric::BodyMovement, movement.round())
            .with(Metric::CompositeTurnOverCount, rng.gen_range(0..3) as f64)
            .with(Metric::CompositeApneaEvents, if rng.gen_bool(0.01) { 1.0 } else { 0.0 })
            .with(Metric::AbnormalStruggle, 0.0)
            .with(Metric::UnattendedState, 0.0);
    } else {
        reading = reading.with(Metric::BodyMovement, rng.gen_range(0.0..40.0_f64).round());
    }
    reading
}

fn fall_reading(device_id: &str, at: DateTime<Utc>, rng: &mut impl Rng) -> Reading {
    let present = rng.gen_bool(0.7);
    let fell = present && rng.gen_bool(0.002);

    let mut reading = Reading::new(device_id, SensorMode::FallDetection, received_after(at, rng))
        .recorded(at)
        .with(Metric::HumanExistence, if present { 1.0 } else { 0.0 })
        .with(Metric::FallState, if fell { 1.0 } else { 0.0 });

    if present {
        let moving = rng.gen_bool(0.5);
        reading = reading
            .with(Metric::MotionDetected, if moving { 1.0 } else { 0.0 })
            .with(Metric::BodyMovement, if moving { rng.gen_range(10.0..90.0_f64).round() } else { 0.0 })
            .with(Metric::StaticResidencyTimeSec, if fell { rng.gen_range(10..60) as f64 } else { 0.0 });
    }
    if fell {
        reading = reading.with(Metric::FallTimeSec, rng.gen_range(1..5) as f64);
    }
    reading
}

/// One reading per `interval` from `start` up to and including `end`
pub fn synthetic_readings(plan: &SimulationPlan, rng: &mut impl Rng) -> Vec<Reading> {
    let mut readings = Vec::new();
    if plan.interval <= TimeDelta::zero() {
        return readings;
    }

    let mut next = Some(plan.start);
    while let Some(at) = next.filter(|at| *at <= plan.end) {
        readings.push(match plan.mode {
            SensorMode::Sleep => sleep_reading(&plan.device_id, at, rng),
            SensorMode::FallDetection => fall_reading(&plan.device_id, at, rng),
        });
        next = at.checked_add_signed(plan.interval);
    }
    readings
}

/// Device record carrying factory settings and the configured mode
pub fn device_record(device_id: &str, mode: SensorMode) -> GatewayResult<Value> {
    let mut record = serde_json::to_value(DeviceSettings::default())?;
    if let Value::Object(map) = &mut record {
        map.insert("device_id".to_string(), Value::from(device_id));
        map.insert("operational_mode".to_string(), Value::from(mode.as_str()));
        map.insert("config_updated".to_string(), Value::Bool(false));
    }
    Ok(record)
}

/// Write the device record (if missing) and the synthetic readings. Returns the
/// number of readings inserted.
pub async fn seed(gateway: &SqliteGateway, plan: &SimulationPlan, rng: &mut impl Rng) -> GatewayResult<usize> {
    let device_filter = [Filter::eq("device_id", plan.device_id.as_str())];
    if gateway.get_one(DEVICES_TABLE, &device_filter).await?.is_none() {
        gateway
            .insert(DEVICES_TABLE, &device_record(&plan.device_id, plan.mode)?)
            .await?;
        info!("Created device record for {}", plan.device_id);
    }

    let rows = synthetic_readings(plan, rng)
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()?;
    let inserted = gateway.insert_batch(READINGS_TABLE, &rows)?;
    info!("Seeded {} {} readings for {}", inserted, plan.mode, plan.device_id);
    Ok(inserted)
}
