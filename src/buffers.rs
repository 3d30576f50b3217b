use crate::gateway::*;
use crate::metrics::*;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WindowName {
    /// Most recent readings, count bounded; feeds the real-time charts
    Latest,
    Hour,
    TwelveHour,
    TwentyFourHour,
}

impl WindowName {
    pub const ALL: [WindowName; 4] = [
        WindowName::Latest,
        WindowName::Hour,
        WindowName::TwelveHour,
        WindowName::TwentyFourHour,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            WindowName::Latest => "latest",
            WindowName::Hour => "hour",
            WindowName::TwelveHour => "12h",
            WindowName::TwentyFourHour => "24h",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        WindowName::ALL.into_iter().find(|w| w.slug() == slug)
    }
}

#[derive(Debug, Clone)]
pub struct BufferSettings {
    pub readings_table: String,
    pub latest_max_items: usize,
    /// Time bound of the `latest` window
    pub latest_horizon: TimeDelta,
    /// Rows per backfill request; a shorter page ends the backfill
    pub page_size: usize,
    /// Hard cap on rows fetched for one window load
    pub max_rows: usize,
    /// Cap for the 24 hour window, which spans twice the range
    pub max_rows_24h: usize,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            readings_table: READINGS_TABLE.to_string(),
            latest_max_items: 100,
            latest_horizon: TimeDelta::hours(24),
            page_size: 1000,
            max_rows: 10_000,
            max_rows_24h: 20_000,
        }
    }
}

impl BufferSettings {
    pub fn duration(&self, window: WindowName) -> TimeDelta {
        match window {
            WindowName::Latest => self.latest_horizon,
            WindowName::Hour => TimeDelta::hours(1),
            WindowName::TwelveHour => TimeDelta::hours(12),
            WindowName::TwentyFourHour => TimeDelta::hours(24),
        }
    }

    pub fn row_cap(&self, window: WindowName) -> usize {
        match window {
            WindowName::TwentyFourHour => self.max_rows_24h,
            _ => self.max_rows,
        }
    }
}

/// Readings ascending by effective time, all newer than `now - duration`
#[derive(Debug, Clone)]
pub struct RollingWindow {
    duration: TimeDelta,
    max_items: Option<usize>,
    entries: VecDeque<Reading>,
}

impl RollingWindow {
    fn new(duration: TimeDelta, max_items: Option<usize>) -> Self {
        Self {
            duration,
            max_items,
            entries: VecDeque::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reading> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<Reading> {
        self.entries.iter().cloned().collect()
    }

    pub fn newest(&self) -> Option<&Reading> {
        self.entries.back()
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.duration
    }

    fn insert(&mut self, reading: Reading) {
        // Upper bound keeps arrival order among equal timestamps
        let t = reading.effective_time();
        let idx = self.entries.partition_point(|r| r.effective_time() <= t);
        self.entries.insert(idx, reading);
    }

    fn evict(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = self.cutoff(now);
        let before = self.entries.len();

        while self.entries.front().is_some_and(|r| r.effective_time() < cutoff) {
            self.entries.pop_front();
        }
        if let Some(max) = self.max_items {
            while self.entries.len() > max {
                self.entries.pop_front();
            }
        }

        before - self.entries.len()
    }

    fn replace(&mut self, mut readings: Vec<Reading>, now: DateTime<Utc>) {
        readings.sort_by_key(|r| r.effective_time());
        self.entries = readings.into();
        self.evict(now);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Identifies an in-flight window load so a stale result can be recognised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    pub window: WindowName,
    pub mode: SensorMode,
    pub epoch: u64,
}

/// Owner of the four named windows; every mutation goes through here
#[derive(Debug)]
pub struct RollingBufferStore {
    settings: BufferSettings,
    windows: BTreeMap<WindowName, RollingWindow>,
    epoch: u64,
}

impl RollingBufferStore {
    pub fn new(settings: BufferSettings) -> Self {
        let windows = WindowName::ALL
            .into_iter()
            .map(|name| {
                let max_items = (name == WindowName::Latest).then_some(settings.latest_max_items);
                (name, RollingWindow::new(settings.duration(name), max_items))
            })
            .collect();

        Self {
            settings,
            windows,
            epoch: 0,
        }
    }

    pub fn settings(&self) -> &BufferSettings {
        &self.settings
    }

    pub fn window(&self, name: WindowName) -> &RollingWindow {
        &self.windows[&name]
    }

    fn window_mut(&mut self, name: WindowName) -> &mut RollingWindow {
        self.windows
            .get_mut(&name)
            .unwrap_or_else(|| unreachable!("window {:?} is created with the store", name))
    }

    /// Bumped by [`clear_all`](Self::clear_all); loads started before it are stale
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn ticket(&self, window: WindowName, mode: SensorMode) -> LoadTicket {
        LoadTicket {
            window,
            mode,
            epoch: self.epoch,
        }
    }

    /// Add a live reading to every window whose range covers it, then evict.
    /// Readings of another mode are dropped and `false` is returned.
    pub fn append(&mut self, reading: &Reading, active: SensorMode, now: DateTime<Utc>) -> bool {
        if reading.sensor_mode != active {
            return false;
        }

        let t = reading.effective_time();
        for window in self.windows.values_mut() {
            if t >= window.cutoff(now) {
                window.insert(reading.clone());
            }
            window.evict(now);
        }
        true
    }

    pub fn evict(&mut self, now: DateTime<Utc>) -> usize {
        self.windows.values_mut().map(|w| w.evict(now)).sum()
    }

    pub fn clear(&mut self, name: WindowName) {
        self.window_mut(name).clear();
    }

    pub fn clear_all(&mut self) {
        for window in self.windows.values_mut() {
            window.clear();
        }
        self.epoch += 1;
    }

    /// Replace a window with a completed load. Returns `false` (and leaves the
    /// window alone) when the load was started under another mode or before the
    /// last [`clear_all`](Self::clear_all).
    pub fn apply_load(
        &mut self,
        ticket: LoadTicket,
        readings: Vec<Reading>,
        active: SensorMode,
        now: DateTime<Utc>,
    ) -> bool {
        if ticket.mode != active || ticket.epoch != self.epoch {
            debug!(
                "Discarding stale {} load (mode {}, epoch {})",
                ticket.window.slug(),
                ticket.mode,
                ticket.epoch
            );
            return false;
        }

        let readings: Vec<Reading> = readings.into_iter().filter(|r| r.sensor_mode == active).collect();
        self.window_mut(ticket.window).replace(readings, now);
        true
    }
}

/// Decode gateway rows, skipping rows that are not readings
pub fn decode_readings(rows: Vec<Value>) -> Vec<Reading> {
    rows.into_iter().filter_map(decode_reading).collect()
}

pub fn decode_reading(row: Value) -> Option<Reading> {
    match serde_json::from_value::<Reading>(row) {
        Ok(reading) => Some(reading),
        Err(e) => {
            warn!("Skipping malformed reading row: {}", e);
            None
        }
    }
}

/// Fetch the readings for one window, ascending by effective time.
///
/// `latest` takes the newest `latest_max_items` rows by receipt time. The timed
/// windows query the device-reported time range newest first, paging until a
/// short page or the row cap.
pub async fn fetch_window<G: RemoteDataGateway>(
    gateway: &G,
    settings: &BufferSettings,
    name: WindowName,
    device_id: &str,
    mode: Option<SensorMode>,
    now: DateTime<Utc>,
) -> GatewayResult<Vec<Reading>> {
    let mut filters = vec![Filter::eq("device_id", device_id)];
    if let Some(mode) = mode {
        filters.push(Filter::eq("sensor_mode", mode.as_str()));
    }

    let mut rows = if name == WindowName::Latest {
        gateway
            .query_range(
                &settings.readings_table,
                &filters,
                Some(&Order::desc("created_at")),
                Some(settings.latest_max_items),
                0,
            )
            .await?
    } else {
        let cutoff = now - settings.duration(name);
        filters.push(Filter::gte("device_timestamp", timestamp_value(cutoff)));
        filters.push(Filter::lte("device_timestamp", timestamp_value(now)));
        filters.push(Filter::not_null("device_timestamp"));
        fetch_paged(gateway, settings, name, &filters).await?
    };

    rows.reverse();
    let mut readings = decode_readings(rows);
    readings.sort_by_key(|r| r.effective_time());
    Ok(readings)
}

async fn fetch_paged<G: RemoteDataGateway>(
    gateway: &G,
    settings: &BufferSettings,
    name: WindowName,
    filters: &[Filter],
) -> GatewayResult<Vec<Value>> {
    let order = Order::desc("device_timestamp");
    let page_size = settings.page_size.max(1);
    let row_cap = settings.row_cap(name);
    let mut rows = Vec::new();
    let mut offset = 0;

    loop {
        let batch = gateway
            .query_range(&settings.readings_table, filters, Some(&order), Some(page_size), offset)
            .await?;
        let fetched = batch.len();
        debug!("Fetched {} batch {}: {} rows (offset {})", name.slug(), offset / page_size + 1, fetched, offset);

        rows.extend(batch);
        offset += fetched;

        if fetched < page_size {
            break;
        }
        if offset >= row_cap {
            info!("Reached {} row safety limit loading {} window", row_cap, name.slug());
            break;
        }
    }

    Ok(rows)
}

#[cfg(test)]
impl RollingWindow {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
