use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessState {
    /// No reading observed yet
    Waiting,
    Online,
    Stale,
    Offline,
}

impl LivenessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LivenessState::Waiting => "waiting",
            LivenessState::Online => "online",
            LivenessState::Stale => "stale",
            LivenessState::Offline => "offline",
        }
    }

    /// Only an online device shows its real values
    pub fn shows_values(&self) -> bool {
        matches!(self, LivenessState::Online)
    }
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessThresholds {
    /// Silence up to this long is still online
    pub online: TimeDelta,
    /// Silence up to this long is stale; beyond it offline
    pub stale: TimeDelta,
}

impl Default for LivenessThresholds {
    fn default() -> Self {
        Self {
            online: TimeDelta::seconds(20),
            stale: TimeDelta::seconds(60),
        }
    }
}

/// Side effects owed on a state edge. Never produced for a repeated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEffect {
    StatusChanged {
        from: Option<LivenessState>,
        to: LivenessState,
    },
    /// Replace displayed metric values with zeros
    ResetMetrics,
    ClearRealtimeCharts,
}

pub fn classify(
    last_seen: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    thresholds: &LivenessThresholds,
) -> LivenessState {
    let Some(last_seen) = last_seen else {
        return LivenessState::Waiting;
    };

    let silence = now - last_seen;
    if silence <= thresholds.online {
        LivenessState::Online
    } else if silence <= thresholds.stale {
        LivenessState::Stale
    } else {
        LivenessState::Offline
    }
}

/// Effects for moving from `from` to `to`; empty when nothing changed.
///
/// Metrics are reset when entering `waiting`, and when the device first drops
/// out of `online` (or out of `waiting`) into `stale`/`offline`. A further
/// `stale` -> `offline` move only reports the status.
pub fn transition(from: Option<LivenessState>, to: LivenessState) -> Vec<LivenessEffect> {
    if from == Some(to) {
        return Vec::new();
    }

    let mut effects = vec![LivenessEffect::StatusChanged { from, to }];

    let resets = match to {
        LivenessState::Online => false,
        LivenessState::Waiting => true,
        LivenessState::Stale | LivenessState::Offline => matches!(
            from,
            None | Some(LivenessState::Online) | Some(LivenessState::Waiting)
        ),
    };

    if resets {
        effects.push(LivenessEffect::ResetMetrics);
        effects.push(LivenessEffect::ClearRealtimeCharts);
    }

    effects
}

/// Sole owner of the liveness state; evaluated on the timer tick and after
/// every observed reading.
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    thresholds: LivenessThresholds,
    state: Option<LivenessState>,
    last_seen: Option<DateTime<Utc>>,
}

impl LivenessTracker {
    pub fn new(thresholds: LivenessThresholds) -> Self {
        Self {
            thresholds,
            state: None,
            last_seen: None,
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state.unwrap_or(LivenessState::Waiting)
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    /// Record a reading time. Older times than the newest seen are ignored.
    pub fn observe(&mut self, at: DateTime<Utc>) {
        if self.last_seen.map_or(true, |seen| at > seen) {
            self.last_seen = Some(at);
        }
    }

    /// Forget the last reading after a mode switch
    pub fn forget(&mut self) {
        self.last_seen = None;
    }

    pub fn evaluate(&mut self, now: DateTime<Utc>) -> Vec<LivenessEffect> {
        let next = classify(self.last_seen, now, &self.thresholds);
        let effects = transition(self.state, next);

        if !effects.is_empty() {
            match self.last_seen {
                Some(seen) => info!(
                    "Device {} (last reading {}s ago)",
                    next,
                    (now - seen).num_seconds()
                ),
                None => info!("Device {}", next),
            }
            self.state = Some(next);
        }

        effects
    }
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new(LivenessThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2026-10-16T12:00:00Z".parse().unwrap()
    }

    fn resets(effects: &[LivenessEffect]) -> usize {
        effects
            .iter()
            .filter(|e| **e == LivenessEffect::ResetMetrics)
            .count()
    }

    #[test]
    fn test_thresholds() {
        let t = LivenessThresholds::default();
        let now = now();
        assert_eq!(classify(None, now, &t), LivenessState::Waiting);
        assert_eq!(classify(Some(now - TimeDelta::seconds(19)), now, &t), LivenessState::Online);
        assert_eq!(classify(Some(now - TimeDelta::seconds(20)), now, &t), LivenessState::Online);
        assert_eq!(classify(Some(now - TimeDelta::seconds(21)), now, &t), LivenessState::Stale);
        assert_eq!(classify(Some(now - TimeDelta::seconds(60)), now, &t), LivenessState::Stale);
        assert_eq!(classify(Some(now - TimeDelta::seconds(61)), now, &t), LivenessState::Offline);
    }

    #[test]
    fn test_repeated_stale_ticks_reset_once() {
        let mut tracker = LivenessTracker::default();
        let now = now();
        tracker.observe(now);
        assert_eq!(resets(&tracker.evaluate(now)), 0);
        assert_eq!(tracker.state(), LivenessState::Online);

        let first = tracker.evaluate(now + TimeDelta::seconds(25));
        let second = tracker.evaluate(now + TimeDelta::seconds(27));
        assert_eq!(resets(&first), 1);
        assert!(second.is_empty());
        assert_eq!(tracker.state(), LivenessState::Stale);
    }

    #[test]
    fn test_stale_to_offline_reports_without_reset() {
        let mut tracker = LivenessTracker::default();
        let now = now();
        tracker.observe(now);
        tracker.evaluate(now);
        tracker.evaluate(now + TimeDelta::seconds(30));

        let effects = tracker.evaluate(now + TimeDelta::seconds(90));
        assert_eq!(
            effects,
            vec![LivenessEffect::StatusChanged {
                from: Some(LivenessState::Stale),
                to: LivenessState::Offline,
            }]
        );
    }

    #[test]
    fn test_new_reading_brings_device_back_online() {
        let mut tracker = LivenessTracker::default();
        let now = now();
        tracker.observe(now - TimeDelta::seconds(120));
        tracker.evaluate(now);
        assert_eq!(tracker.state(), LivenessState::Offline);

        tracker.observe(now);
        let effects = tracker.evaluate(now);
        assert_eq!(resets(&effects), 0);
        assert!(tracker.state().shows_values());
    }

    #[test]
    fn test_observe_keeps_newest() {
        let mut tracker = LivenessTracker::default();
        let now = now();
        tracker.observe(now);
        tracker.observe(now - TimeDelta::minutes(5));
        assert_eq!(tracker.last_seen(), Some(now));
    }

    #[test]
    fn test_waiting_entered_once() {
        let mut tracker = LivenessTracker::default();
        let effects = tracker.evaluate(now());
        assert_eq!(resets(&effects), 1);
        assert!(tracker.evaluate(now() + TimeDelta::seconds(2)).is_empty());
        assert_eq!(tracker.state(), LivenessState::Waiting);
    }
}
