use crate::metrics::SensorMode;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeDecision {
    /// Nothing to do
    Unchanged,
    /// Data agrees with the assumed mode
    Confirmed,
    /// Windows must be cleared and reloaded under `to`
    Switched { from: SensorMode, to: SensorMode },
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ModeResolver {
    active: SensorMode,
    /// False while `active` is only the configured default
    confirmed: bool,
    auto_switch_used: bool,
}

impl ModeResolver {
    /// Start from the mode persisted in the device record, unconfirmed
    pub fn new(default: SensorMode) -> Self {
        Self {
            active: default,
            confirmed: false,
            auto_switch_used: false,
        }
    }

    pub fn active(&self) -> SensorMode {
        self.active
    }

    pub fn confirmed(&self) -> bool {
        self.confirmed
    }

    /// Feed the mode of the newest reading from a successful load. Only the
    /// first observation can switch; an empty load should not be reported.
    pub fn observe_first_load(&mut self, latest: SensorMode) -> ModeDecision {
        if self.confirmed || self.auto_switch_used {
            return ModeDecision::Unchanged;
        }

        self.confirmed = true;
        self.auto_switch_used = true;

        if latest == self.active {
            info!("Sensor mode {} confirmed by data", latest);
            return ModeDecision::Confirmed;
        }

        let from = self.active;
        self.active = latest;
        info!("Auto-detected sensor mode {} (configured {})", latest, from);
        ModeDecision::Switched { from, to: latest }
    }

    /// User-initiated switch. Suppresses any later automatic switch.
    pub fn switch_explicit(&mut self, mode: SensorMode) -> ModeDecision {
        self.confirmed = true;
        self.auto_switch_used = true;

        if mode == self.active {
            return ModeDecision::Unchanged;
        }

        let from = self.active;
        self.active = mode;
        info!("Switched sensor mode {} -> {}", from, mode);
        ModeDecision::Switched { from, to: mode }
    }
}
