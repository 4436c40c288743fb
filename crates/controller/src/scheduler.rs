//! Watering scheduler: decides when each zone's valve opens and closes.
//!
//! The scheduler is a pure decision engine. It never touches the link; the
//! orchestrator asks it which actuations are due, sends them, and commits
//! each transition back only after the write went out. Override requests
//! from the HTTP surface arrive as [`Override`] commands, applied under the
//! same lock as everything else.
//!
//! ## Per-zone state machine
//!
//! ```text
//!                 [moisture < threshold, automatic]
//! Idle ──────────────────────────────────────────▶ PendingOn(now + delay)
//!  ▲                                                   │
//!  │                                  [now ≥ fire_at] water_on
//!  │                                                   ▼
//!  └────────[now ≥ off_at] water_off ──────── Active(now + watering)
//! ```
//!
//! Overrides: `DelayPending` pushes `fire_at` forward, `CancelActive` pulls
//! `off_at` to now, `WaterNow` moves `Idle | PendingOn` to `PendingOn(now)`.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{Mode, ZoneId};
use crate::error::OverrideError;
use crate::link::ValveCommand;

// ---------------------------------------------------------------------------
// Per-zone schedule state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneTimer {
    /// Waiting for moisture to drop below the threshold.
    Idle,
    /// Valve closed; opens once `fire_at` passes.
    PendingOn { fire_at: Instant },
    /// Valve open; closes once `off_at` passes.
    Active { off_at: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleTimings {
    /// Time between a moisture breach and the valve opening.
    pub delay: Duration,
    /// How long the valve stays open.
    pub watering: Duration,
    /// Soil moisture (percent) below which a zone needs water.
    pub moisture_threshold: f64,
}

impl Default for ScheduleTimings {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1200),
            watering: Duration::from_secs(30),
            moisture_threshold: 25.0,
        }
    }
}

/// External request to adjust a zone's timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Override {
    DelayPending { zone: ZoneId, extra: Duration },
    CancelActive { zone: ZoneId },
    WaterNow { zone: ZoneId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actuation {
    pub zone: ZoneId,
    pub command: ValveCommand,
}

/// Outcome of checking one zone's latest moisture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Evaluation {
    NoData,
    Adequate,
    /// Already pending or active; nothing new scheduled.
    Busy,
    Scheduled { fire_at: Instant },
    /// Breach in manual mode; surfaces as a warning only.
    ManualBreach,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    mode: Mode,
    timings: ScheduleTimings,
    timers: BTreeMap<ZoneId, ZoneTimer>,
}

impl Scheduler {
    pub fn new(zones: impl IntoIterator<Item = ZoneId>, mode: Mode, timings: ScheduleTimings) -> Self {
        Self {
            mode,
            timings,
            timers: zones.into_iter().map(|z| (z, ZoneTimer::Idle)).collect(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn timings(&self) -> &ScheduleTimings {
        &self.timings
    }

    pub fn timer(&self, zone: ZoneId) -> Option<ZoneTimer> {
        self.timers.get(&zone).copied()
    }

    pub fn timers(&self) -> impl Iterator<Item = (ZoneId, ZoneTimer)> + '_ {
        self.timers.iter().map(|(&z, &t)| (z, t))
    }

    /// Check a zone's latest soil-moisture average. Only an idle zone in
    /// automatic mode can be scheduled.
    pub fn evaluate(&mut self, zone: ZoneId, soil_moisture: Option<f64>, now: Instant) -> Evaluation {
        let Some(timer) = self.timers.get_mut(&zone) else {
            return Evaluation::NoData;
        };
        let Some(moisture) = soil_moisture else {
            return Evaluation::NoData;
        };
        // NaN is never treated as dry.
        if moisture.is_nan() || moisture >= self.timings.moisture_threshold {
            return Evaluation::Adequate;
        }
        if *timer != ZoneTimer::Idle {
            return Evaluation::Busy;
        }
        if self.mode == Mode::Manual {
            debug!(zone, moisture, "low moisture in manual mode, not scheduling");
            return Evaluation::ManualBreach;
        }

        let fire_at = now + self.timings.delay;
        *timer = ZoneTimer::PendingOn { fire_at };
        info!(
            zone,
            moisture = format!("{moisture:.1}"),
            threshold = self.timings.moisture_threshold,
            delay_sec = self.timings.delay.as_secs(),
            "moisture below threshold, watering scheduled"
        );
        Evaluation::Scheduled { fire_at }
    }

    /// Actuations whose time has come, in zone order. Nothing changes until
    /// each one is committed.
    pub fn due(&self, now: Instant) -> Vec<Actuation> {
        self.timers
            .iter()
            .filter_map(|(&zone, timer)| match *timer {
                ZoneTimer::PendingOn { fire_at } if now >= fire_at => Some(Actuation {
                    zone,
                    command: ValveCommand::WaterOn,
                }),
                ZoneTimer::Active { off_at } if now >= off_at => Some(Actuation {
                    zone,
                    command: ValveCommand::WaterOff,
                }),
                _ => None,
            })
            .collect()
    }

    /// Record that `act` reached the wire. The command is already out, so a
    /// pending zone turns active even if its `fire_at` moved meanwhile.
    /// Returns false when the zone is no longer in the source state.
    pub fn commit(&mut self, act: &Actuation, now: Instant) -> bool {
        let Some(timer) = self.timers.get_mut(&act.zone) else {
            return false;
        };
        match (act.command, *timer) {
            (ValveCommand::WaterOn, ZoneTimer::PendingOn { .. }) => {
                *timer = ZoneTimer::Active {
                    off_at: now + self.timings.watering,
                };
                true
            }
            (ValveCommand::WaterOff, ZoneTimer::Active { .. }) => {
                *timer = ZoneTimer::Idle;
                true
            }
            _ => false,
        }
    }

    /// Apply an override. Returns a human-readable confirmation.
    pub fn apply(&mut self, cmd: Override, now: Instant) -> Result<String, OverrideError> {
        match cmd {
            Override::DelayPending { zone, extra } => {
                let timer = self.timer_mut(zone)?;
                let ZoneTimer::PendingOn { fire_at } = *timer else {
                    return Err(OverrideError::NotPending(zone));
                };
                let fire_at = fire_at
                    .checked_add(extra)
                    .ok_or(OverrideError::DelayTooLong(zone))?;
                *timer = ZoneTimer::PendingOn { fire_at };
                let minutes = extra.as_secs() / 60;
                info!(zone, minutes, "watering delayed");
                Ok(format!("zone {zone} watering delayed by {minutes} minutes"))
            }
            Override::CancelActive { zone } => {
                let timer = self.timer_mut(zone)?;
                let ZoneTimer::Active { .. } = *timer else {
                    return Err(OverrideError::NotActive(zone));
                };
                *timer = ZoneTimer::Active { off_at: now };
                info!(zone, "watering cancelled");
                Ok(format!("zone {zone} watering cancelled"))
            }
            Override::WaterNow { zone } => {
                let timer = self.timer_mut(zone)?;
                if let ZoneTimer::Active { .. } = *timer {
                    return Err(OverrideError::AlreadyActive(zone));
                }
                *timer = ZoneTimer::PendingOn { fire_at: now };
                info!(zone, "watering requested now");
                Ok(format!("zone {zone} watering started"))
            }
        }
    }

    fn timer_mut(&mut self, zone: ZoneId) -> Result<&mut ZoneTimer, OverrideError> {
        self.timers
            .get_mut(&zone)
            .ok_or(OverrideError::UnknownZone(zone))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
