use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::{Mode, SoilType, Zone, ZoneId};
use crate::error::OverrideError;
use crate::link::{LinkState, ValveCommand};
use crate::metrics::ZoneAverages;
use crate::scheduler::{Evaluation, Override, ScheduleTimings, Scheduler, ZoneTimer};
use crate::warnings::{self, Conditions, Warning};
use crate::weather::WeatherSnapshot;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

/// The single lock guarding scheduler timers, latest averages, and the
/// link-state mirror. The polling loop and the HTTP handlers both go
/// through it.
pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub name: String,
    pub zones: Vec<Zone>,
    /// Mirror of the link manager's state, for status only.
    pub link: LinkState,
    pub averages: BTreeMap<ZoneId, ZoneAverages>,
    pub weather: Option<WeatherSnapshot>,
    pub scheduler: Scheduler,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Valve,
    Scheduler,
    Warning,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub name: String,
    pub mode: Mode,
    pub link: LinkState,
    pub zones: Vec<ZoneStatus>,
    pub weather: Option<WeatherSnapshot>,
    pub events: Vec<SystemEvent>,
}

#[derive(Serialize)]
pub struct ZoneStatus {
    pub id: ZoneId,
    pub name: String,
    pub soil_type: SoilType,
    pub timer: TimerStatus,
    pub averages: Option<ZoneAverages>,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TimerStatus {
    Idle,
    PendingOn { fire_in_sec: u64 },
    Active { off_in_sec: u64 },
}

impl TimerStatus {
    fn at(timer: ZoneTimer, now: Instant) -> Self {
        match timer {
            ZoneTimer::Idle => Self::Idle,
            ZoneTimer::PendingOn { fire_at } => Self::PendingOn {
                fire_in_sec: fire_at.saturating_duration_since(now).as_secs(),
            },
            ZoneTimer::Active { off_at } => Self::Active {
                off_in_sec: off_at.saturating_duration_since(now).as_secs(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(name: &str, zones: &[Zone], mode: Mode, timings: ScheduleTimings) -> Self {
        Self {
            started_at: Instant::now(),
            name: name.to_string(),
            zones: zones.to_vec(),
            link: LinkState::Detached,
            averages: BTreeMap::new(),
            weather: None,
            scheduler: Scheduler::new(zones.iter().map(|z| z.id), mode, timings),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(RwLock::new(self))
    }

    pub fn zone_name(&self, zone: ZoneId) -> &str {
        self.zones
            .iter()
            .find(|z| z.id == zone)
            .map_or("unknown", |z| z.name.as_str())
    }

    /// Store a zone's fresh averages. A failed poll never calls this, so the
    /// previous averages stay in place.
    pub fn record_averages(&mut self, zone: ZoneId, averages: ZoneAverages) {
        let detail = format!(
            "{}: temperature={} humidity={} soil_moisture={}",
            self.zone_name(zone),
            fmt_opt(averages.temperature),
            fmt_opt(averages.humidity),
            fmt_opt(averages.soil_moisture),
        );
        self.averages.insert(zone, averages);
        self.push_event(EventKind::Reading, detail);
    }

    /// Run the scheduler over every zone's latest stored averages, whether or
    /// not that zone answered the last pass.
    pub fn evaluate_zones(&mut self, now: Instant) -> Vec<(ZoneId, Evaluation)> {
        let latest: Vec<_> = self
            .averages
            .iter()
            .map(|(&zone, avg)| (zone, avg.soil_moisture))
            .collect();

        let mut out = Vec::with_capacity(latest.len());
        for (zone, moisture) in latest {
            let evaluation = self.scheduler.evaluate(zone, moisture, now);
            match evaluation {
                Evaluation::Scheduled { fire_at } => {
                    let secs = fire_at.saturating_duration_since(now).as_secs();
                    let detail = format!("{}: watering scheduled in {secs}s", self.zone_name(zone));
                    self.push_event(EventKind::Scheduler, detail);
                }
                Evaluation::ManualBreach => {
                    let detail = format!(
                        "{}: low moisture alert (manual mode, not scheduling)",
                        self.zone_name(zone)
                    );
                    self.push_event(EventKind::Warning, detail);
                }
                Evaluation::NoData | Evaluation::Adequate | Evaluation::Busy => {}
            }
            out.push((zone, evaluation));
        }
        out
    }

    pub fn record_weather(&mut self, snapshot: WeatherSnapshot) {
        let detail = format!(
            "weather: {} clouds={}% wind={}m/s",
            snapshot.description, snapshot.cloud_cover, snapshot.wind_speed
        );
        self.weather = Some(snapshot);
        self.push_event(EventKind::Reading, detail);
    }

    /// Record a valve command that reached the wire.
    pub fn record_valve(&mut self, zone: ZoneId, command: ValveCommand) {
        let state_str = match command {
            ValveCommand::WaterOn => "ON",
            ValveCommand::WaterOff => "OFF",
        };
        let detail = format!("{} set {state_str}", self.zone_name(zone));
        self.push_event(EventKind::Valve, detail);
    }

    /// Apply an override request under the caller's lock.
    pub fn apply_override(&mut self, cmd: Override, now: Instant) -> Result<String, OverrideError> {
        let result = self.scheduler.apply(cmd, now);
        match &result {
            Ok(msg) => self.push_event(EventKind::Scheduler, format!("override: {msg}")),
            Err(e) => self.push_event(EventKind::Scheduler, format!("override rejected: {e}")),
        }
        result
    }

    /// Warnings for the current averages and weather. Nothing is cached.
    pub fn warnings(&self) -> Vec<Warning> {
        warnings::evaluate(&Conditions {
            zones: &self.zones,
            averages: &self.averages,
            weather: self.weather.as_ref(),
            mode: self.scheduler.mode(),
            moisture_threshold: self.scheduler.timings().moisture_threshold,
        })
    }

    /// Record a non-fatal integrity problem.
    pub fn record_warning(&mut self, detail: String) {
        self.push_event(EventKind::Warning, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        let now = Instant::now();
        let zones = self
            .zones
            .iter()
            .map(|z| ZoneStatus {
                id: z.id,
                name: z.name.clone(),
                soil_type: z.soil_type,
                timer: TimerStatus::at(self.scheduler.timer(z.id).unwrap_or(ZoneTimer::Idle), now),
                averages: self.averages.get(&z.id).cloned(),
            })
            .collect();

        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            name: self.name.clone(),
            mode: self.scheduler.mode(),
            link: self.link,
            zones,
            weather: self.weather.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map_or_else(|| "n/a".to_string(), |v| format!("{v:.1}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn zones() -> Vec<Zone> {
        vec![
            Zone {
                id: 1,
                name: "Front bed".into(),
                soil_type: SoilType::Loam,
            },
            Zone {
                id: 3,
                name: "Vegetables".into(),
                soil_type: SoilType::Clay,
            },
        ]
    }

    fn state(mode: Mode) -> SystemState {
        SystemState::new("test", &zones(), mode, ScheduleTimings::default())
    }

    fn averages(soil_moisture: f64) -> ZoneAverages {
        ZoneAverages {
            temperature: Some(23.0),
            humidity: Some(52.0),
            soil_moisture: Some(soil_moisture),
            flow_rate: Some(0.0),
            water_on: Some(0.0),
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn kinds(st: &SystemState) -> Vec<EventKind> {
        st.events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn low_moisture_schedules_and_records_event() {
        let mut st = state(Mode::Automatic);
        let now = Instant::now();
        st.record_averages(3, averages(18.0));
        let evals = st.evaluate_zones(now);

        assert!(matches!(evals[..], [(3, Evaluation::Scheduled { .. })]));
        assert_eq!(kinds(&st), [EventKind::Reading, EventKind::Scheduler]);
        assert!(st.events[1].detail.starts_with("Vegetables"));
    }

    #[test]
    fn stored_averages_reschedule_after_cycle_ends() {
        let mut st = state(Mode::Automatic);
        let t0 = Instant::now();
        st.record_averages(3, averages(18.0));
        st.evaluate_zones(t0);

        // Water the zone and let the cycle finish without any fresh poll.
        let on = st.scheduler.due(t0 + Duration::from_secs(1200))[0];
        assert!(st.scheduler.commit(&on, t0 + Duration::from_secs(1200)));
        let off_time = t0 + Duration::from_secs(1230);
        let off = st.scheduler.due(off_time)[0];
        assert!(st.scheduler.commit(&off, off_time));
        assert_eq!(st.scheduler.timer(3), Some(ZoneTimer::Idle));

        let evals = st.evaluate_zones(off_time);
        assert!(matches!(evals[..], [(3, Evaluation::Scheduled { .. })]));
        assert!(matches!(st.scheduler.timer(3), Some(ZoneTimer::PendingOn { .. })));
    }

    #[test]
    fn manual_breach_records_warning_event_only() {
        let mut st = state(Mode::Manual);
        let now = Instant::now();
        st.record_averages(3, averages(18.0));
        st.evaluate_zones(now);

        assert_eq!(st.scheduler.timer(3), Some(ZoneTimer::Idle));
        assert_eq!(kinds(&st), [EventKind::Reading, EventKind::Warning]);
        assert_eq!(st.warnings().len(), 1);
    }

    #[test]
    fn rejected_override_is_recorded() {
        let mut st = state(Mode::Automatic);
        let now = Instant::now();
        let res = st.apply_override(Override::CancelActive { zone: 1 }, now);

        assert_eq!(res, Err(OverrideError::NotActive(1)));
        assert!(st.events.back().unwrap().detail.contains("rejected"));
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let mut st = state(Mode::Automatic);
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 25");
    }

    #[test]
    fn status_reports_timers_and_newest_event_first() {
        let mut st = state(Mode::Automatic);
        let now = Instant::now();
        st.record_system("first".into());
        st.apply_override(Override::WaterNow { zone: 3 }, now).unwrap();
        st.record_averages(1, averages(40.0));
        st.evaluate_zones(now);

        let status = st.to_status();
        assert_eq!(status.zones.len(), 2);
        assert_eq!(status.zones[0].timer, TimerStatus::Idle);
        assert_eq!(status.zones[1].timer, TimerStatus::PendingOn { fire_in_sec: 0 });
        assert!(status.zones[0].averages.is_some());
        assert!(status.zones[1].averages.is_none());
        assert_eq!(status.events.last().unwrap().detail, "first");

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["zones"][1]["timer"]["state"], "pending_on");
        assert_eq!(json["link"]["state"], "detached");
        assert_eq!(json["mode"], "automatic");
    }

    #[test]
    fn active_timer_reports_remaining_seconds() {
        let status = TimerStatus::at(
            ZoneTimer::Active {
                off_at: Instant::now() + Duration::from_secs(30),
            },
            Instant::now(),
        );
        assert!(matches!(status, TimerStatus::Active { off_in_sec } if off_in_sec <= 30 && off_in_sec >= 29));
    }
}
