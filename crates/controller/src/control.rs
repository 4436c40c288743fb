//! Orchestrator: the single loop that owns the radio link.
//!
//! Every tick it may run a poll pass over all zones, fetch the weather, and
//! send whatever valve commands the scheduler has due, strictly in that
//! order and never concurrently. HTTP handlers only touch [`SharedState`];
//! the link is reachable from here alone.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{Config, Zone};
use crate::db::{MetricsSink, Tags};
use crate::link::Transport;
use crate::metrics::aggregate;
use crate::poller::Poller;
use crate::state::SharedState;
use crate::weather::WeatherSource;

#[derive(Debug, Clone)]
pub struct Settings {
    pub system_name: String,
    pub zones: Arc<[Zone]>,
    pub remote_interval: Duration,
    pub weather_interval: Duration,
    pub tick: Duration,
}

impl Settings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            system_name: cfg.name.clone(),
            zones: cfg.zones.clone().into(),
            remote_interval: Duration::from_secs(cfg.remote_interval_sec),
            weather_interval: Duration::from_secs(cfg.weather_interval_sec),
            tick: Duration::from_secs(cfg.tick_sec),
        }
    }
}

/// When the next poll pass and weather fetch are due.
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    pub poll: Instant,
    pub weather: Instant,
}

impl Deadlines {
    pub fn now() -> Self {
        let now = Instant::now();
        Self {
            poll: now,
            weather: now,
        }
    }
}

pub struct Controller<T, S, W> {
    poller: Poller<T>,
    sink: S,
    weather: Option<W>,
    shared: SharedState,
    settings: Settings,
}

impl<T, S, W> Controller<T, S, W>
where
    T: Transport,
    S: MetricsSink,
    W: WeatherSource,
{
    pub fn new(poller: Poller<T>, sink: S, weather: Option<W>, shared: SharedState, settings: Settings) -> Self {
        Self {
            poller,
            sink,
            weather,
            shared,
            settings,
        }
    }

    /// Run forever. Runtime failures are logged and recorded, never returned.
    pub async fn run(mut self) {
        let mut ticker = interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deadlines = Deadlines::now();

        info!(
            zones = self.settings.zones.len(),
            remote_interval_sec = self.settings.remote_interval.as_secs(),
            weather = self.weather.is_some(),
            tick_sec = self.settings.tick.as_secs(),
            "controller started"
        );
        self.shared
            .write()
            .await
            .record_system("controller started".to_string());

        loop {
            ticker.tick().await;
            self.iteration(&mut deadlines).await;
        }
    }

    /// One loop iteration: whatever is due, then release the link if it
    /// was used.
    pub async fn iteration(&mut self, deadlines: &mut Deadlines) {
        let now = Instant::now();
        let mut used_link = false;

        if now >= deadlines.poll {
            self.poll_pass().await;
            deadlines.poll = now + self.settings.remote_interval;
            used_link = true;
        }

        if self.weather.is_some() && now >= deadlines.weather {
            self.fetch_weather().await;
            deadlines.weather = now + self.settings.weather_interval;
        }

        if self.schedule_cycle().await > 0 {
            used_link = true;
        }

        if used_link {
            self.release_link().await;
        }
    }

    /// Poll every zone once, in configured order, then let the scheduler
    /// look at every zone's latest averages. A failing zone is skipped and
    /// never holds up the rest.
    pub async fn poll_pass(&mut self) {
        let zones = Arc::clone(&self.settings.zones);
        for zone in zones.iter() {
            self.poll_zone(zone).await;
        }

        let evaluations = self.shared.write().await.evaluate_zones(Instant::now());
        debug!(zones = evaluations.len(), "scheduler evaluated");
    }

    async fn poll_zone(&mut self, zone: &Zone) {
        let frame = match self.poller.poll(zone.id).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(zone = zone.id, error = %e, "poll failed, skipping zone");
                let mut st = self.shared.write().await;
                st.link = self.poller.link().state();
                st.record_error(format!("{}: poll failed: {e}", zone.name));
                return;
            }
        };

        let agg = aggregate(&frame.readings, OffsetDateTime::now_utc());
        for w in &agg.warnings {
            warn!(zone = zone.id, "{w}");
        }
        debug!(zone = zone.id, averages = ?agg.averages, "zone averages");

        {
            let mut st = self.shared.write().await;
            st.link = self.poller.link().state();
            for w in frame.warnings.iter().chain(&agg.warnings) {
                st.record_warning(format!("{}: {w}", zone.name));
            }
            st.record_averages(zone.id, agg.averages.clone());
        }

        let tags = Tags {
            system_name: self.settings.system_name.clone(),
            zone_id: zone.id,
            soil_type: zone.soil_type,
        };
        if let Err(e) = self
            .sink
            .write_zone_metrics(&zone.name, &agg.averages, &tags)
            .await
        {
            error!(zone = zone.id, "metrics write failed: {e:#}");
            self.shared
                .write()
                .await
                .record_error(format!("{}: metrics write failed: {e}", zone.name));
        }
    }

    pub async fn fetch_weather(&mut self) {
        let Some(source) = &self.weather else {
            return;
        };
        let snapshot = match source.current_weather().await {
            Ok(s) => s,
            Err(e) => {
                error!("weather fetch failed: {e:#}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("weather fetch failed: {e}"));
                return;
            }
        };

        if let Err(e) = self.sink.write_weather_metrics(&snapshot).await {
            error!("weather metrics write failed: {e:#}");
            self.shared
                .write()
                .await
                .record_error(format!("weather metrics write failed: {e}"));
        }
        self.shared.write().await.record_weather(snapshot);
    }

    /// Send every due valve command. Each transition is committed only
    /// after its command reached the wire; a failed one stays due for the
    /// next tick. Returns the number of actuations attempted.
    pub async fn schedule_cycle(&mut self) -> usize {
        let due = self.shared.read().await.scheduler.due(Instant::now());

        for act in &due {
            let sent = self.poller.link_mut().actuate(act.zone, act.command).await;

            let mut st = self.shared.write().await;
            st.link = self.poller.link().state();
            match sent {
                Ok(()) => {
                    if st.scheduler.commit(act, Instant::now()) {
                        st.record_valve(act.zone, act.command);
                    } else {
                        warn!(zone = act.zone, command = ?act.command, "timer changed before commit");
                    }
                }
                Err(e) => {
                    error!(zone = act.zone, command = ?act.command, error = %e, "valve command failed");
                    let name = st.zone_name(act.zone).to_string();
                    st.record_error(format!("{name}: valve command failed: {e}"));
                }
            }
        }
        due.len()
    }

    async fn release_link(&mut self) {
        if let Err(e) = self.poller.link_mut().detach().await {
            warn!(error = %e, "detach failed");
        }
        self.shared.write().await.link = self.poller.link().state();
    }

    #[cfg(test)]
    pub(crate) fn poller(&self) -> &Poller<T> {
        &self.poller
    }
}

// ===========================================================================
// Tests
// ===========================================================================
