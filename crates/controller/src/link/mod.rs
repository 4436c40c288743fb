//! Link Manager: sole owner of the shared half-duplex radio channel.
//!
//! The radio bridges one zone unit at a time. Switching units means dropping
//! into the radio's command mode, killing the current connection, and
//! connecting to the target:
//!
//! ```text
//! $$$ ──settle──▶ k,1 ──settle──▶ c<id> ──settle──▶ probe
//!                                   ▲                  │
//!                                   └─ %%DISCONNECT% ──┘  (at most 2 retries)
//! ```
//!
//! Writes are fire-and-forget. The only feedback is the marker text the
//! radio echoes into later reads.

pub mod serial;
#[cfg(feature = "sim")]
pub mod sim;

#[cfg(test)]
pub(crate) mod mock;

use std::future::Future;
use std::io;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::ZoneId;
use crate::error::LinkError;

// ---------------------------------------------------------------------------
// Wire strings
// ---------------------------------------------------------------------------

pub(crate) const ESCAPE: &str = "$$$";
pub(crate) const DISCONNECT: &str = "k,1\n\r";
pub(crate) const NUDGE: &str = " \r\n";
pub(crate) const EXIT_COMMAND_MODE: &str = "---\n\r";

/// Echoed by the radio when a connect attempt did not reach the unit.
pub(crate) const DISCONNECT_MARKER: &str = "%%DISCONNECT%";
/// Present in any response produced while the radio is still in command mode.
pub(crate) const COMMAND_MODE_MARKER: &str = "CMD";

/// Extra connect attempts after the first one reports a disconnect.
const CONNECT_RETRIES: u32 = 2;
/// Pause between empty reads so a quiet line does not spin.
const READ_IDLE: Duration = Duration::from_millis(20);
/// Upper bound on reads spent discarding stale input.
const MAX_DISCARD_READS: usize = 8;

pub(crate) fn connect_command(zone: ZoneId) -> String {
    format!("c{zone}\n\r")
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Byte-level access to the physical channel. `read` returns `Ok(0)` when
/// nothing arrived within the transport's own short read slice.
pub trait Transport: Send {
    fn write(&mut self, bytes: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

// ---------------------------------------------------------------------------
// Link state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "zone", rename_all = "snake_case")]
pub enum LinkState {
    Detached,
    Attached(ZoneId),
    /// The radio may still be in command mode; the next attach must run the
    /// full sequence.
    StuckCommandMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveCommand {
    WaterOn,
    WaterOff,
}

impl ValveCommand {
    pub fn line(self, zone: ZoneId) -> String {
        match self {
            Self::WaterOn => format!("water_on={zone}\r\n"),
            Self::WaterOff => format!("water_off={zone}\r\n"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimings {
    pub escape_settle: Duration,
    pub disconnect_settle: Duration,
    pub connect_settle: Duration,
    pub probe_window: Duration,
    pub poll_settle: Duration,
    pub read_timeout: Duration,
}

impl Default for LinkTimings {
    fn default() -> Self {
        Self {
            escape_settle: Duration::from_millis(500),
            disconnect_settle: Duration::from_millis(1000),
            connect_settle: Duration::from_millis(3000),
            probe_window: Duration::from_millis(500),
            poll_settle: Duration::from_millis(100),
            read_timeout: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Link manager
// ---------------------------------------------------------------------------

pub struct LinkManager<T> {
    transport: T,
    state: LinkState,
    timings: LinkTimings,
    buf: Vec<u8>,
}

impl<T: Transport> LinkManager<T> {
    pub fn new(transport: T, timings: LinkTimings) -> Self {
        Self {
            transport,
            state: LinkState::Detached,
            timings,
            buf: vec![0; 512],
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn timings(&self) -> &LinkTimings {
        &self.timings
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    /// Make the next `attach` run the full sequence regardless of which zone
    /// was last addressed.
    pub(crate) fn mark_stuck(&mut self) {
        self.state = LinkState::StuckCommandMode;
    }

    /// Address `zone` exclusively. A no-op when already attached to it.
    pub async fn attach(&mut self, zone: ZoneId) -> Result<(), LinkError> {
        if self.state == LinkState::Attached(zone) {
            return Ok(());
        }
        debug!(zone, from = ?self.state, "switching radio connection");

        // Until the probe comes back clean the radio mode is unknown.
        self.state = LinkState::StuckCommandMode;

        self.write(ESCAPE.as_bytes()).await?;
        sleep(self.timings.escape_settle).await;
        self.write(DISCONNECT.as_bytes()).await?;
        sleep(self.timings.disconnect_settle).await;

        let connect = connect_command(zone);
        self.write(connect.as_bytes()).await?;
        sleep(self.timings.connect_settle).await;
        self.write(NUDGE.as_bytes()).await?;

        let mut probe = self.read_for(self.timings.probe_window).await?;
        debug!(zone, probe = %probe.trim(), "connect probe");

        let mut retries = 0;
        while probe.contains(DISCONNECT_MARKER) {
            if retries == CONNECT_RETRIES {
                warn!(zone, attempts = retries + 1, "radio kept dropping the connection");
                return Err(LinkError::AttachExhausted {
                    zone,
                    attempts: retries + 1,
                });
            }
            retries += 1;
            warn!(zone, retry = retries, "radio reported disconnect, reconnecting");
            self.write(connect.as_bytes()).await?;
            probe = self.read_for(self.timings.probe_window).await?;
        }

        self.state = LinkState::Attached(zone);
        info!(zone, "attached");
        Ok(())
    }

    /// Release the radio to the neutral, unaddressed state.
    pub async fn detach(&mut self) -> Result<(), LinkError> {
        if self.state == LinkState::Detached {
            return Ok(());
        }
        self.state = LinkState::StuckCommandMode;

        self.write(ESCAPE.as_bytes()).await?;
        sleep(self.timings.escape_settle).await;
        self.write(DISCONNECT.as_bytes()).await?;
        sleep(self.timings.disconnect_settle).await;

        self.state = LinkState::Detached;
        debug!("detached");
        Ok(())
    }

    /// Attach to `zone` (re-verifying the addressing) and send a valve command.
    pub async fn actuate(&mut self, zone: ZoneId, command: ValveCommand) -> Result<(), LinkError> {
        self.attach(zone).await?;
        self.write(command.line(zone).as_bytes()).await?;
        info!(zone, ?command, "valve command sent");
        Ok(())
    }

    /// Raw write; anything short of the full buffer is an error.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let written = self.transport.write(bytes).await?;
        if written != bytes.len() {
            return Err(LinkError::ShortWrite {
                written,
                expected: bytes.len(),
            });
        }
        Ok(())
    }

    /// Collect everything that arrives within `window`.
    pub async fn read_for(&mut self, window: Duration) -> Result<String, LinkError> {
        let deadline = Instant::now() + window;
        let mut contents = Vec::new();
        while Instant::now() < deadline {
            let n = self.transport.read(&mut self.buf).await?;
            if n == 0 {
                sleep(READ_IDLE).await;
                continue;
            }
            contents.extend_from_slice(&self.buf[..n]);
        }
        Ok(String::from_utf8_lossy(&contents).into_owned())
    }

    /// Read until a newline arrives. `None` means `timeout` elapsed first.
    pub async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError> {
        let deadline = Instant::now() + timeout;
        let mut contents = Vec::new();
        loop {
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let n = self.transport.read(&mut self.buf).await?;
            if n == 0 {
                sleep(READ_IDLE).await;
                continue;
            }
            contents.extend_from_slice(&self.buf[..n]);
            if self.buf[..n].contains(&b'\n') {
                return Ok(Some(String::from_utf8_lossy(&contents).into_owned()));
            }
        }
    }

    /// Drop bytes left over from earlier exchanges.
    pub async fn discard_input(&mut self) -> Result<usize, LinkError> {
        let mut dropped = 0;
        for _ in 0..MAX_DISCARD_READS {
            let n = self.transport.read(&mut self.buf).await?;
            if n == 0 {
                break;
            }
            dropped += n;
        }
        if dropped > 0 {
            debug!(bytes = dropped, "discarded stale input");
        }
        Ok(dropped)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
