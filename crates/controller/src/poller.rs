//! Device Poller: requests one reading frame from a zone unit and checks its
//! shape against the fixed firmware layout.
//!
//! A frame is a single line of comma-separated `name=value` tokens:
//!
//! ```text
//! hardware_id=3,temperature_a=22,...,flow_rate_b=0,water_on=0\r\n
//! ```

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::config::ZoneId;
use crate::error::{IntegrityWarning, LinkError, PollError, ProtocolError};
use crate::link::{LinkManager, Transport, COMMAND_MODE_MARKER, EXIT_COMMAND_MODE, NUDGE};

/// Token count of every well-formed frame.
pub const FRAME_TOKENS: usize = 14;
/// Name of the first field; its value echoes the unit's own address.
pub const HARDWARE_ID_FIELD: &str = "hardware_id";
/// Name of the last field; its value is the unit's valve state.
pub const TRAILER_FIELD: &str = "water_on";

/// Poll attempts when the unit stays silent.
const TIMEOUT_ATTEMPTS: u32 = 2;
/// Re-attach rounds when replies still carry the command-mode prompt.
const STUCK_RECOVERY_ROUNDS: u32 = 3;

pub(crate) fn poll_command(zone: ZoneId) -> String {
    format!("poll={zone}\r\n")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub zone: ZoneId,
    pub readings: Vec<Reading>,
    pub warnings: Vec<IntegrityWarning>,
}

pub struct Poller<T> {
    link: LinkManager<T>,
}

impl<T: Transport> Poller<T> {
    pub fn new(link: LinkManager<T>) -> Self {
        Self { link }
    }

    pub fn link(&self) -> &LinkManager<T> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut LinkManager<T> {
        &mut self.link
    }

    /// Attach to `zone`, request a frame, and validate it.
    pub async fn poll(&mut self, zone: ZoneId) -> Result<Frame, PollError> {
        self.link.attach(zone).await?;
        let mut response = self.request(zone).await?;

        let mut round = 0;
        while response.contains(COMMAND_MODE_MARKER) {
            if round == STUCK_RECOVERY_ROUNDS {
                error!(zone, "radio still in command mode after recovery");
                self.link.mark_stuck();
                return Err(LinkError::StuckCommandMode { zone }.into());
            }
            round += 1;
            warn!(zone, round, "radio stuck in command mode, re-attaching");
            self.link.mark_stuck();
            self.link.write(EXIT_COMMAND_MODE.as_bytes()).await?;
            self.link.attach(zone).await?;
            response = self.request(zone).await?;
        }

        debug!(zone, frame = %response.trim(), "poll response");
        let readings = parse_frame(zone, &response)?;
        let warnings = validate_frame(zone, &readings);
        for w in &warnings {
            warn!(zone, "{w}");
        }
        Ok(Frame {
            zone,
            readings,
            warnings,
        })
    }

    /// Send the poll command and wait for one terminated line. A silent unit
    /// gets one more try before the poll is abandoned.
    async fn request(&mut self, zone: ZoneId) -> Result<String, LinkError> {
        let timeout = self.link.timings().read_timeout;
        let settle = self.link.timings().poll_settle;
        let command = poll_command(zone);

        for attempt in 1..=TIMEOUT_ATTEMPTS {
            self.link.discard_input().await?;
            self.link.write(NUDGE.as_bytes()).await?;
            self.link.write(command.as_bytes()).await?;
            sleep(settle).await;

            if let Some(line) = self.link.read_line(timeout).await? {
                return Ok(line);
            }
            warn!(zone, attempt, "no reply to poll");
        }
        Err(LinkError::Timeout { zone, timeout })
    }
}

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

fn trim_line(s: &str) -> &str {
    s.trim_matches(|c| matches!(c, '\r' | '\n' | '\t' | ' '))
}

/// Split a terminated response into readings. The token count is checked
/// before any value is parsed so truncated frames report as such.
pub fn parse_frame(zone: ZoneId, response: &str) -> Result<Vec<Reading>, ProtocolError> {
    let line = trim_line(response);
    if line.is_empty() {
        return Err(ProtocolError::Empty { zone });
    }

    let tokens: Vec<&str> = line.split(',').collect();
    if tokens.len() != FRAME_TOKENS {
        return Err(ProtocolError::TokenCount {
            expected: FRAME_TOKENS,
            got: tokens.len(),
        });
    }

    tokens.into_iter().map(parse_token).collect()
}

fn parse_token(token: &str) -> Result<Reading, ProtocolError> {
    let malformed = || ProtocolError::MalformedToken {
        token: token.to_string(),
    };
    let (name, value) = token.split_once('=').ok_or_else(malformed)?;
    let name = trim_line(name);
    let value = trim_line(value);
    if name.is_empty() {
        return Err(malformed());
    }
    // `nan` and `inf` parse as f64 but are never sensor readings.
    let value = value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ProtocolError::BadValue {
            name: name.to_string(),
            value: value.to_string(),
        })?;
    Ok(Reading {
        name: name.to_string(),
        value,
    })
}

/// Positional checks on a parsed frame. Mismatches are reported, never fatal.
pub fn validate_frame(zone: ZoneId, readings: &[Reading]) -> Vec<IntegrityWarning> {
    let mut warnings = Vec::new();

    if let Some(first) = readings.first() {
        if first.name != HARDWARE_ID_FIELD {
            warnings.push(IntegrityWarning::HardwareIdMissing {
                found: first.name.clone(),
            });
        }
        if first.value != f64::from(zone) {
            warnings.push(IntegrityWarning::HardwareIdMismatch {
                expected: zone,
                reported: first.value,
            });
        }
    }

    if let Some(last) = readings.last() {
        if !last.name.contains(TRAILER_FIELD) {
            warnings.push(IntegrityWarning::TrailerMisplaced {
                found: last.name.clone(),
            });
        }
    }

    warnings
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::ScriptedTransport;
    use crate::link::{connect_command, LinkState, LinkTimings, ESCAPE};
    use std::collections::{HashMap, HashSet};
    use std::time::Duration;
    use tokio::time::Instant;

    const ZONE3_FRAME: &str = "hardware_id=3,temperature_a=22,temperature_b=24,\
        temperature_c=9999,humidity_a=50,humidity_b=54,humidity_c=52,soil_moisture_a=18,\
        soil_moisture_b=20,soil_moisture_c=16,soil_moisture_d=18,flow_rate_a=0,flow_rate_b=0,\
        water_on=0";

    fn poller(transport: ScriptedTransport) -> Poller<ScriptedTransport> {
        Poller::new(LinkManager::new(transport, LinkTimings::default()))
    }

    fn radio(zone: ZoneId, frame: &str) -> ScriptedTransport {
        ScriptedTransport::radio(HashMap::from([(zone, frame.to_string())]), HashSet::new())
    }

    // -- parse_frame --------------------------------------------------------

    #[test]
    fn parse_valid_frame() {
        let readings = parse_frame(3, &format!("{ZONE3_FRAME}\r\n")).unwrap();
        assert_eq!(readings.len(), FRAME_TOKENS);
        assert_eq!(
            readings[0],
            Reading {
                name: "hardware_id".into(),
                value: 3.0
            }
        );
        assert_eq!(readings[3].value, 9999.0);
        assert_eq!(readings[13].name, "water_on");
    }

    #[test]
    fn parse_trims_whitespace_around_tokens() {
        let frame = ZONE3_FRAME.replace("temperature_a=22", " temperature_a = 22 ");
        let readings = parse_frame(3, &frame).unwrap();
        assert_eq!(readings[1].name, "temperature_a");
        assert_eq!(readings[1].value, 22.0);
    }

    #[test]
    fn parse_truncated_frame_is_token_count_error() {
        let truncated = ZONE3_FRAME.rsplit_once(',').unwrap().0;
        assert_eq!(
            parse_frame(3, truncated),
            Err(ProtocolError::TokenCount {
                expected: 14,
                got: 13
            })
        );
    }

    #[test]
    fn parse_extra_tokens_is_token_count_error() {
        let long = format!("{ZONE3_FRAME},battery=3.3");
        assert!(matches!(
            parse_frame(3, &long),
            Err(ProtocolError::TokenCount { got: 15, .. })
        ));
    }

    #[test]
    fn parse_unparsable_value_fails() {
        let bad = ZONE3_FRAME.replace("humidity_b=54", "humidity_b=5x4");
        assert_eq!(
            parse_frame(3, &bad),
            Err(ProtocolError::BadValue {
                name: "humidity_b".into(),
                value: "5x4".into()
            })
        );
    }

    #[test]
    fn parse_non_finite_value_fails() {
        for garbage in ["nan", "NaN", "inf", "-inf"] {
            let bad = ZONE3_FRAME.replace("soil_moisture_a=18", &format!("soil_moisture_a={garbage}"));
            assert_eq!(
                parse_frame(3, &bad),
                Err(ProtocolError::BadValue {
                    name: "soil_moisture_a".into(),
                    value: garbage.into()
                })
            );
        }
    }

    #[test]
    fn parse_token_without_equals_fails() {
        let bad = ZONE3_FRAME.replace("humidity_b=54", "humidity_b54");
        assert!(matches!(
            parse_frame(3, &bad),
            Err(ProtocolError::MalformedToken { .. })
        ));
    }

    #[test]
    fn parse_empty_response_fails() {
        assert_eq!(parse_frame(4, "\r\n"), Err(ProtocolError::Empty { zone: 4 }));
    }

    // -- validate_frame -----------------------------------------------------

    #[test]
    fn validate_clean_frame_has_no_warnings() {
        let readings = parse_frame(3, ZONE3_FRAME).unwrap();
        assert!(validate_frame(3, &readings).is_empty());
    }

    #[test]
    fn validate_hardware_id_mismatch() {
        let readings = parse_frame(3, ZONE3_FRAME).unwrap();
        assert_eq!(
            validate_frame(5, &readings),
            vec![IntegrityWarning::HardwareIdMismatch {
                expected: 5,
                reported: 3.0
            }]
        );
    }

    #[test]
    fn validate_missing_hardware_id_field() {
        let frame = ZONE3_FRAME.replace("hardware_id=3", "unit=3");
        let readings = parse_frame(3, &frame).unwrap();
        assert_eq!(
            validate_frame(3, &readings),
            vec![IntegrityWarning::HardwareIdMissing {
                found: "unit".into()
            }]
        );
    }

    #[test]
    fn validate_misplaced_trailer() {
        let frame = ZONE3_FRAME.replace("water_on=0", "valve=1");
        let readings = parse_frame(3, &frame).unwrap();
        assert_eq!(
            validate_frame(3, &readings),
            vec![IntegrityWarning::TrailerMisplaced {
                found: "valve".into()
            }]
        );
        // The raw value is still in the result.
        assert_eq!(readings[13].value, 1.0);
    }

    // -- poll ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn poll_attaches_then_sends_poll_command() {
        let mut poller = poller(radio(3, ZONE3_FRAME));
        let frame = poller.poll(3).await.unwrap();

        assert_eq!(frame.zone, 3);
        assert_eq!(frame.readings.len(), FRAME_TOKENS);
        assert!(frame.warnings.is_empty());

        let writes = &poller.link().transport().writes;
        let connect_at = writes.iter().position(|w| *w == connect_command(3)).unwrap();
        let poll_at = writes.iter().position(|w| w == "poll=3\r\n").unwrap();
        assert!(connect_at < poll_at);
        assert_eq!(writes[poll_at - 1], NUDGE);
    }

    #[tokio::test(start_paused = true)]
    async fn second_poll_reuses_attachment() {
        let mut poller = poller(radio(3, ZONE3_FRAME));
        poller.poll(3).await.unwrap();
        poller.poll(3).await.unwrap();
        assert_eq!(poller.link().transport().count(ESCAPE), 1);
        assert_eq!(poller.link().transport().count("poll=3\r\n"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_reports_hardware_id_mismatch_but_succeeds() {
        let mut poller = poller(radio(4, ZONE3_FRAME));
        let frame = poller.poll(4).await.unwrap();
        assert!(matches!(
            frame.warnings[..],
            [IntegrityWarning::HardwareIdMismatch { expected: 4, .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_unit_is_retried_once_then_times_out() {
        let mut poller = poller(ScriptedTransport::silent());
        let start = Instant::now();
        let err = poller.poll(3).await.unwrap_err();

        assert!(matches!(err, PollError::Link(LinkError::Timeout { zone: 3, .. })));
        assert_eq!(poller.link().transport().count("poll=3\r\n"), 2);
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_succeeds_on_retry() {
        let mut polls = 0;
        let transport = ScriptedTransport::new(move |line| {
            if line.starts_with("poll=") {
                polls += 1;
                (polls == 2).then(|| format!("{ZONE3_FRAME}\r\n"))
            } else {
                None
            }
        });
        let mut poller = poller(transport);
        let frame = poller.poll(3).await.unwrap();
        assert_eq!(frame.readings.len(), FRAME_TOKENS);
    }

    #[tokio::test(start_paused = true)]
    async fn garbled_frame_is_protocol_error() {
        let mut poller = poller(radio(3, "hardware_id=3,temperature_a=22"));
        let err = poller.poll(3).await.unwrap_err();
        assert!(matches!(
            err,
            PollError::Protocol(ProtocolError::TokenCount { got: 2, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_radio_recovers_after_reattach() {
        let mut stuck_replies = 1;
        let transport = ScriptedTransport::new(move |line| {
            if !line.starts_with("poll=") {
                return None;
            }
            if stuck_replies > 0 {
                stuck_replies -= 1;
                Some("CMD> ?\r\n".into())
            } else {
                Some(format!("{ZONE3_FRAME}\r\n"))
            }
        });
        let mut poller = poller(transport);
        let frame = poller.poll(3).await.unwrap();

        assert_eq!(frame.readings.len(), FRAME_TOKENS);
        let t = poller.link().transport();
        assert_eq!(t.count(EXIT_COMMAND_MODE), 1);
        assert_eq!(t.count(&connect_command(3)), 2);
        assert_eq!(poller.link().state(), LinkState::Attached(3));
    }

    #[tokio::test(start_paused = true)]
    async fn permanently_stuck_radio_gives_up() {
        let stuck = HashSet::from([3]);
        let transport = ScriptedTransport::radio(HashMap::new(), stuck);
        let mut poller = poller(transport);
        let err = poller.poll(3).await.unwrap_err();

        assert!(matches!(
            err,
            PollError::Link(LinkError::StuckCommandMode { zone: 3 })
        ));
        let t = poller.link().transport();
        assert_eq!(t.count(EXIT_COMMAND_MODE), 3);
        assert_eq!(t.count("poll=3\r\n"), 4);
        assert_eq!(poller.link().state(), LinkState::StuckCommandMode);
    }
}
