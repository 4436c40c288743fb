//! Scripted in-memory transport for link, poller, and orchestrator tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;

use super::Transport;
use crate::config::ZoneId;

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// Records every write and answers through a responder closure. Replies are
/// queued and handed out by `read` as soon as they are requested.
pub(crate) struct ScriptedTransport {
    pub writes: Vec<String>,
    pending: VecDeque<u8>,
    responder: Responder,
    short_writes: bool,
}

impl ScriptedTransport {
    pub fn new(responder: impl FnMut(&str) -> Option<String> + Send + 'static) -> Self {
        Self {
            writes: Vec::new(),
            pending: VecDeque::new(),
            responder: Box::new(responder),
            short_writes: false,
        }
    }

    pub fn silent() -> Self {
        Self::new(|_| None)
    }

    /// A radio plus zone units: `frames` holds the poll reply per zone,
    /// zones in `stuck` answer every poll with the command-mode prompt.
    pub fn radio(frames: HashMap<ZoneId, String>, stuck: HashSet<ZoneId>) -> Self {
        let mut connected: Option<ZoneId> = None;
        Self::new(move |line| {
            if let Some(id) = line.strip_prefix('c').and_then(|rest| rest.trim().parse().ok()) {
                connected = Some(id);
                return None;
            }
            if line.starts_with("poll=") {
                let zone = connected?;
                if stuck.contains(&zone) {
                    return Some("CMD> ?\r\n".to_string());
                }
                return frames.get(&zone).map(|f| format!("{f}\r\n"));
            }
            None
        })
    }

    pub fn with_short_writes(mut self) -> Self {
        self.short_writes = true;
        self
    }

    pub fn count(&self, line: &str) -> usize {
        self.writes.iter().filter(|w| *w == line).count()
    }
}

impl Transport for ScriptedTransport {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let line = String::from_utf8_lossy(bytes).into_owned();
        if let Some(reply) = (self.responder)(&line) {
            self.pending.extend(reply.bytes());
        }
        self.writes.push(line);
        if self.short_writes {
            Ok(bytes.len().saturating_sub(1))
        } else {
            Ok(bytes.len())
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}
