//! Hardware transport on a real serial port. The `serialport` API is
//! blocking, so every call runs on the blocking pool.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use serialport::SerialPort;
use tokio::task::spawn_blocking;
use tracing::info;

use super::Transport;

/// Port-level read timeout. Kept short so the link manager's own deadlines
/// stay accurate.
const READ_SLICE: Duration = Duration::from_millis(100);

pub struct SerialTransport {
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(READ_SLICE)
            .open()
            .with_context(|| format!("failed to open serial port {path} @ {baud_rate} baud"))?;
        info!(port = path, baud_rate, "serial port open");
        Ok(Self {
            port: Arc::new(Mutex::new(port)),
        })
    }
}

fn lock(port: &Mutex<Box<dyn SerialPort>>) -> io::Result<MutexGuard<'_, Box<dyn SerialPort>>> {
    port.lock()
        .map_err(|_| io::Error::other("serial port lock poisoned"))
}

impl Transport for SerialTransport {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let port = Arc::clone(&self.port);
        let data = bytes.to_vec();
        spawn_blocking(move || -> io::Result<usize> {
            let mut port = lock(&port)?;
            let n = port.write(&data)?;
            port.flush()?;
            Ok(n)
        })
        .await
        .map_err(io::Error::other)?
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let port = Arc::clone(&self.port);
        let len = buf.len();
        let chunk = spawn_blocking(move || -> io::Result<Vec<u8>> {
            let mut port = lock(&port)?;
            let mut tmp = vec![0u8; len];
            match port.read(&mut tmp) {
                Ok(n) => {
                    tmp.truncate(n);
                    Ok(tmp)
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(Vec::new()),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(io::Error::other)??;

        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }
}
