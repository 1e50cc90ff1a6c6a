//! Real mux/stage controller PCB driver.
//!
//! Talks to the controller over a line-oriented TCP socket. The wire protocol
//! is ASCII, `\r\n`-terminated, and every response - success or failure -
//! ends with the literal prompt sentinel `">>> "`. A query/response round
//! trip reads until that sentinel and strips it before returning the
//! payload, mirroring the reference Telnet client's `read_response`.
//!
//! Canonical commands (see §4.4):
//! - `s<substrate><pixel>` select a pixel, `s` with no args deselects all
//! - `b` emergency stop
//! - `iv` / `eqe` switch the experiment relay
//! - `h<ax>` home an axis, `g<ax><steps>` goto, `j<ax><dir>` jog,
//!   `r<ax>` read position, `l<ax>` read axis length
//!
//! Failed selects are retried with recovery: reprobe connected muxes, issue
//! a deselect-all, then retry the original select once more before
//! surfacing [`DaqError::InstrumentComms`].

use crate::error::DaqError;
use crate::hardware::capabilities::{Motion, MuxController};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const PROMPT: &str = ">>> ";
const WRITE_TERMINATOR: &str = "\r\n";

/// Real controller PCB driver over a TCP socket.
pub struct PcbDriver {
    stream: Mutex<TcpStream>,
    comms_timeout: Duration,
    axis_count: usize,
}

impl PcbDriver {
    /// Connect to `address` (`host:port`) and consume the welcome banner.
    pub async fn connect(address: &str, axis_count: usize) -> Result<Self, DaqError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| DaqError::InstrumentComms(format!("connecting to {address}: {e}")))?;
        let driver = Self { stream: Mutex::new(stream), comms_timeout: Duration::from_secs(5), axis_count };
        driver.read_until_prompt().await?;
        Ok(driver)
    }

    async fn read_until_prompt(&self) -> Result<String, DaqError> {
        let mut stream = self.stream.lock().await;
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        let deadline = tokio::time::Instant::now() + self.comms_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(DaqError::InstrumentComms("timed out waiting for prompt".into()));
            }
            let n = tokio::time::timeout(remaining, stream.read(&mut chunk))
                .await
                .map_err(|_| DaqError::InstrumentComms("timed out waiting for prompt".into()))?
                .map_err(|e| DaqError::InstrumentComms(format!("read error: {e}")))?;
            if n == 0 {
                return Err(DaqError::InstrumentComms("connection closed before prompt".into()));
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Ok(text) = std::str::from_utf8(&buf) {
                if let Some(stripped) = text.strip_suffix(PROMPT) {
                    return Ok(stripped.trim_end_matches("\r\n").to_string());
                }
            }
        }
    }

    async fn write_cmd(&self, cmd: &str) -> Result<(), DaqError> {
        let mut line = cmd.to_string();
        if !line.ends_with(WRITE_TERMINATOR) {
            line.push_str(WRITE_TERMINATOR);
        }
        let mut stream = self.stream.lock().await;
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DaqError::InstrumentComms(format!("write error: {e}")))?;
        drop(stream);
        Ok(())
    }

    async fn query_nocheck(&self, cmd: &str) -> Result<String, DaqError> {
        self.write_cmd(cmd).await?;
        self.read_until_prompt().await
    }

    /// One attempt at selecting `mux_string`, no recovery.
    async fn select_attempt(&self, mux_string: &str) -> Result<(), DaqError> {
        let response = self.query_nocheck(mux_string).await?;
        if response.trim().is_empty() {
            Ok(())
        } else {
            Err(DaqError::InstrumentComms(format!(
                "mux select '{mux_string}' returned unexpected ack: {response:?}"
            )))
        }
    }
}

#[async_trait]
impl MuxController for PcbDriver {
    async fn query(&self, cmd: &str) -> Result<String, anyhow::Error> {
        Ok(self.query_nocheck(cmd).await?)
    }

    async fn select(&self, mux_string: &str) -> Result<(), anyhow::Error> {
        if self.select_attempt(mux_string).await.is_ok() {
            return Ok(());
        }
        // Recovery: reprobe, deselect-all, retry once.
        let _ = self.query_nocheck("c").await;
        let _ = self.query_nocheck("s").await;
        self.select_attempt(mux_string).await?;
        Ok(())
    }

    async fn deselect_all(&self) -> Result<(), anyhow::Error> {
        self.query_nocheck("s").await?;
        Ok(())
    }

    async fn emergency_stop(&self) -> Result<(), anyhow::Error> {
        self.query_nocheck("b").await?;
        Ok(())
    }

    async fn set_experiment_relay(&self, experiment: &str) -> Result<(), anyhow::Error> {
        self.query_nocheck(experiment).await?;
        Ok(())
    }
}

#[async_trait]
impl Motion for PcbDriver {
    async fn connect(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn home(&self) -> Result<Vec<f64>, anyhow::Error> {
        let mut lengths = Vec::with_capacity(self.axis_count);
        for ax in 0..self.axis_count {
            self.query_nocheck(&format!("h{ax}")).await?;
            let resp = self.query_nocheck(&format!("l{ax}")).await?;
            let length: f64 = resp
                .trim()
                .parse()
                .map_err(|_| DaqError::Motion(format!("bad length response for axis {ax}: {resp:?}")))?;
            lengths.push(length);
        }
        Ok(lengths)
    }

    async fn goto(&self, positions_mm: &[f64]) -> Result<(), anyhow::Error> {
        if positions_mm.len() != self.axis_count {
            return Err(DaqError::Motion(format!(
                "axis count mismatch: stage has {} axes, goto gave {}",
                self.axis_count,
                positions_mm.len()
            ))
            .into());
        }
        for (ax, pos) in positions_mm.iter().enumerate() {
            self.query_nocheck(&format!("g{ax}{pos}")).await?;
        }
        Ok(())
    }

    async fn get_position(&self) -> Result<Vec<f64>, anyhow::Error> {
        let mut positions = Vec::with_capacity(self.axis_count);
        for ax in 0..self.axis_count {
            let resp = self.query_nocheck(&format!("r{ax}")).await?;
            let pos: f64 = resp
                .trim()
                .parse()
                .map_err(|_| DaqError::Motion(format!("bad position response for axis {ax}: {resp:?}")))?;
            positions.push(pos);
        }
        Ok(positions)
    }
}
