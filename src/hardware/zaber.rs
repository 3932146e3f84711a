//! Zaber linear stage driver (mirror carriage).
//!
//! Reference: Zaber ASCII Protocol Manual
//!
//! Protocol Overview:
//! - Format: ASCII command/response over RS-232
//! - Baud: 115200, 8N1
//! - Commands: `/{device} {axis} {command}\n`
//! - Replies: `@{device} {axis} {flag} {status} {warning} {data}\n`
//! - Example: `/1 1 move abs 209974` -> `@01 1 OK BUSY -- 0`
//!
//! Positions on the wire are in microsteps; this driver converts from the
//! working millimetre unit at the boundary.

use crate::hardware::capabilities::Movable;
use crate::hardware::{length_to_mm, velocity_to_mm_s};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Default microstep size of the carriage stage, in mm.
const MICROSTEP_MM: f64 = 4.7625e-5;

/// Zaber velocity data is in microsteps/s scaled by 1.6384.
const VELOCITY_SCALE: f64 = 1.6384;

/// One parsed reply frame.
struct Reply {
    busy: bool,
    data: String,
}

/// Driver for a single-axis Zaber linear stage.
pub struct ZaberStage {
    /// Serial port protected by Mutex for exclusive access
    port: Mutex<BufReader<SerialStream>>,
    device: u8,
    axis: u8,
    /// Command timeout duration
    timeout: Duration,
    /// Travel limits in mm, cached by `init`
    limits_mm: StdMutex<(f64, f64)>,
    /// Maximum speed in mm/s, cached by `init`
    maxspeed_mm_s: StdMutex<f64>,
}

impl ZaberStage {
    /// Open the serial port for a stage at the given device/axis address.
    ///
    /// Call [`ZaberStage::init`] afterwards to cache the travel limits and
    /// speed ceiling before issuing motion commands.
    pub fn connect(port_path: &str, device: u8, axis: u8) -> Result<Self> {
        let port = tokio_serial::new(port_path, 115_200)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .context("Failed to open Zaber serial port")?;

        Ok(Self {
            port: Mutex::new(BufReader::new(port)),
            device,
            axis,
            timeout: Duration::from_secs(2),
            limits_mm: StdMutex::new((0.0, 0.0)),
            maxspeed_mm_s: StdMutex::new(0.0),
        })
    }

    /// Query and cache the travel limits and maximum speed.
    pub async fn init(&self) -> Result<()> {
        let min = self.get_setting("limit.min").await? * MICROSTEP_MM;
        let max = self.get_setting("limit.max").await? * MICROSTEP_MM;
        let maxspeed = self.get_setting("maxspeed").await? / VELOCITY_SCALE * MICROSTEP_MM;
        *self.limits_mm.lock().unwrap() = (min, max);
        *self.maxspeed_mm_s.lock().unwrap() = maxspeed;
        tracing::info!(min_mm = min, max_mm = max, maxspeed_mm_s = maxspeed, "Zaber stage ready");
        Ok(())
    }

    /// Home the axis to establish its reference position.
    pub async fn home(&self) -> Result<()> {
        self.command("home").await?;
        self.wait_settled().await
    }

    /// Position according to the stage's own step counter, in mm.
    ///
    /// Not to be used for accuracy over the encoder.
    pub async fn position(&self) -> Result<f64> {
        let reply = self.query("get pos").await?;
        let usteps: f64 = reply
            .data
            .parse()
            .with_context(|| format!("Failed to parse position '{}'", reply.data))?;
        Ok(usteps * MICROSTEP_MM)
    }

    async fn get_setting(&self, setting: &str) -> Result<f64> {
        let reply = self.query(&format!("get {setting}")).await?;
        reply
            .data
            .parse()
            .with_context(|| format!("Failed to parse setting {setting}='{}'", reply.data))
    }

    /// Send one command and parse the reply frame.
    async fn query(&self, command: &str) -> Result<Reply> {
        let mut port = self.port.lock().await;

        let frame = format!("/{} {} {}\n", self.device, self.axis, command);
        port.get_mut()
            .write_all(frame.as_bytes())
            .await
            .context("Zaber write failed")?;

        let mut line = String::new();
        tokio::time::timeout(self.timeout, port.read_line(&mut line))
            .await
            .context("Zaber read timeout")?
            .context("Zaber read error")?;

        parse_reply(line.trim())
    }

    /// Send a command, discarding the reply data.
    async fn command(&self, command: &str) -> Result<()> {
        self.query(command).await.map(|_| ())
    }

    async fn is_moving(&self) -> Result<bool> {
        // An empty command is a plain status request
        let reply = self.query("").await?;
        Ok(reply.busy)
    }
}

fn parse_reply(line: &str) -> Result<Reply> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 5 || !tokens[0].starts_with('@') {
        bail!("Malformed Zaber reply: '{line}'");
    }
    if tokens[2] != "OK" {
        bail!("Zaber rejected command: '{line}'");
    }
    Ok(Reply {
        busy: tokens[3] == "BUSY",
        data: tokens[5..].join(" "),
    })
}

#[async_trait]
impl Movable for ZaberStage {
    async fn move_abs(&self, position: f64, unit: Option<&str>) -> Result<()> {
        let mm = length_to_mm(position, unit)?;
        let usteps = (mm / MICROSTEP_MM).round() as i64;
        self.command(&format!("move abs {usteps}")).await
    }

    async fn move_velocity(&self, velocity: f64, unit: Option<&str>) -> Result<()> {
        let mm_s = velocity_to_mm_s(velocity, unit)?;
        let maxspeed = *self.maxspeed_mm_s.lock().unwrap();
        if maxspeed > 0.0 && mm_s.abs() > maxspeed {
            return Err(anyhow!(
                "Velocity {mm_s} mm/s exceeds stage maxspeed {maxspeed} mm/s"
            ));
        }
        let data = (mm_s / MICROSTEP_MM * VELOCITY_SCALE).round() as i64;
        self.command(&format!("move vel {data}")).await
    }

    async fn stop(&self) -> Result<()> {
        self.command("stop").await
    }

    async fn wait_settled(&self) -> Result<()> {
        let deadline = Duration::from_secs(60);
        let start = std::time::Instant::now();

        loop {
            if start.elapsed() > deadline {
                return Err(anyhow!("Zaber wait_settled timed out after 60 seconds"));
            }
            if !self.is_moving().await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn travel_limits(&self) -> (f64, f64) {
        *self.limits_mm.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reply_frames() {
        let reply = parse_reply("@01 1 OK IDLE -- 0").unwrap();
        assert!(!reply.busy);
        assert_eq!(reply.data, "0");

        let reply = parse_reply("@01 1 OK BUSY -- 305373").unwrap();
        assert!(reply.busy);
        assert_eq!(reply.data, "305373");

        assert!(parse_reply("@01 1 RJ IDLE -- BADCOMMAND").is_err());
        assert!(parse_reply("garbage").is_err());
    }
}
