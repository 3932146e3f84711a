//! Quadrature encoder counter driver.
//!
//! The counter box reports the carriage position as a signed integer count
//! over a plain serial byte protocol:
//! - Baud: 9600, 8N1, RTS/CTS flow control
//! - `v`   -> identification string
//! - `B26` -> configure quadrature mode (sent once at init)
//! - `?`   -> one count readout, terminated CRLF
//! - `T1` / `T0` -> start/stop continuous transmission, one count per line
//!
//! Counts are converted to positions elsewhere (see
//! [`crate::scan::calibration`]); this driver never interprets them.

use crate::hardware::capabilities::{CountReadout, Streamable};
use crate::scan::sample::Payload;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Driver for the encoder counter box.
pub struct EncoderCounter {
    /// Serial port protected by Mutex for exclusive access
    port: Mutex<BufReader<SerialStream>>,
    /// Per-read timeout duration
    timeout: Duration,
}

impl EncoderCounter {
    /// Open the counter's serial port.
    pub fn connect(port_path: &str, baud: u32) -> Result<Self> {
        let port = tokio_serial::new(port_path, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::Hardware)
            .open_native_async()
            .context("Failed to open encoder serial port")?;

        Ok(Self {
            port: Mutex::new(BufReader::new(port)),
            timeout: Duration::from_millis(200),
        })
    }

    /// Configure quadrature mode. Call once after connecting.
    pub async fn init(&self) -> Result<()> {
        let mut port = self.port.lock().await;
        port.get_mut()
            .write_all(b"B26\r")
            .await
            .context("Encoder init write failed")?;
        Ok(())
    }

    /// Query the device identification string.
    pub async fn identify(&self) -> Result<String> {
        let line = self.query(b"v").await?;
        Ok(line)
    }

    /// Write one command byte sequence and read one reply line.
    async fn query(&self, command: &[u8]) -> Result<String> {
        let mut port = self.port.lock().await;

        port.get_mut()
            .write_all(command)
            .await
            .context("Encoder write failed")?;

        let mut line = String::new();
        tokio::time::timeout(self.timeout, port.read_line(&mut line))
            .await
            .context("Encoder read timeout")?
            .context("Encoder read error")?;

        Ok(line.trim().to_string())
    }

    /// Read one line in transmission mode without sending anything.
    async fn read_streamed_line(&self) -> Result<String> {
        let mut port = self.port.lock().await;

        let mut line = String::new();
        tokio::time::timeout(self.timeout, port.read_line(&mut line))
            .await
            .context("Encoder stream read timeout")?
            .context("Encoder stream read error")?;

        Ok(line.trim().to_string())
    }
}

#[async_trait]
impl CountReadout for EncoderCounter {
    async fn read_count(&self) -> Result<i64> {
        let line = self.query(b"?").await?;
        line.parse()
            .with_context(|| format!("Malformed count readout '{line}'"))
    }
}

#[async_trait]
impl Streamable for EncoderCounter {
    async fn start_stream(&self) -> Result<()> {
        let mut port = self.port.lock().await;
        port.get_mut()
            .write_all(b"T1\r")
            .await
            .context("Encoder start_transmission failed")?;
        Ok(())
    }

    async fn stop_stream(&self) -> Result<()> {
        let mut port = self.port.lock().await;
        port.get_mut()
            .write_all(b"T0\r")
            .await
            .context("Encoder stop_transmission failed")?;
        Ok(())
    }

    async fn read_sample(&self) -> Result<Payload> {
        let line = self.read_streamed_line().await?;
        let count: i64 = line
            .parse()
            .with_context(|| format!("Malformed streamed count '{line}'"))?;
        Ok(Payload::RawCount(count))
    }
}
