//! SRS SR865A lock-in amplifier driver, via a Prologix GPIB-USB adapter.
//!
//! Reference: SR865A Operation Manual; Prologix GPIB-USB Controller Manual
//!
//! Protocol Overview:
//! - The Prologix adapter is a serial device (115200 baud); `++`-prefixed
//!   lines configure the adapter, everything else is forwarded over GPIB.
//! - `++addr N` selects the instrument, `++auto 1` makes the adapter read
//!   back a response after every forwarded query.
//! - `SNAPD?` returns one simultaneous X, Y, R, Theta snapshot as four
//!   comma-separated floats.

use crate::hardware::capabilities::Streamable;
use crate::scan::sample::{Payload, Quadrature};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Driver for an SR865A behind a Prologix GPIB-USB controller.
pub struct Sr865Lockin {
    /// Serial port of the Prologix adapter
    port: Mutex<BufReader<SerialStream>>,
    /// GPIB address of the SR865A
    gpib_address: u8,
    /// Per-query timeout duration
    timeout: Duration,
}

impl Sr865Lockin {
    /// Open the Prologix adapter's serial port.
    pub fn connect(port_path: &str, gpib_address: u8) -> Result<Self> {
        let port = tokio_serial::new(port_path, 115_200)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .context("Failed to open Prologix serial port")?;

        Ok(Self {
            port: Mutex::new(BufReader::new(port)),
            gpib_address,
            timeout: Duration::from_secs(1),
        })
    }

    /// Query the instrument identification string.
    pub async fn identify(&self) -> Result<String> {
        self.query("*IDN?").await
    }

    /// Send one line without expecting a response.
    async fn send(&self, line: &str) -> Result<()> {
        let mut port = self.port.lock().await;
        let framed = format!("{line}\n");
        port.get_mut()
            .write_all(framed.as_bytes())
            .await
            .context("Prologix write failed")?;
        Ok(())
    }

    /// Forward a query over GPIB and read one response line.
    async fn query(&self, command: &str) -> Result<String> {
        let mut port = self.port.lock().await;

        let framed = format!("{command}\n");
        port.get_mut()
            .write_all(framed.as_bytes())
            .await
            .context("Prologix write failed")?;

        let mut line = String::new();
        tokio::time::timeout(self.timeout, port.read_line(&mut line))
            .await
            .context("Lock-in read timeout")?
            .context("Lock-in read error")?;

        Ok(line.trim().to_string())
    }
}

fn parse_snap(line: &str) -> Result<Quadrature> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 4 {
        bail!("Malformed SNAPD? response '{line}'");
    }
    let mut values = [0.0f64; 4];
    for (slot, field) in values.iter_mut().zip(&fields) {
        *slot = field
            .parse()
            .with_context(|| format!("Malformed SNAPD? field '{field}'"))?;
    }
    Ok(Quadrature {
        x: values[0],
        y: values[1],
        r: values[2],
        theta: values[3],
    })
}

#[async_trait]
impl Streamable for Sr865Lockin {
    async fn start_stream(&self) -> Result<()> {
        // Controller mode, auto-read after queries, select the instrument
        self.send("++mode 1").await?;
        self.send("++auto 1").await?;
        self.send(&format!("++addr {}", self.gpib_address)).await?;
        Ok(())
    }

    async fn stop_stream(&self) -> Result<()> {
        // Return the instrument front panel to local control
        self.send("++loc").await
    }

    async fn read_sample(&self) -> Result<Payload> {
        let line = self.query("SNAPD?").await?;
        Ok(Payload::Quadrature(parse_snap(&line)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_snap_responses() {
        let q = parse_snap("1.25e-3, -4.5e-4, 1.33e-3, -19.8").unwrap();
        assert_eq!(q.x, 1.25e-3);
        assert_eq!(q.y, -4.5e-4);
        assert_eq!(q.r, 1.33e-3);
        assert_eq!(q.theta, -19.8);

        assert!(parse_snap("1.0,2.0,3.0").is_err());
        assert!(parse_snap("a,b,c,d").is_err());
    }
}
