//! Toptica terahertz frequency source driver.
//!
//! The controller exposes a scheme-flavoured line protocol over TCP:
//! - `(param-ref 'name)` reads a parameter
//! - `(param-set! 'name value)` writes a parameter
//! - `(exec 'name)` runs a command
//!
//! One reply line per request. The parameters used here are the emission
//! frequency (`frequency:frequency-set` / `frequency:frequency-act`, GHz)
//! and the internal lock-in (`lockin:*`), whose value reads back as
//! `(photocurrent valid)` in nA.
//!
//! The per-sample sequence in [`Streamable::read_sample`] mirrors how the
//! instrument is meant to be polled: reset the lock-in, wait one
//! integration time, then read the settled value and the actual frequency.

use crate::hardware::capabilities::Streamable;
use crate::scan::sample::{FrequencyReading, Payload};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Lock-in configuration applied when a stream starts.
#[derive(Clone, Copy, Debug)]
pub struct LockinSetup {
    /// Modulation frequency, in Hz
    pub frequency_hz: f64,
    /// Integration time, in ms
    pub integration_time_ms: f64,
    /// Amplifier gain, in V/A
    pub amplifier_gain: f64,
    /// Demodulation phase, in degrees
    pub phase_deg: f64,
}

/// Driver for the Toptica frequency source.
pub struct TopticaDlc {
    stream: Mutex<BufReader<TcpStream>>,
    timeout: Duration,
    emission_ghz: f64,
    lockin: LockinSetup,
    /// Settling time after a frequency change, for the photomixers
    stabilize: Duration,
}

impl TopticaDlc {
    /// Connect to the controller.
    pub async fn connect(
        host: &str,
        port: u16,
        emission_ghz: f64,
        lockin: LockinSetup,
    ) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("Failed to connect to Toptica at {host}:{port}"))?;

        Ok(Self {
            stream: Mutex::new(BufReader::new(stream)),
            timeout: Duration::from_secs(3),
            emission_ghz,
            lockin,
            stabilize: Duration::from_secs(5),
        })
    }

    /// Override the post-tune stabilization delay.
    pub fn with_stabilize(mut self, stabilize: Duration) -> Self {
        self.stabilize = stabilize;
        self
    }

    /// Set the emission frequency, in GHz.
    pub async fn set_frequency_ghz(&self, frequency_ghz: f64) -> Result<()> {
        self.request(&format!(
            "(param-set! 'frequency:frequency-set {frequency_ghz})"
        ))
        .await?;
        Ok(())
    }

    /// Read the actual emission frequency, in GHz.
    pub async fn frequency_ghz(&self) -> Result<f64> {
        let reply = self.request("(param-ref 'frequency:frequency-act)").await?;
        reply
            .trim()
            .parse()
            .with_context(|| format!("Malformed frequency reply '{reply}'"))
    }

    /// Configure the internal lock-in.
    pub async fn setup_lockin(&self, setup: LockinSetup) -> Result<()> {
        self.request(&format!(
            "(param-set! 'lockin:frequency {})",
            setup.frequency_hz
        ))
        .await?;
        self.request(&format!(
            "(param-set! 'lockin:integration-time {})",
            setup.integration_time_ms
        ))
        .await?;
        self.request(&format!(
            "(param-set! 'lockin:amplifier-gain {})",
            setup.amplifier_gain
        ))
        .await?;
        self.request(&format!("(param-set! 'lockin:phase {})", setup.phase_deg))
            .await?;
        Ok(())
    }

    /// Reset the lock-in accumulator.
    pub async fn reset_lockin(&self) -> Result<()> {
        self.request("(exec 'lockin:lock-in-reset)").await?;
        Ok(())
    }

    /// Read the lock-in value as (photocurrent in nA, settled flag).
    pub async fn lockin_value(&self) -> Result<(f64, bool)> {
        let reply = self.request("(param-ref 'lockin:lock-in-value)").await?;
        parse_lockin_value(&reply)
    }

    /// Send one request line and read one reply line.
    async fn request(&self, line: &str) -> Result<String> {
        let mut stream = self.stream.lock().await;

        let framed = format!("{line}\n");
        stream
            .get_mut()
            .write_all(framed.as_bytes())
            .await
            .context("Toptica write failed")?;

        let mut reply = String::new();
        tokio::time::timeout(self.timeout, stream.read_line(&mut reply))
            .await
            .context("Toptica read timeout")?
            .context("Toptica read error")?;

        Ok(reply.trim().to_string())
    }
}

fn parse_lockin_value(reply: &str) -> Result<(f64, bool)> {
    let inner = reply.trim().trim_start_matches('(').trim_end_matches(')');
    let mut parts = inner.split_whitespace();
    let (Some(value), Some(flag)) = (parts.next(), parts.next()) else {
        bail!("Malformed lock-in value reply '{reply}'");
    };
    let value: f64 = value
        .parse()
        .with_context(|| format!("Malformed lock-in value '{value}'"))?;
    let valid = match flag {
        "#t" => true,
        "#f" => false,
        other => bail!("Malformed lock-in settled flag '{other}'"),
    };
    Ok((value, valid))
}

#[async_trait]
impl Streamable for TopticaDlc {
    async fn start_stream(&self) -> Result<()> {
        self.set_frequency_ghz(self.emission_ghz).await?;
        // Give the photomixers time to stabilize after tuning
        tokio::time::sleep(self.stabilize).await;
        self.setup_lockin(self.lockin).await
    }

    async fn stop_stream(&self) -> Result<()> {
        Ok(())
    }

    async fn read_sample(&self) -> Result<Payload> {
        self.reset_lockin().await?;
        tokio::time::sleep(Duration::from_secs_f64(
            self.lockin.integration_time_ms / 1000.0,
        ))
        .await;
        let (photocurrent_na, valid) = self.lockin_value().await?;
        let frequency_ghz = self.frequency_ghz().await?;
        Ok(Payload::Frequency(FrequencyReading {
            frequency_ghz,
            photocurrent_na,
            valid,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lockin_value_replies() {
        assert_eq!(parse_lockin_value("(42.5 #t)").unwrap(), (42.5, true));
        assert_eq!(parse_lockin_value("(-0.8 #f)").unwrap(), (-0.8, false));
        assert!(parse_lockin_value("()").is_err());
        assert!(parse_lockin_value("(1.0 yes)").is_err());
    }
}
