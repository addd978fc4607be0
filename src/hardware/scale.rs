//! Serial precision scale driver
//!
//! The scale streams (or answers with) ASCII lines such as `ST,GS,-  191.58g`.
//! The first number on a line is the weight; a sign may be separated from the
//! digits by spaces. Lines without a number are skipped.

use crate::config::HardwareConfig;
use crate::hardware::capabilities::{PortError, SensorPort};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::FutureExt;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace};

static WEIGHT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"([-+]?)\s*(\d+\.?\d*)").expect("weight pattern is valid")
});

/// Extract the weight in grams from one scale line.
#[must_use]
pub fn parse_weight(line: &str) -> Option<f64> {
    let caps = WEIGHT_PATTERN.captures(line)?;
    let sign = caps.get(1).map_or("", |m| m.as_str());
    let digits = caps.get(2)?.as_str();
    format!("{sign}{digits}").parse().ok()
}

/// Scale on a line-oriented byte stream.
///
/// Every sampling window starts by discarding complete lines that queued up
/// since the last one, so a streaming scale is read at its current load. Bytes
/// are framed into lines in a buffer that outlives a single read, which keeps
/// a read cancelled mid-line from losing or splitting that line.
pub struct SerialScale<S> {
    stream: Mutex<LineStream<S>>,
    request: Option<String>,
    line_ending: &'static str,
}

struct LineStream<S> {
    port: S,
    buffer: BytesMut,
}

impl<S> LineStream<S>
where
    S: AsyncRead + Unpin,
{
    /// Pull whatever the port already holds without waiting, then drop every
    /// complete line. A trailing partial line is the reading in transit and
    /// stays.
    fn discard_queued(&mut self) -> Result<usize, PortError> {
        loop {
            match self.port.read_buf(&mut self.buffer).now_or_never() {
                Some(Ok(0)) => {
                    return Err(PortError::Disconnected("scale stream closed".to_string()))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(PortError::Failed(format!("scale read: {e}"))),
                None => break,
            }
        }
        let stale = self
            .buffer
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |pos| pos + 1);
        self.buffer.advance(stale);
        Ok(stale)
    }

    async fn next_line(&mut self) -> Result<String, PortError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line = self.buffer.split_to(pos + 1);
                return Ok(String::from_utf8_lossy(&line).trim().to_string());
            }
            let read = self
                .port
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| PortError::Failed(format!("scale read: {e}")))?;
            if read == 0 {
                return Err(PortError::Disconnected("scale stream closed".to_string()));
            }
        }
    }
}

impl<S> SerialScale<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(port: S, request: Option<String>) -> Self {
        Self {
            stream: Mutex::new(LineStream {
                port,
                buffer: BytesMut::with_capacity(256),
            }),
            request,
            line_ending: "\r\n",
        }
    }

    async fn read_once(&self) -> Result<f64, PortError> {
        let mut stream = self.stream.lock().await;
        let stale = stream.discard_queued()?;
        if stale > 0 {
            debug!(bytes = stale, "discarded queued scale output");
        }

        if let Some(request) = &self.request {
            let raw = format!("{request}{}", self.line_ending);
            stream
                .port
                .write_all(raw.as_bytes())
                .await
                .map_err(|e| PortError::Failed(format!("scale request: {e}")))?;
            stream
                .port
                .flush()
                .await
                .map_err(|e| PortError::Failed(format!("scale request: {e}")))?;
        }

        loop {
            let line = stream.next_line().await?;
            if line.is_empty() {
                continue;
            }
            match parse_weight(&line) {
                Some(grams) => {
                    trace!(line = %line, grams, "scale reading");
                    return Ok(grams);
                }
                None => debug!(line = %line, "ignoring non-numeric scale line"),
            }
        }
    }
}

#[cfg(feature = "tokio_serial")]
impl SerialScale<tokio_serial::SerialStream> {
    /// Open the scale serial port from configuration.
    pub fn open(config: &HardwareConfig) -> anyhow::Result<Self> {
        use anyhow::Context;
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(&config.scale_port, config.scale_baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| {
                format!(
                    "Failed to open scale port '{}' at {} baud",
                    config.scale_port, config.scale_baud_rate
                )
            })?;
        Ok(Self::new(port, config.scale_request.clone()))
    }
}

impl<S> SerialScale<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Same as `new`, taking the request command from configuration.
    pub fn from_config(port: S, config: &HardwareConfig) -> Self {
        Self::new(port, config.scale_request.clone())
    }
}

#[async_trait]
impl<S> SensorPort for SerialScale<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_weight(&self, timeout: Duration) -> Result<f64, PortError> {
        tokio::time::timeout(timeout, self.read_once())
            .await
            .map_err(|_| PortError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
    use tokio::task::JoinHandle;

    /// Write `bytes` from the scale side once the read has started.
    fn send_later(mut scale_side: DuplexStream, bytes: &'static [u8]) -> JoinHandle<DuplexStream> {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            scale_side.write_all(bytes).await.unwrap();
            scale_side
        })
    }

    #[test]
    fn test_parse_weight_variants() {
        assert_eq!(parse_weight("72.35"), Some(72.35));
        assert_eq!(parse_weight("SIM:72.35"), Some(72.35));
        assert_eq!(parse_weight("ST,GS,-  191.58g"), Some(-191.58));
        assert_eq!(parse_weight("+ 12.4 g"), Some(12.4));
        assert_eq!(parse_weight("W 12"), Some(12.0));
        assert_eq!(parse_weight("OL"), None);
        assert_eq!(parse_weight(""), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_first_numeric_line() {
        let (ours, theirs) = tokio::io::duplex(256);
        let scale = SerialScale::new(ours, None);
        let device = send_later(theirs, b"\r\nOL\r\nST,GS,  12.40g\r\n");

        let grams = scale.read_weight(Duration::from_secs(1)).await.unwrap();
        assert!((grams - 12.4).abs() < 1e-9);
        device.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_readings_queued_before_window_are_discarded() {
        let (ours, mut theirs) = tokio::io::duplex(256);
        let scale = SerialScale::new(ours, None);
        // empty pan streamed while the belt was still loading
        theirs.write_all(b"0.00\r\n0.00\r\n0.00\r\n").await.unwrap();
        let device = send_later(theirs, b"12.40\r\n12.40\r\n");

        let grams = scale.read_weight(Duration::from_secs(1)).await.unwrap();
        assert!((grams - 12.4).abs() < 1e-9, "read queued weight {grams}");
        device.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_line_in_transit_is_not_split() {
        let (ours, mut theirs) = tokio::io::duplex(256);
        let scale = SerialScale::new(ours, None);
        theirs.write_all(b"0.00\r\n12.").await.unwrap();
        let device = send_later(theirs, b"40\r\n");

        let grams = scale.read_weight(Duration::from_secs(1)).await.unwrap();
        assert!((grams - 12.4).abs() < 1e-9, "read torn line as {grams}");
        device.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_read_keeps_partial_line() {
        let (ours, mut theirs) = tokio::io::duplex(256);
        let scale = SerialScale::new(ours, None);
        theirs.write_all(b"12.").await.unwrap();

        let result = scale.read_weight(Duration::from_millis(50)).await;
        assert_eq!(result, Err(PortError::Timeout));

        let device = send_later(theirs, b"40\r\n");
        let grams = scale.read_weight(Duration::from_secs(1)).await.unwrap();
        assert!((grams - 12.4).abs() < 1e-9, "read torn line as {grams}");
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_sends_request_command() {
        let (ours, mut theirs) = tokio::io::duplex(256);
        theirs.write_all(b"0.00\r\n").await.unwrap();
        let scale = SerialScale::new(ours, Some("P".to_string()));
        let (read_half, mut write_half) = tokio::io::split(theirs);

        let device = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            let request = lines.next_line().await.unwrap().unwrap();
            write_half.write_all(b"8.01\r\n").await.unwrap();
            request
        });

        let grams = scale.read_weight(Duration::from_secs(1)).await.unwrap();
        assert!((grams - 8.01).abs() < 1e-9);
        assert_eq!(device.await.unwrap(), "P");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_scale_times_out() {
        let (ours, _theirs) = tokio::io::duplex(256);
        let scale = SerialScale::new(ours, None);
        let result = scale.read_weight(Duration::from_millis(300)).await;
        assert_eq!(result, Err(PortError::Timeout));
    }

    #[tokio::test]
    async fn test_closed_stream_is_disconnect() {
        let (ours, theirs) = tokio::io::duplex(256);
        drop(theirs);
        let scale = SerialScale::new(ours, None);
        let result = scale.read_weight(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PortError::Disconnected(_))));
    }
}
