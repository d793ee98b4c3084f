//! Outbound connections to the hub.
//!
//! The instrument box always dials the hub. A [`Connector`] produces a byte
//! stream; TLS, when used, is layered inside the connector and is invisible
//! to the channels.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::config::Timing;
use crate::events::Shutdown;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("peer closed the connection")]
    Closed,

    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
}

pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let addr = self.addr.clone();
        async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        }
    }

    fn describe(&self) -> String {
        self.addr.clone()
    }
}

/// Exponential reconnect delay, doubling up to a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn from_timing(timing: &Timing) -> Self {
        Self::new(
            Duration::from_millis(timing.reconnect_initial_ms),
            Duration::from_millis(timing.reconnect_max_ms),
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Dial until connected or shut down. `None` means shutdown was requested.
pub async fn connect_with_backoff<C: Connector>(
    connector: &C,
    backoff: &mut Backoff,
    shutdown: &Shutdown,
    name: &str,
) -> Option<C::Stream> {
    let mut attempts: u32 = 0;
    loop {
        if shutdown.is_triggered() {
            return None;
        }
        attempts += 1;

        let result = tokio::select! {
            r = tokio::time::timeout(CONNECT_TIMEOUT, connector.connect()) => r,
            _ = shutdown.wait() => return None,
        };
        match result {
            Ok(Ok(stream)) => {
                info!("{} link connected to {} after {} attempt(s)", name, connector.describe(), attempts);
                backoff.reset();
                return Some(stream);
            }
            Ok(Err(e)) => warn!("{} link to {} failed: {}", name, connector.describe(), e),
            Err(_) => warn!("{} link to {} timed out", name, connector.describe()),
        }

        if shutdown.wait_timeout(backoff.next_delay()).await {
            return None;
        }
    }
}

pub async fn write_with_timeout<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
    timeout: Duration,
) -> Result<(), LinkError> {
    match tokio::time::timeout(timeout, writer.write_all(bytes)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(LinkError::WriteTimeout(timeout)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Text(Vec<u8>),
    /// A line longer than the limit; its bytes were discarded as they arrived.
    Oversized(usize),
}

/// Newline-delimited reader that never holds more than `max_len` bytes of
/// one line.
///
/// `next_line` is cancel safe: state only changes between a completed
/// `fill_buf` and the next await, so it can sit in a `select!` arm.
pub struct LineReader<R> {
    reader: R,
    partial: Vec<u8>,
    max_len: usize,
    overflow: Option<usize>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_len: usize) -> Self {
        Self {
            reader,
            partial: Vec::new(),
            max_len,
            overflow: None,
        }
    }

    /// Next complete line without its newline, or `None` at end of stream.
    /// A trailing unterminated line is dropped.
    pub async fn next_line(&mut self) -> io::Result<Option<Line>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(None);
            }
            let newline = available.iter().position(|&b| b == b'\n');
            let chunk_len = newline.unwrap_or(available.len());

            match self.overflow.as_mut() {
                Some(dropped) => *dropped += chunk_len,
                None if self.partial.len() + chunk_len > self.max_len => {
                    self.overflow = Some(self.partial.len() + chunk_len);
                    self.partial = Vec::new();
                }
                None => self.partial.extend_from_slice(&available[..chunk_len]),
            }

            match newline {
                Some(_) => {
                    self.reader.consume(chunk_len + 1);
                    let line = match self.overflow.take() {
                        Some(len) => Line::Oversized(len),
                        None => Line::Text(std::mem::take(&mut self.partial)),
                    };
                    return Ok(Some(line));
                }
                None => self.reader.consume(chunk_len),
            }
        }
    }
}

/// Connection state of both hub links, shared so either channel can hold
/// the motor safe when the other is down.
#[derive(Debug, Default)]
pub struct LinkStatus {
    control: AtomicBool,
    telemetry: AtomicBool,
}

impl LinkStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_control(&self, up: bool) {
        self.control.store(up, Ordering::Release);
    }

    pub fn set_telemetry(&self, up: bool) {
        self.telemetry.store(up, Ordering::Release);
    }

    pub fn control_up(&self) -> bool {
        self.control.load(Ordering::Acquire)
    }

    pub fn telemetry_up(&self) -> bool {
        self.telemetry.load(Ordering::Acquire)
    }
}
