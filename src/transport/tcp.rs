//! TCP transport for WiFi-attached nodes (Meshtastic network API, port 4403).
//!
//! The node speaks the same framed stream over TCP as over serial.

use std::io;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::radio::{self, ByteChannel, RadioLink};
use super::Connector;
use crate::config::TransportConfig;
use crate::error::ConnectError;

pub const DEFAULT_PORT: u16 = 4403;

pub struct TcpConnector {
    addr: String,
    channel: u32,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: &str, port: u16, connect_timeout: Duration) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            channel: 0,
            connect_timeout,
        }
    }

    pub fn from_config(cfg: &TransportConfig) -> Self {
        let mut connector = Self::new(
            &cfg.host,
            cfg.tcp_port,
            Duration::from_millis(cfg.connect_timeout_ms),
        );
        connector.channel = cfg.channel;
        connector
    }
}

impl Connector for TcpConnector {
    type Link = RadioLink<TcpChannel>;

    /// The configured timeout covers both the TCP connect and the handshake.
    async fn connect(&mut self) -> Result<Self::Link, ConnectError> {
        let started = Instant::now();
        debug!("Connecting to node at {}", self.addr);
        let stream = match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(&self.addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ConnectError::LinkUnavailable(format!("{}: {}", self.addr, e)))
            }
            Err(_) => return Err(ConnectError::Timeout(self.connect_timeout)),
        };
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let channel = TcpChannel {
            reader,
            writer,
            buf: vec![0u8; 1024],
        };
        let remaining = self.connect_timeout.saturating_sub(started.elapsed());
        radio::handshake(channel, self.channel, remaining).await
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

pub struct TcpChannel {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    buf: Vec<u8>,
}

impl ByteChannel for TcpChannel {
    async fn read_chunk(&mut self) -> io::Result<Vec<u8>> {
        let n = self.reader.read(&mut self.buf).await?;
        Ok(self.buf[..n].to_vec())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}
