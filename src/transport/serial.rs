//! Serial transport: Bluetooth rfcomm bindings and USB CDC ports.
//!
//! The port is opened with a short read timeout and a blocking reader thread
//! feeds bytes into a tokio channel, so `read_chunk` stays cancel safe. Writes go
//! straight to the port from the supervisor task.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serialport::SerialPort;
use tokio::sync::mpsc;
use tokio::time::sleep;

use super::radio::{self, ByteChannel, RadioLink};
use super::Connector;
use crate::config::TransportConfig;
use crate::error::ConnectError;

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const READ_BUF: usize = 1024;

pub struct SerialConnector {
    path: String,
    baud_rate: u32,
    channel: u32,
    handshake_timeout: Duration,
}

impl SerialConnector {
    pub fn new(path: impl Into<String>, baud_rate: u32, handshake_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            channel: 0,
            handshake_timeout,
        }
    }

    pub fn from_config(cfg: &TransportConfig) -> Self {
        Self {
            path: cfg.port.clone(),
            baud_rate: cfg.baud_rate,
            channel: cfg.channel,
            handshake_timeout: Duration::from_millis(cfg.connect_timeout_ms),
        }
    }
}

impl Connector for SerialConnector {
    type Link = RadioLink<SerialChannel>;

    async fn connect(&mut self) -> Result<Self::Link, ConnectError> {
        check_device(Path::new(&self.path))?;
        let channel = SerialChannel::open(&self.path, self.baud_rate).await?;
        radio::handshake(channel, self.channel, self.handshake_timeout).await
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.path, self.baud_rate)
    }
}

/// The device node must exist and, on unix, be a character device.
///
/// An rfcomm binding that has not been set up yet shows up as a missing path.
pub fn check_device(path: &Path) -> Result<(), ConnectError> {
    let meta = std::fs::metadata(path).map_err(|e| {
        ConnectError::LinkUnavailable(format!("{}: {}", path.display(), e))
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if !meta.file_type().is_char_device() {
            return Err(ConnectError::LinkUnavailable(format!(
                "{} is not a character device",
                path.display()
            )));
        }
    }
    #[cfg(not(unix))]
    let _ = meta;
    Ok(())
}

pub struct SerialChannel {
    port: Box<dyn SerialPort>,
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    stop: Arc<AtomicBool>,
}

impl SerialChannel {
    async fn open(path: &str, baud_rate: u32) -> Result<Self, ConnectError> {
        debug!("Opening serial port {} at {} baud", path, baud_rate);
        let mut builder = serialport::new(path, baud_rate).timeout(READ_TIMEOUT);
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let mut port = builder
            .open()
            .map_err(|e| ConnectError::LinkUnavailable(format!("{}: {}", path, e)))?;

        // Toggle DTR/RTS so USB nodes wake up
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
        sleep(Duration::from_millis(150)).await;
        let _ = port.clear(serialport::ClearBuffer::Input);

        let reader = port
            .try_clone()
            .map_err(|e| ConnectError::LinkUnavailable(format!("{}: {}", path, e)))?;
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(64);
        let thread_stop = stop.clone();
        std::thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || read_loop(reader, tx, thread_stop))
            .map_err(|e| ConnectError::LinkUnavailable(format!("reader thread: {}", e)))?;

        Ok(Self { port, rx, stop })
    }
}

fn read_loop(
    mut port: Box<dyn SerialPort>,
    tx: mpsc::Sender<io::Result<Vec<u8>>>,
    stop: Arc<AtomicBool>,
) {
    let mut buf = [0u8; READ_BUF];
    while !stop.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) => {}
            Err(e) => {
                warn!("Serial read error: {}", e);
                let _ = tx.blocking_send(Err(e));
                break;
            }
        }
    }
    debug!("serial reader thread exiting");
}

impl ByteChannel for SerialChannel {
    async fn read_chunk(&mut self) -> io::Result<Vec<u8>> {
        match self.rx.recv().await {
            Some(result) => result,
            None => Ok(Vec::new()),
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    async fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.rx.close();
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_is_link_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_device(&dir.path().join("rfcomm9")).unwrap_err();
        assert!(matches!(err, ConnectError::LinkUnavailable(_)));
    }

    #[cfg(unix)]
    #[test]
    fn regular_file_is_not_a_device() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = check_device(file.path()).unwrap_err();
        assert!(matches!(err, ConnectError::LinkUnavailable(msg) if msg.contains("character device")));
    }
}
