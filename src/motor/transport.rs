// Shared serial transport for the MMC-100 daisy chain
//
// One port carries every axis. The port sits behind an async mutex and each
// exchange (write, optionally read one reply line) runs on the blocking pool
// while the guard is held, so exactly one exchange is in flight at any time.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::protocol::frame;
use super::sim::SimulatedController;
use crate::error::{Result, StageError};

/// Port names with this prefix open the in-process controller emulator
pub const SIMULATED_PORT_PREFIX: &str = "sim://";

/// Per-read timeout handed to the serial driver; the reply deadline is enforced on top
const READ_SLICE: Duration = Duration::from_millis(10);

/// Most bytes thrown away when clearing input by reading
const DRAIN_LIMIT: usize = 4096;

/// Anything that can stand in for the serial device
pub trait SerialLink: Read + Write + Send {
    /// Throw away whatever has been received but not read yet
    fn clear_input(&mut self) -> io::Result<()> {
        drain(self)
    }
}

impl SerialLink for Box<dyn SerialPort> {
    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

impl SerialLink for SimulatedController {}

/// Read until the link has nothing more to give
fn drain<L: Read + ?Sized>(link: &mut L) -> io::Result<()> {
    let mut scratch = [0u8; 64];
    let mut discarded = 0;
    while discarded < DRAIN_LIMIT {
        match link.read(&mut scratch) {
            Ok(0) => break,
            Ok(n) => discarded += n,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    if discarded > 0 {
        debug!("Discarded {} stale bytes", discarded);
    }
    Ok(())
}

struct Link {
    port: Option<Box<dyn SerialLink>>,
}

/// Exclusive holder of the serial port, cheap to clone.
#[derive(Clone)]
pub struct Transport {
    name: Arc<str>,
    timeout: Duration,
    link: Arc<Mutex<Link>>,
}

impl Transport {
    /// Open a serial device (or the emulator for `sim://` names)
    pub fn open(port_name: &str, baudrate: u32, timeout: Duration) -> Result<Self> {
        if port_name.starts_with(SIMULATED_PORT_PREFIX) {
            info!("Opening simulated controller '{}'", port_name);
            return Ok(Self::from_link(
                port_name,
                Box::new(SimulatedController::new()),
                timeout,
            ));
        }

        info!("Opening serial port {} at {} baud", port_name, baudrate);
        let port = serialport::new(port_name, baudrate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(READ_SLICE)
            .open()?;

        Ok(Self::from_link(port_name, Box::new(port), timeout))
    }

    /// Wrap an already-open link
    pub fn from_link(name: &str, port: Box<dyn SerialLink>, timeout: Duration) -> Self {
        Self {
            name: Arc::from(name),
            timeout,
            link: Arc::new(Mutex::new(Link { port: Some(port) })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn is_open(&self) -> bool {
        self.link.lock().await.port.is_some()
    }

    /// Drop the port. Later exchanges fail with a transport error.
    pub async fn close(&self) {
        if self.link.lock().await.port.take().is_some() {
            info!("Closed transport {}", self.name);
        }
    }

    /// Write "<prefix><command> \n\r"
    pub async fn send(&self, prefix: u8, command: &str) -> Result<()> {
        self.exchange(prefix, command, false).await.map(|_| ())
    }

    /// Write a command and read one reply line, returned without framing
    pub async fn query(&self, prefix: u8, command: &str) -> Result<String> {
        self.exchange(prefix, command, true).await
    }

    async fn exchange(&self, prefix: u8, command: &str, want_reply: bool) -> Result<String> {
        let mut guard = self.link.clone().lock_owned().await;
        let line = frame(prefix, command);
        let label = format!("{prefix}{command}");
        let timeout = self.timeout;
        let name = self.name.clone();

        tokio::task::spawn_blocking(move || {
            let Some(port) = guard.port.as_mut() else {
                return Err(StageError::Transport(format!("port {name} is closed")));
            };

            debug!("-> {}", label);
            // A reply that missed its deadline must not answer this command
            let result = port
                .clear_input()
                .map_err(|e| StageError::Transport(e.to_string()))
                .and_then(|()| write_line(port.as_mut(), &line))
                .and_then(|()| {
                    if want_reply {
                        read_reply(port.as_mut(), &label, timeout)
                    } else {
                        Ok(String::new())
                    }
                });

            match result {
                Ok(reply) => {
                    if want_reply {
                        debug!("<- {} = {}", label, reply);
                    }
                    Ok(reply)
                }
                Err(e) => {
                    if e.is_transport_fatal() {
                        warn!("Transport {} failed during '{}': {}; closing", name, label, e);
                        guard.port = None;
                    }
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| StageError::Transport(format!("serial I/O task failed: {e}")))?
    }
}

fn write_line(port: &mut dyn SerialLink, line: &str) -> Result<()> {
    port.write_all(line.as_bytes())
        .and_then(|()| port.flush())
        .map_err(|e| StageError::Transport(e.to_string()))
}

/// Read until the line ends in CR+LF (either order) or the deadline passes
fn read_reply(port: &mut dyn SerialLink, label: &str, timeout: Duration) -> Result<String> {
    let deadline = Instant::now() + timeout;
    let mut buf = Vec::with_capacity(32);
    let mut byte = [0u8; 1];

    loop {
        if is_terminated(&buf) {
            let text = String::from_utf8_lossy(&buf);
            return Ok(text.trim().to_string());
        }
        if Instant::now() >= deadline {
            return Err(StageError::TransportTimeout {
                command: label.to_string(),
                timeout,
            });
        }

        match port.read(&mut byte) {
            Ok(1) => buf.push(byte[0]),
            Ok(_) => std::thread::sleep(Duration::from_millis(1)),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(StageError::Transport(e.to_string())),
        }
    }
}

fn is_terminated(buf: &[u8]) -> bool {
    buf.ends_with(b"\r\n") || buf.ends_with(b"\n\r")
}
