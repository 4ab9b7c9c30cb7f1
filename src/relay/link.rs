// Host end of the serial link to the motion controller
//
// Wire format: one ASCII command byte followed by '\n'. The controller answers
// with newline-terminated lines: `ACK:<c>`, `NAK:<c>` or `DIST:<cm>`.

use std::io::{self, ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use serialport::SerialPortType;
use tracing::{debug, trace};

use crate::config::RelayConfig;
use crate::messages::{Command, LinkReply};

/// Per-read timeout on the host end; reads are retried until the ack deadline
pub const LINK_READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Longest line accepted from the controller before the buffer is discarded
const MAX_LINE_LEN: usize = 128;

/// Byte stream to the controller.
pub trait LinkIo: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> LinkIo for T {}

/// Finds and opens the physical link.
pub trait LinkConnector: Send + Sync {
    /// Ports worth trying, in priority order.
    fn candidates(&self) -> Vec<String>;

    fn open(&self, port: &str) -> io::Result<Box<dyn LinkIo>>;
}

/// Opens USB serial ports through the `serialport` crate.
pub struct SerialConnector {
    known_ports: Vec<String>,
    baudrate: u32,
}

impl SerialConnector {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            known_ports: config.port_candidates.clone(),
            baudrate: config.baudrate,
        }
    }
}

impl LinkConnector for SerialConnector {
    /// Configured ports first, then any USB serial device the OS reports.
    fn candidates(&self) -> Vec<String> {
        let mut ports = self.known_ports.clone();
        match serialport::available_ports() {
            Ok(found) => {
                for info in found {
                    if matches!(info.port_type, SerialPortType::UsbPort(_))
                        && !ports.contains(&info.port_name)
                    {
                        ports.push(info.port_name);
                    }
                }
            }
            Err(e) => debug!("Port enumeration failed: {}", e),
        }
        ports
    }

    fn open(&self, port: &str) -> io::Result<Box<dyn LinkIo>> {
        let handle = serialport::new(port, self.baudrate)
            .timeout(LINK_READ_TIMEOUT)
            .open()?;
        Ok(Box::new(handle))
    }
}

/// What came back for one submitted command.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    /// `Ack` or `Nak` for the submitted command, `None` if the deadline passed
    pub reply: Option<LinkReply>,
    /// Newest distance telemetry seen while waiting
    pub distance: Option<Option<f32>>,
}

/// An open link plus the bytes of any partially received line.
pub struct LinkHandle {
    port: String,
    io: Box<dyn LinkIo>,
    partial: Vec<u8>,
}

impl LinkHandle {
    pub fn new(port: impl Into<String>, io: Box<dyn LinkIo>) -> Self {
        Self {
            port: port.into(),
            io,
            partial: Vec::new(),
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Write one command and wait up to `timeout` for its ack.
    ///
    /// Acks and naks for other commands (left over from an earlier timed-out
    /// exchange) are skipped. Blocking; call from a blocking context.
    pub fn exchange(&mut self, cmd: Command, timeout: Duration) -> io::Result<Exchange> {
        self.io.write_all(&[cmd.as_byte(), b'\n'])?;
        self.io.flush()?;
        debug!("Sent {} on {}", cmd, self.port);

        let deadline = Instant::now() + timeout;
        let mut distance = None;
        while let Some(line) = self.read_line(deadline)? {
            match LinkReply::parse(&line) {
                LinkReply::Ack(acked) if acked == cmd => {
                    return Ok(Exchange {
                        reply: Some(LinkReply::Ack(acked)),
                        distance,
                    });
                }
                LinkReply::Nak(detail) if detail == String::from(cmd) => {
                    return Ok(Exchange {
                        reply: Some(LinkReply::Nak(detail)),
                        distance,
                    });
                }
                LinkReply::Distance(cm) => distance = Some(cm),
                other => trace!("Skipping line while awaiting ack: {:?}", other),
            }
        }

        Ok(Exchange {
            reply: None,
            distance,
        })
    }

    /// Read whatever lines are already waiting and return the newest distance
    /// telemetry among them. Performs at most one short read.
    pub fn drain_telemetry(&mut self) -> io::Result<Option<Option<f32>>> {
        let mut distance = None;
        let deadline = Instant::now();
        while let Some(line) = self.read_line(deadline)? {
            if let LinkReply::Distance(cm) = LinkReply::parse(&line) {
                distance = Some(cm);
            }
        }
        Ok(distance)
    }

    /// Next complete line, or `None` once `deadline` has passed. At least one
    /// read is attempted even when the deadline is already due.
    fn read_line(&mut self, deadline: Instant) -> io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.partial.drain(..=pos).collect();
                return Ok(Some(String::from_utf8_lossy(&line).trim().to_string()));
            }

            let mut buf = [0u8; 64];
            match self.io.read(&mut buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "link closed by controller",
                    ));
                }
                Ok(n) => {
                    self.partial.extend_from_slice(&buf[..n]);
                    if self.partial.len() > MAX_LINE_LEN && !self.partial.contains(&b'\n') {
                        debug!("Discarding {} bytes of unterminated input", self.partial.len());
                        self.partial.clear();
                    }
                    continue;
                }
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeController;
    use super::*;

    #[test]
    fn exchange_writes_one_byte_and_reads_ack() {
        let fake = FakeController::acking();
        let mut handle = LinkHandle::new("/dev/fake", Box::new(fake.clone()));

        let exchange = handle
            .exchange(Command::Left, Duration::from_millis(100))
            .unwrap();
        assert_eq!(exchange.reply, Some(LinkReply::Ack(Command::Left)));
        assert_eq!(fake.written(), b"L\n");
    }

    #[test]
    fn stale_acks_and_telemetry_are_skipped() {
        let fake = FakeController::acking();
        fake.queue_line("ACK:F");
        fake.queue_line("DIST:31.5");
        let mut handle = LinkHandle::new("/dev/fake", Box::new(fake));

        let exchange = handle
            .exchange(Command::Stop, Duration::from_millis(100))
            .unwrap();
        assert_eq!(exchange.reply, Some(LinkReply::Ack(Command::Stop)));
        assert_eq!(exchange.distance, Some(Some(31.5)));
    }

    #[test]
    fn silent_controller_times_out() {
        let fake = FakeController::default();
        let mut handle = LinkHandle::new("/dev/fake", Box::new(fake));

        let started = Instant::now();
        let exchange = handle
            .exchange(Command::Forward, Duration::from_millis(30))
            .unwrap();
        assert_eq!(exchange.reply, None);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn nak_is_returned_as_is() {
        let fake = FakeController::default();
        fake.queue_line("NAK:F");
        let mut handle = LinkHandle::new("/dev/fake", Box::new(fake));
        let exchange = handle
            .exchange(Command::Forward, Duration::from_millis(50))
            .unwrap();
        assert_eq!(exchange.reply, Some(LinkReply::Nak("F".to_string())));
    }

    #[test]
    fn stale_nak_for_another_command_is_skipped() {
        let fake = FakeController::default();
        fake.queue_line("NAK:L");
        fake.queue_line("NAK:0x07");
        fake.queue_line("ACK:F");
        let mut handle = LinkHandle::new("/dev/fake", Box::new(fake));
        let exchange = handle
            .exchange(Command::Forward, Duration::from_millis(50))
            .unwrap();
        assert_eq!(exchange.reply, Some(LinkReply::Ack(Command::Forward)));
    }

    #[test]
    fn stale_nak_alone_is_a_timeout() {
        let fake = FakeController::default();
        fake.queue_line("NAK:R");
        let mut handle = LinkHandle::new("/dev/fake", Box::new(fake));
        let exchange = handle
            .exchange(Command::Stop, Duration::from_millis(30))
            .unwrap();
        assert_eq!(exchange.reply, None);
    }

    #[test]
    fn drain_keeps_newest_distance() {
        let fake = FakeController::default();
        fake.queue_line("DIST:80.0");
        fake.queue_line("DIST:none");
        fake.queue_line("DIST:64.0");
        let mut handle = LinkHandle::new("/dev/fake", Box::new(fake));
        assert_eq!(handle.drain_telemetry().unwrap(), Some(Some(64.0)));
        assert_eq!(handle.drain_telemetry().unwrap(), None);
    }

    #[test]
    fn hard_io_errors_surface() {
        let fake = FakeController::default();
        fake.break_with(ErrorKind::BrokenPipe);
        let mut handle = LinkHandle::new("/dev/fake", Box::new(fake));
        assert!(handle.exchange(Command::Stop, Duration::from_millis(10)).is_err());
    }
}
