// Cooperative control loop for the on-board controller
//
// Every iteration: drain inbound bytes without blocking, feed at most one
// command byte plus the newest distance sample into the state machine, write
// the ack/nak, and periodically report distance telemetry. The loop period is
// a few milliseconds, so a Stop or an obstacle is never held up by a burst.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::drivetrain::Drivetrain;
use super::sensor::{DistanceSample, ObstacleSensor, RangeFinder};
use super::state_machine::MotionController;
use crate::config::ControllerConfig;
use crate::messages::LinkReply;

/// Inbound bytes kept while waiting to be ticked; older bytes are dropped first
const INBOX_CAPACITY: usize = 64;

/// Read timeout on the controller's end of the link (keeps reads non-blocking)
const LINK_POLL_TIMEOUT: Duration = Duration::from_millis(1);

pub struct ControllerRuntime<L, D> {
    link: L,
    controller: MotionController<D>,
    samples: watch::Receiver<Option<DistanceSample>>,
    inbox: VecDeque<u8>,
    telemetry_interval: Duration,
    last_telemetry: Option<Instant>,
}

impl<L: Read + Write, D: Drivetrain> ControllerRuntime<L, D> {
    pub fn new(
        link: L,
        controller: MotionController<D>,
        samples: watch::Receiver<Option<DistanceSample>>,
        telemetry_interval: Duration,
    ) -> Self {
        Self {
            link,
            controller,
            samples,
            inbox: VecDeque::with_capacity(INBOX_CAPACITY),
            telemetry_interval,
            last_telemetry: None,
        }
    }

    pub fn controller(&self) -> &MotionController<D> {
        &self.controller
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// One loop iteration. I/O errors are returned; the state machine has
    /// already been advanced when they are.
    pub fn step(&mut self, now: Instant) -> io::Result<()> {
        let read_result = self.fill_inbox();

        let byte = self.next_command_byte();
        let sample = self.take_sample();
        let reply = self.controller.tick(now, byte, sample);
        read_result?;

        if let Some(reply) = reply {
            debug!("Reply: {:?}", reply);
            self.link.write_all(reply.to_line().as_bytes())?;
            self.link.flush()?;
        }

        let telemetry_due = self
            .last_telemetry
            .is_none_or(|at| now.saturating_duration_since(at) >= self.telemetry_interval);
        if telemetry_due {
            self.last_telemetry = Some(now);
            let cm = self.controller.latest_sample().and_then(|s| s.reported_cm());
            self.link.write_all(LinkReply::distance_line(cm).as_bytes())?;
            self.link.flush()?;
        }

        Ok(())
    }

    fn fill_inbox(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 32];
        match self.link.read(&mut buf) {
            Ok(n) => {
                for &b in &buf[..n] {
                    if self.inbox.len() == INBOX_CAPACITY {
                        self.inbox.pop_front();
                    }
                    self.inbox.push_back(b);
                }
                Ok(())
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Line terminators are framing, not commands.
    fn next_command_byte(&mut self) -> Option<u8> {
        while let Some(b) = self.inbox.pop_front() {
            if b != b'\n' && b != b'\r' {
                return Some(b);
            }
        }
        None
    }

    fn take_sample(&mut self) -> Option<DistanceSample> {
        match self.samples.has_changed() {
            Ok(true) => *self.samples.borrow_and_update(),
            Ok(false) => None,
            Err(_) => {
                if !self.controller.sensor_lost() {
                    error!("Obstacle sensor stopped publishing; stopping motors");
                    self.controller.on_sensor_lost();
                }
                None
            }
        }
    }
}

/// Open the host link and run the controller forever.
pub fn run<D, R>(
    port_name: &str,
    baudrate: u32,
    config: ControllerConfig,
    drive: D,
    finder: R,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    D: Drivetrain,
    R: RangeFinder + 'static,
{
    info!("Opening host link on {} @ {} baud", port_name, baudrate);
    let port = serialport::new(port_name, baudrate)
        .timeout(LINK_POLL_TIMEOUT)
        .open()?;

    let sensor = ObstacleSensor::new(finder, &config);
    let (_sensor_thread, samples) = sensor.spawn(config.sensor_interval);

    let loop_period = config.loop_period;
    info!(
        "Controller started: {}ms loop, safe distance {:.0} cm, burst {}ms / pause {}ms",
        loop_period.as_millis(),
        config.safe_distance_cm,
        config.movement_duration.as_millis(),
        config.pause_duration.as_millis()
    );

    let telemetry_interval = config.telemetry_interval;
    let controller = MotionController::new(drive, config);
    let mut runtime = ControllerRuntime::new(port, controller, samples, telemetry_interval);

    let mut link_healthy = true;
    loop {
        match runtime.step(Instant::now()) {
            Ok(()) => {
                if !link_healthy {
                    info!("Host link recovered");
                    link_healthy = true;
                }
            }
            Err(e) => {
                if link_healthy {
                    warn!("Host link error: {}", e);
                    link_healthy = false;
                }
            }
        }
        thread::sleep(loop_period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::drivetrain::RecordingDrivetrain;
    use crate::messages::MotionState;

    #[derive(Default)]
    struct FakeLink {
        input: VecDeque<u8>,
        output: Vec<u8>,
    }

    impl FakeLink {
        fn lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.output)
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    impl Read for FakeLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.input.is_empty() {
                return Err(io::Error::new(ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(self.input.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.input.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for FakeLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn runtime(
        input: &[u8],
    ) -> (
        ControllerRuntime<FakeLink, RecordingDrivetrain>,
        watch::Sender<Option<DistanceSample>>,
    ) {
        let (tx, rx) = watch::channel(None);
        let link = FakeLink {
            input: input.iter().copied().collect(),
            output: Vec::new(),
        };
        let controller =
            MotionController::new(RecordingDrivetrain::default(), ControllerConfig::default());
        (
            ControllerRuntime::new(link, controller, rx, Duration::from_millis(500)),
            tx,
        )
    }

    fn acks(lines: &[String]) -> Vec<&str> {
        lines
            .iter()
            .filter(|l| !l.starts_with("DIST:"))
            .map(String::as_str)
            .collect()
    }

    #[test]
    fn one_reply_per_command_byte() {
        let (mut rt, _tx) = runtime(b"F\nq\r\nS\n");
        let t0 = Instant::now();
        for i in 0..6 {
            rt.step(t0 + Duration::from_millis(i * 5)).unwrap();
        }
        assert_eq!(acks(&rt.link().lines()), vec!["ACK:F", "NAK:q", "ACK:S"]);
        assert_eq!(rt.controller().motion(), MotionState::Stopped);
    }

    #[test]
    fn fresh_sample_reaches_controller_once() {
        let (mut rt, tx) = runtime(b"F");
        let t0 = Instant::now();
        rt.step(t0).unwrap();
        assert_eq!(rt.controller().motion(), MotionState::Forward);

        tx.send_replace(Some(DistanceSample::valid(20.0)));
        rt.step(t0 + Duration::from_millis(5)).unwrap();
        assert_eq!(rt.controller().motion(), MotionState::Backward);
        assert!(rt.controller().obstacle_override_active());
    }

    #[test]
    fn telemetry_reports_filtered_distance() {
        let (mut rt, tx) = runtime(b"");
        let t0 = Instant::now();
        rt.step(t0).unwrap();
        tx.send_replace(Some(DistanceSample::valid(87.3)));
        rt.step(t0 + Duration::from_millis(100)).unwrap();
        rt.step(t0 + Duration::from_millis(500)).unwrap();

        let lines = rt.link().lines();
        assert_eq!(lines, vec!["DIST:none", "DIST:87.3"]);
    }

    #[test]
    fn dead_sensor_stops_motors_but_keeps_acking() {
        let (mut rt, tx) = runtime(b"F");
        let t0 = Instant::now();
        tx.send_replace(Some(DistanceSample::valid(200.0)));
        rt.step(t0).unwrap();
        assert_eq!(rt.controller().motion(), MotionState::Forward);

        drop(tx);
        rt.step(t0 + Duration::from_millis(5)).unwrap();
        assert_eq!(rt.controller().motion(), MotionState::Stopped);

        rt.link.input.extend(b"F\n");
        rt.step(t0 + Duration::from_millis(10)).unwrap();
        rt.step(t0 + Duration::from_millis(15)).unwrap();
        assert_eq!(rt.controller().motion(), MotionState::Stopped);
        assert_eq!(acks(&rt.link().lines()), vec!["ACK:F", "ACK:F"]);
        assert!(rt.controller().sensor_lost());
    }
}
