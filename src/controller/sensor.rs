// Obstacle sensor loop
//
// Fires an ultrasonic ranging pulse every sensor interval, converts the echo
// round-trip to centimetres, discards readings outside the trusted range and
// smooths the rest with a short rolling average. Only the latest sample is
// published; the controller reads it through a watch channel.

use std::collections::VecDeque;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;

/// Speed of sound at ~20°C, in cm per microsecond
const SPEED_OF_SOUND_CM_PER_US: f32 = 0.0343;

/// Echo round-trip source (HC-SR04 style trigger/echo pair)
pub trait RangeFinder: Send {
    /// Fire one pulse and return the echo round-trip time, or `None` if nothing
    /// came back within `timeout`. Must not block longer than `timeout`.
    fn ping(&mut self, timeout: Duration) -> Option<Duration>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    NoEcho,
    OutOfRange,
}

/// Filtered distance reading published once per sensor cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceSample {
    pub cm: f32,
    pub validity: Validity,
}

impl DistanceSample {
    pub fn valid(cm: f32) -> Self {
        Self {
            cm,
            validity: Validity::Valid,
        }
    }

    /// Invalid readings carry the far edge of the trusted range so nothing
    /// downstream mistakes them for an obstacle.
    pub fn invalid(validity: Validity, far_cm: f32) -> Self {
        Self { cm: far_cm, validity }
    }

    pub fn is_valid(&self) -> bool {
        self.validity == Validity::Valid
    }

    pub fn is_obstacle(&self, safe_distance_cm: f32) -> bool {
        self.is_valid() && self.cm < safe_distance_cm
    }

    /// A trusted reading at or beyond the safe distance. Invalid readings are
    /// neither blocked nor clear.
    pub fn is_clear(&self, safe_distance_cm: f32) -> bool {
        self.is_valid() && self.cm >= safe_distance_cm
    }

    /// Distance to report upstream; `None` unless the reading is valid.
    pub fn reported_cm(&self) -> Option<f32> {
        self.is_valid().then_some(self.cm)
    }
}

pub fn echo_to_cm(echo: Duration) -> f32 {
    echo.as_micros() as f32 * SPEED_OF_SOUND_CM_PER_US / 2.0
}

pub fn cm_to_echo(cm: f32) -> Duration {
    Duration::from_micros((cm * 2.0 / SPEED_OF_SOUND_CM_PER_US).round() as u64)
}

pub struct ObstacleSensor<R> {
    finder: R,
    window: VecDeque<f32>,
    window_len: usize,
    echo_timeout: Duration,
    min_cm: f32,
    max_cm: f32,
}

impl<R: RangeFinder> ObstacleSensor<R> {
    pub fn new(finder: R, config: &ControllerConfig) -> Self {
        let window_len = config.rolling_window.max(1);
        Self {
            finder,
            window: VecDeque::with_capacity(window_len),
            window_len,
            echo_timeout: config.echo_timeout,
            min_cm: config.min_trusted_cm,
            max_cm: config.max_trusted_cm,
        }
    }

    /// Take one reading and fold it into the rolling average.
    pub fn measure(&mut self) -> DistanceSample {
        let Some(echo) = self.finder.ping(self.echo_timeout) else {
            return DistanceSample::invalid(Validity::NoEcho, self.max_cm);
        };

        let raw_cm = echo_to_cm(echo);
        if raw_cm < self.min_cm || raw_cm > self.max_cm {
            debug!("Discarding out-of-range reading: {:.1} cm", raw_cm);
            return DistanceSample::invalid(Validity::OutOfRange, self.max_cm);
        }

        if self.window.len() == self.window_len {
            self.window.pop_front();
        }
        self.window.push_back(raw_cm);

        let average = self.window.iter().sum::<f32>() / self.window.len() as f32;
        DistanceSample::valid(average)
    }
}

impl<R: RangeFinder + 'static> ObstacleSensor<R> {
    /// Run the sensor on its own thread, publishing into a single-slot cell.
    /// The thread exits once every receiver has been dropped.
    pub fn spawn(
        mut self,
        interval: Duration,
    ) -> (JoinHandle<()>, watch::Receiver<Option<DistanceSample>>) {
        let (tx, rx) = watch::channel(None);

        let handle = thread::spawn(move || {
            info!("Obstacle sensor started: {}ms interval", interval.as_millis());
            let mut next = Instant::now();
            while !tx.is_closed() {
                let sample = self.measure();
                if !sample.is_valid() {
                    debug!("Sensor reading invalid: {:?}", sample.validity);
                }
                tx.send_replace(Some(sample));

                next += interval;
                let now = Instant::now();
                if next > now {
                    thread::sleep(next - now);
                } else {
                    warn!("Sensor cycle overran by {:?}", now - next);
                    next = now;
                }
            }
            info!("Obstacle sensor stopped");
        });

        (handle, rx)
    }
}

/// Bench stand-in that reports a fixed distance (or silence).
#[derive(Debug, Clone)]
pub struct SimulatedRangeFinder {
    pub distance_cm: Option<f32>,
}

impl SimulatedRangeFinder {
    pub fn new(distance_cm: Option<f32>) -> Self {
        Self { distance_cm }
    }
}

impl RangeFinder for SimulatedRangeFinder {
    fn ping(&mut self, timeout: Duration) -> Option<Duration> {
        let echo = cm_to_echo(self.distance_cm?);
        (echo <= timeout).then_some(echo)
    }
}
