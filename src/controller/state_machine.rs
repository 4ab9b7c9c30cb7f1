// Motion controller state machine
//
// One owned state struct, advanced only by `tick`. Every input arrives as a
// discrete event (an inbound command byte, a new distance sample) together
// with the current monotonic time; timed bursts and pauses are deadlines that
// are compared on every tick, never slept on.
//
// Priority per tick:
//   1. obstacle closer than the safe distance -> Backward, override latched
//   2. override clears (valid and clear for one full sensor cycle) -> Stopped, once
//   3. commanded motion: Stop is immediate, directions start a timed burst

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::drivetrain::{Drivetrain, Pace};
use super::sensor::DistanceSample;
use crate::config::ControllerConfig;
use crate::messages::{Command, LinkReply, MotionState};

/// Response owed to the host for one inbound byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack(Command),
    Nak(u8),
}

impl Reply {
    pub fn to_line(self) -> String {
        match self {
            Reply::Ack(cmd) => LinkReply::ack_line(cmd),
            Reply::Nak(byte) => LinkReply::nak_line(byte),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Burst { command: Command, until: Instant },
    /// Forced stop after a burst; commands arriving now wait for `until`
    Pause { until: Instant },
}

#[derive(Debug, Clone)]
pub struct ControllerState {
    pub motion: MotionState,
    pub pace: Pace,
    pub obstacle_override_active: bool,
    pub phase: Phase,
    /// Most recent command accepted during a pause
    pub pending: Option<Command>,
    /// When the distance first read clear while the override was latched
    pub clear_since: Option<Instant>,
    pub latest_sample: Option<DistanceSample>,
    /// The sensor stopped publishing; only Stop is executed from then on
    pub sensor_lost: bool,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            motion: MotionState::Stopped,
            pace: Pace::Normal,
            obstacle_override_active: false,
            phase: Phase::Idle,
            pending: None,
            clear_since: None,
            latest_sample: None,
            sensor_lost: false,
        }
    }
}

pub struct MotionController<D> {
    state: ControllerState,
    drive: D,
    config: ControllerConfig,
}

impl<D: Drivetrain> MotionController<D> {
    pub fn new(drive: D, config: ControllerConfig) -> Self {
        Self {
            state: ControllerState::default(),
            drive,
            config,
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn motion(&self) -> MotionState {
        self.state.motion
    }

    pub fn obstacle_override_active(&self) -> bool {
        self.state.obstacle_override_active
    }

    pub fn latest_sample(&self) -> Option<DistanceSample> {
        self.state.latest_sample
    }

    pub fn drivetrain(&self) -> &D {
        &self.drive
    }

    pub fn sensor_lost(&self) -> bool {
        self.state.sensor_lost
    }

    /// The obstacle sensor is gone for good. Motors stop, the stale reading is
    /// dropped, and directional commands are refused from here on.
    pub fn on_sensor_lost(&mut self) {
        if self.state.sensor_lost {
            return;
        }
        self.state.sensor_lost = true;
        self.state.obstacle_override_active = false;
        self.state.clear_since = None;
        self.state.latest_sample = None;
        self.state.phase = Phase::Idle;
        self.state.pending = None;
        self.set_motion(MotionState::Stopped, Pace::Normal);
    }

    /// Advance the controller by one loop iteration.
    ///
    /// `byte` is at most one inbound command byte (line terminators already
    /// stripped); `sample` is a freshly published distance reading, if any.
    /// Returns the ack/nak owed for `byte`.
    pub fn tick(
        &mut self,
        now: Instant,
        byte: Option<u8>,
        sample: Option<DistanceSample>,
    ) -> Option<Reply> {
        if let Some(sample) = sample {
            self.on_sample(now, sample);
        }

        let was_overridden = self.state.obstacle_override_active;
        self.update_override(now);

        let reply = byte.map(|b| match Command::from_byte(b) {
            Ok(cmd) => {
                if was_overridden || self.state.obstacle_override_active {
                    info!("Command {} acknowledged but ignored: obstacle override", cmd);
                } else if self.state.sensor_lost && cmd != Command::Stop {
                    warn!("Command {} acknowledged but ignored: no obstacle sensor", cmd);
                } else {
                    self.on_command(now, cmd);
                }
                Reply::Ack(cmd)
            }
            Err(e) => {
                warn!("Rejected inbound byte: {}", e);
                Reply::Nak(b)
            }
        });

        if !self.state.obstacle_override_active {
            self.advance_timers(now);
        }

        reply
    }

    fn on_sample(&mut self, now: Instant, sample: DistanceSample) {
        self.state.latest_sample = Some(sample);

        if !self.state.obstacle_override_active {
            return;
        }
        if sample.is_obstacle(self.config.safe_distance_cm) {
            self.state.clear_since = None;
        } else if sample.is_clear(self.config.safe_distance_cm)
            && self.state.clear_since.is_none()
        {
            self.state.clear_since = Some(now);
        }
    }

    fn update_override(&mut self, now: Instant) {
        let blocked = self
            .state
            .latest_sample
            .is_some_and(|s| s.is_obstacle(self.config.safe_distance_cm));

        if blocked {
            if !self.state.obstacle_override_active {
                warn!(
                    "Obstacle at {:.1} cm (< {:.1} cm), backing off",
                    self.state.latest_sample.map_or(0.0, |s| s.cm),
                    self.config.safe_distance_cm
                );
                self.state.obstacle_override_active = true;
                self.state.clear_since = None;
                self.state.phase = Phase::Idle;
                self.state.pending = None;
            }
            self.set_motion(MotionState::Backward, Pace::Normal);
            return;
        }

        if !self.state.obstacle_override_active {
            return;
        }

        let clear_now = self
            .state
            .latest_sample
            .is_some_and(|s| s.is_clear(self.config.safe_distance_cm));
        let clear_for = self
            .state
            .clear_since
            .map(|since| now.saturating_duration_since(since));
        if clear_now && clear_for.is_some_and(|d| d >= self.config.sensor_interval) {
            info!("Obstacle cleared, stopping until the next command");
            self.state.obstacle_override_active = false;
            self.state.clear_since = None;
            self.state.phase = Phase::Idle;
            self.state.pending = None;
            self.set_motion(MotionState::Stopped, Pace::Normal);
        }
    }

    fn on_command(&mut self, now: Instant, cmd: Command) {
        if cmd == Command::Stop {
            debug!("Stop: cancelling {:?}", self.state.phase);
            self.state.phase = Phase::Idle;
            self.state.pending = None;
            self.set_motion(MotionState::Stopped, Pace::Normal);
            return;
        }

        match self.state.phase {
            Phase::Burst { command, .. } if command == cmd => {
                debug!("{} already bursting, timer unchanged", cmd);
            }
            Phase::Pause { .. } => {
                debug!("{} queued until pause ends", cmd);
                self.state.pending = Some(cmd);
            }
            Phase::Burst { .. } | Phase::Idle => self.start_burst(now, cmd),
        }
    }

    fn advance_timers(&mut self, now: Instant) {
        if let Phase::Burst { command, until } = self.state.phase {
            if now >= until {
                let pause = self.pause_for(command);
                self.state.phase = Phase::Pause {
                    until: until + pause,
                };
                self.set_motion(MotionState::Stopped, Pace::Normal);
            }
        }

        if let Phase::Pause { until } = self.state.phase {
            if now >= until {
                self.state.phase = Phase::Idle;
                if let Some(next) = self.state.pending.take() {
                    self.start_burst(now, next);
                }
            }
        }
    }

    fn start_burst(&mut self, now: Instant, cmd: Command) {
        let (motion, pace) = motion_for(cmd);
        let duration = self.burst_for(cmd);
        debug!("Burst {} for {}ms", cmd, duration.as_millis());
        self.state.phase = Phase::Burst {
            command: cmd,
            until: now + duration,
        };
        self.set_motion(motion, pace);
    }

    fn burst_for(&self, cmd: Command) -> Duration {
        match cmd {
            Command::Search => self.config.search_turn_duration,
            _ => self.config.movement_duration,
        }
    }

    fn pause_for(&self, cmd: Command) -> Duration {
        match cmd {
            Command::Search => self.config.search_pause_duration,
            _ => self.config.pause_duration,
        }
    }

    fn set_motion(&mut self, motion: MotionState, pace: Pace) {
        if self.state.motion != motion || self.state.pace != pace {
            self.state.motion = motion;
            self.state.pace = pace;
            self.drive.apply(motion, pace);
        }
    }
}

/// Search rotates in place, slowly, to the right.
fn motion_for(cmd: Command) -> (MotionState, Pace) {
    match cmd {
        Command::Forward => (MotionState::Forward, Pace::Normal),
        Command::Backward => (MotionState::Backward, Pace::Normal),
        Command::Left => (MotionState::Left, Pace::Normal),
        Command::Right => (MotionState::Right, Pace::Normal),
        Command::Search => (MotionState::Right, Pace::Search),
        Command::Stop => (MotionState::Stopped, Pace::Normal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::drivetrain::RecordingDrivetrain;
    use crate::controller::sensor::Validity;

    const SAFE: f32 = 50.0;

    fn controller() -> MotionController<RecordingDrivetrain> {
        let config = ControllerConfig {
            safe_distance_cm: SAFE,
            movement_duration: Duration::from_millis(400),
            pause_duration: Duration::from_millis(300),
            search_turn_duration: Duration::from_millis(250),
            search_pause_duration: Duration::from_millis(900),
            sensor_interval: Duration::from_millis(40),
            ..ControllerConfig::default()
        };
        MotionController::new(RecordingDrivetrain::default(), config)
    }

    fn ms(t0: Instant, millis: u64) -> Instant {
        t0 + Duration::from_millis(millis)
    }

    fn far() -> Option<DistanceSample> {
        Some(DistanceSample::valid(150.0))
    }

    fn near(cm: f32) -> Option<DistanceSample> {
        Some(DistanceSample::valid(cm))
    }

    #[test]
    fn starts_stopped() {
        let c = controller();
        assert_eq!(c.motion(), MotionState::Stopped);
        assert!(!c.obstacle_override_active());
        assert_eq!(c.state().phase, Phase::Idle);
    }

    #[test]
    fn obstacle_forces_backward_over_forward() {
        let mut c = controller();
        let t0 = Instant::now();
        c.tick(t0, Some(b'F'), far());
        assert_eq!(c.motion(), MotionState::Forward);

        c.tick(ms(t0, 40), None, near(20.0));
        assert_eq!(c.motion(), MotionState::Backward);
        assert!(c.obstacle_override_active());
    }

    #[test]
    fn override_holds_while_obstacle_persists() {
        let mut c = controller();
        let t0 = Instant::now();
        c.tick(t0, None, near(20.0));
        for step in 1..20 {
            c.tick(ms(t0, step * 40), None, near(30.0));
            assert_eq!(c.motion(), MotionState::Backward);
        }
        // no new sample: still latched on the last reading
        c.tick(ms(t0, 2000), None, None);
        assert_eq!(c.motion(), MotionState::Backward);
    }

    #[test]
    fn override_release_stops_and_never_resumes() {
        let mut c = controller();
        let t0 = Instant::now();
        c.tick(t0, Some(b'F'), far());
        c.tick(ms(t0, 40), None, near(20.0));
        assert_eq!(c.motion(), MotionState::Backward);

        // first clear sample starts the hysteresis window
        c.tick(ms(t0, 80), None, near(60.0));
        assert_eq!(c.motion(), MotionState::Backward);
        assert!(c.obstacle_override_active());

        c.tick(ms(t0, 120), None, near(60.0));
        assert_eq!(c.motion(), MotionState::Stopped);
        assert!(!c.obstacle_override_active());

        // the interrupted Forward burst is gone
        for step in 4..40 {
            c.tick(ms(t0, step * 40), None, far());
            assert_eq!(c.motion(), MotionState::Stopped);
        }

        let applied: Vec<_> = c.drivetrain().applied.iter().map(|(m, _)| *m).collect();
        assert_eq!(
            applied,
            vec![MotionState::Forward, MotionState::Backward, MotionState::Stopped]
        );
    }

    #[test]
    fn flicker_above_threshold_does_not_release() {
        let mut c = controller();
        let t0 = Instant::now();
        c.tick(t0, None, near(20.0));
        c.tick(ms(t0, 40), None, near(55.0));
        c.tick(ms(t0, 60), None, None);
        c.tick(ms(t0, 80), None, near(45.0));
        c.tick(ms(t0, 120), None, None);
        assert!(c.obstacle_override_active());
        assert_eq!(c.motion(), MotionState::Backward);
    }

    #[test]
    fn commands_during_override_are_acked_but_ignored() {
        let mut c = controller();
        let t0 = Instant::now();
        c.tick(t0, None, near(20.0));
        assert_eq!(
            c.tick(ms(t0, 5), Some(b'S'), None),
            Some(Reply::Ack(Command::Stop))
        );
        assert_eq!(c.motion(), MotionState::Backward);
        assert_eq!(
            c.tick(ms(t0, 10), Some(b'F'), None),
            Some(Reply::Ack(Command::Forward))
        );
        assert_eq!(c.motion(), MotionState::Backward);
        assert_eq!(c.state().phase, Phase::Idle);
    }

    #[test]
    fn burst_is_bounded_then_pauses() {
        let mut c = controller();
        let t0 = Instant::now();
        c.tick(t0, Some(b'F'), far());
        c.tick(ms(t0, 399), None, None);
        assert_eq!(c.motion(), MotionState::Forward);

        c.tick(ms(t0, 400), None, None);
        assert_eq!(c.motion(), MotionState::Stopped);
        assert!(matches!(c.state().phase, Phase::Pause { .. }));

        c.tick(ms(t0, 699), None, None);
        assert!(matches!(c.state().phase, Phase::Pause { .. }));
        c.tick(ms(t0, 700), None, None);
        assert_eq!(c.state().phase, Phase::Idle);

        for step in 0..50 {
            c.tick(ms(t0, 700 + step * 20), None, None);
            assert_eq!(c.motion(), MotionState::Stopped);
        }
    }

    #[test]
    fn command_during_pause_runs_when_pause_ends() {
        let mut c = controller();
        let t0 = Instant::now();
        c.tick(t0, Some(b'F'), None);
        c.tick(ms(t0, 400), None, None);
        c.tick(ms(t0, 450), Some(b'L'), None);
        c.tick(ms(t0, 500), Some(b'R'), None);
        assert_eq!(c.motion(), MotionState::Stopped);

        c.tick(ms(t0, 700), None, None);
        assert_eq!(c.motion(), MotionState::Right);
        c.tick(ms(t0, 1100), None, None);
        assert_eq!(c.motion(), MotionState::Stopped);
    }

    #[test]
    fn same_command_mid_burst_keeps_timer() {
        let mut c = controller();
        let t0 = Instant::now();
        c.tick(t0, Some(b'F'), None);
        c.tick(ms(t0, 300), Some(b'F'), None);
        c.tick(ms(t0, 400), None, None);
        assert_eq!(c.motion(), MotionState::Stopped);
        assert_eq!(c.drivetrain().applied.len(), 2);
    }

    #[test]
    fn different_command_preempts_burst() {
        let mut c = controller();
        let t0 = Instant::now();
        c.tick(t0, Some(b'F'), None);
        c.tick(ms(t0, 100), Some(b'L'), None);
        assert_eq!(c.motion(), MotionState::Left);

        // new burst runs its own full duration
        c.tick(ms(t0, 450), None, None);
        assert_eq!(c.motion(), MotionState::Left);
        c.tick(ms(t0, 500), None, None);
        assert_eq!(c.motion(), MotionState::Stopped);
    }

    #[test]
    fn stop_cancels_burst_immediately() {
        let mut c = controller();
        let t0 = Instant::now();
        c.tick(t0, Some(b'B'), None);
        c.tick(ms(t0, 50), Some(b'S'), None);
        assert_eq!(c.motion(), MotionState::Stopped);
        assert_eq!(c.state().phase, Phase::Idle);

        // no pause after an explicit stop
        c.tick(ms(t0, 60), Some(b'F'), None);
        assert_eq!(c.motion(), MotionState::Forward);
    }

    #[test]
    fn stop_discards_queued_command() {
        let mut c = controller();
        let t0 = Instant::now();
        c.tick(t0, Some(b'F'), None);
        c.tick(ms(t0, 400), None, None);
        c.tick(ms(t0, 450), Some(b'L'), None);
        c.tick(ms(t0, 460), Some(b'S'), None);
        c.tick(ms(t0, 800), None, None);
        assert_eq!(c.motion(), MotionState::Stopped);
        assert_eq!(c.state().pending, None);
    }

    #[test]
    fn search_uses_slow_burst_and_long_pause() {
        let mut c = controller();
        let t0 = Instant::now();
        c.tick(t0, Some(b'X'), None);
        assert_eq!(c.motion(), MotionState::Right);
        assert_eq!(c.state().pace, Pace::Search);

        c.tick(ms(t0, 250), None, None);
        assert_eq!(c.motion(), MotionState::Stopped);
        c.tick(ms(t0, 260), Some(b'X'), None);
        c.tick(ms(t0, 1149), None, None);
        assert_eq!(c.motion(), MotionState::Stopped);
        c.tick(ms(t0, 1150), None, None);
        assert_eq!(c.motion(), MotionState::Right);
    }

    #[test]
    fn acks_echo_the_command_and_naks_leave_state_alone() {
        let mut c = controller();
        let t0 = Instant::now();
        for cmd in Command::ALL {
            let reply = c.tick(t0, Some(cmd.as_byte()), None);
            assert_eq!(reply, Some(Reply::Ack(cmd)));
            assert_eq!(reply.unwrap().to_line(), format!("ACK:{}\n", cmd.as_char()));
        }

        let mut c = controller();
        c.tick(t0, Some(b'L'), None);
        let before = c.state().clone();
        let reply = c.tick(ms(t0, 10), Some(b'?'), None);
        assert_eq!(reply, Some(Reply::Nak(b'?')));
        assert_eq!(reply.unwrap().to_line(), "NAK:?\n");
        assert_eq!(c.motion(), before.motion);
        assert_eq!(c.state().phase, before.phase);
    }

    #[test]
    fn invalid_readings_never_trigger_override() {
        let mut c = controller();
        let t0 = Instant::now();
        c.tick(t0, Some(b'F'), Some(DistanceSample::invalid(Validity::NoEcho, 400.0)));
        c.tick(ms(t0, 40), None, Some(DistanceSample::invalid(Validity::OutOfRange, 400.0)));
        assert_eq!(c.motion(), MotionState::Forward);
        assert!(!c.obstacle_override_active());
    }

    #[test]
    fn invalid_readings_hold_the_override() {
        let mut c = controller();
        let t0 = Instant::now();
        c.tick(t0, None, near(10.0));
        // something closer than the trusted minimum reads as out of range
        c.tick(ms(t0, 40), None, Some(DistanceSample::invalid(Validity::OutOfRange, 400.0)));
        c.tick(ms(t0, 80), None, Some(DistanceSample::invalid(Validity::NoEcho, 400.0)));
        c.tick(ms(t0, 200), None, Some(DistanceSample::invalid(Validity::OutOfRange, 400.0)));
        assert!(c.obstacle_override_active());
        assert_eq!(c.motion(), MotionState::Backward);

        c.tick(ms(t0, 205), Some(b'F'), None);
        assert_eq!(c.motion(), MotionState::Backward);

        // an invalid reading after the window opened does not release either
        c.tick(ms(t0, 240), None, near(60.0));
        c.tick(ms(t0, 280), None, Some(DistanceSample::invalid(Validity::OutOfRange, 400.0)));
        assert!(c.obstacle_override_active());

        c.tick(ms(t0, 320), None, near(60.0));
        assert!(!c.obstacle_override_active());
        assert_eq!(c.motion(), MotionState::Stopped);
    }

    #[test]
    fn lost_sensor_stops_and_refuses_directions() {
        let mut c = controller();
        let t0 = Instant::now();
        c.tick(t0, Some(b'F'), far());
        assert_eq!(c.motion(), MotionState::Forward);

        c.on_sensor_lost();
        assert_eq!(c.motion(), MotionState::Stopped);
        assert_eq!(c.latest_sample(), None);

        assert_eq!(
            c.tick(ms(t0, 10), Some(b'F'), None),
            Some(Reply::Ack(Command::Forward))
        );
        c.tick(ms(t0, 20), Some(b'X'), None);
        assert_eq!(c.motion(), MotionState::Stopped);
        assert_eq!(c.state().phase, Phase::Idle);

        assert_eq!(
            c.tick(ms(t0, 30), Some(b'S'), None),
            Some(Reply::Ack(Command::Stop))
        );
        assert_eq!(c.motion(), MotionState::Stopped);
    }

    #[test]
    fn lost_sensor_ends_a_blind_override() {
        let mut c = controller();
        let t0 = Instant::now();
        c.tick(t0, None, near(20.0));
        assert_eq!(c.motion(), MotionState::Backward);

        c.on_sensor_lost();
        c.tick(ms(t0, 40), None, None);
        assert_eq!(c.motion(), MotionState::Stopped);
        assert!(!c.obstacle_override_active());
    }
}
