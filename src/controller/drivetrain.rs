// Motor output seam for the motion controller

use tracing::info;

use crate::messages::MotionState;

/// How fast a motion state is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pace {
    #[default]
    Normal,
    /// Slow rotation used while scanning for a lost subject
    Search,
}

/// Anything that can put the motors into a directional state.
///
/// `apply` is called only on transitions and must return promptly; the
/// control loop never waits on the motors.
pub trait Drivetrain {
    fn apply(&mut self, state: MotionState, pace: Pace);
}

/// Bench drivetrain: logs each transition instead of driving pins.
#[derive(Debug, Default)]
pub struct LoggingDrivetrain {
    current: MotionState,
}

impl LoggingDrivetrain {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Drivetrain for LoggingDrivetrain {
    fn apply(&mut self, state: MotionState, pace: Pace) {
        info!("Motors: {:?} -> {:?} ({:?})", self.current, state, pace);
        self.current = state;
    }
}

/// Records every applied state.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingDrivetrain {
    pub applied: Vec<(MotionState, Pace)>,
}

#[cfg(test)]
impl Drivetrain for RecordingDrivetrain {
    fn apply(&mut self, state: MotionState, pace: Pace) {
        self.applied.push((state, pace));
    }
}
