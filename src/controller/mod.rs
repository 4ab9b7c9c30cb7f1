// On-board motion controller
//
// Provides:
// - Obstacle sensor loop (ranging, filtering, single-slot publication)
// - Motion state machine (safety override, timed bursts, ack/nak)
// - Cooperative control loop bound to the host serial link

pub mod drivetrain;
pub mod runtime;
pub mod sensor;
mod state_machine;

pub use drivetrain::{Drivetrain, LoggingDrivetrain, Pace};
pub use sensor::{DistanceSample, ObstacleSensor, RangeFinder, SimulatedRangeFinder, Validity};
pub use state_machine::{ControllerState, MotionController, Phase, Reply};
