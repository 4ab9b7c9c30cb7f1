// Command synthesizer: per-frame subject geometry -> rate-limited intents

pub mod heuristic;
pub mod runtime;

pub use heuristic::{CommandSynthesizer, SearchState};
