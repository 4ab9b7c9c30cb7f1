pub mod config;
pub mod controller;
pub mod messages;
pub mod relay;
pub mod synthesizer;
