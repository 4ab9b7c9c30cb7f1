// Subject geometry -> directional intent
//
// Lateral offset first (turn toward the subject outside the dead-zone), then
// apparent size (approach when small, hold when large). Output is rate
// limited per command class; only commands that were actually handed to the
// relay count against the limit. When the subject has been gone for the search
// timeout, the synthesizer emits Search at a slow cadence, gives up after the
// maximum search duration, rests, and tries again.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::SynthesizerConfig;
use crate::messages::{Command, TrackedSubject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Tracking,
    Searching { since: Instant },
    Resting { until: Instant },
}

pub struct CommandSynthesizer {
    config: SynthesizerConfig,
    last_seen: Instant,
    last_sent: Option<(Command, Instant)>,
    search: SearchState,
}

impl CommandSynthesizer {
    /// The search timeout counts from `now` until a subject is first seen.
    pub fn new(config: SynthesizerConfig, now: Instant) -> Self {
        Self {
            config,
            last_seen: now,
            last_sent: None,
            search: SearchState::Tracking,
        }
    }

    pub fn search_state(&self) -> SearchState {
        self.search
    }

    /// Heuristic only, without rate limiting or search.
    pub fn decide(&self, subject: &TrackedSubject) -> Command {
        let offset = subject.lateral_offset();
        if offset.abs() > self.config.lateral_deadzone_px {
            return if offset > 0.0 {
                Command::Right
            } else {
                Command::Left
            };
        }

        let area = subject.area_fraction();
        if area < self.config.min_area_fraction {
            Command::Forward
        } else if area > self.config.max_area_fraction && self.config.back_off_when_close {
            Command::Backward
        } else {
            Command::Stop
        }
    }

    /// Feed one processed frame. Returns the command to send now, if any; call
    /// `record_sent` once it has really gone out.
    pub fn observe(&mut self, now: Instant, subject: Option<&TrackedSubject>) -> Option<Command> {
        match subject {
            Some(subject) if subject.is_degenerate() => {
                debug!("Ignoring frame with empty dimensions");
                None
            }
            Some(subject) => {
                self.last_seen = now;
                if self.search != SearchState::Tracking {
                    info!("Subject reacquired");
                    self.search = SearchState::Tracking;
                }
                let cmd = self.decide(subject);
                self.admit(now, cmd)
            }
            None => self.on_subject_missing(now),
        }
    }

    fn on_subject_missing(&mut self, now: Instant) -> Option<Command> {
        match self.search {
            SearchState::Tracking => {
                if now.saturating_duration_since(self.last_seen) < self.config.search_timeout {
                    return None;
                }
                info!(
                    "No subject for {:?}, searching",
                    now.saturating_duration_since(self.last_seen)
                );
                self.search = SearchState::Searching { since: now };
                self.admit(now, Command::Search)
            }
            SearchState::Searching { since } => {
                if now.saturating_duration_since(since) >= self.config.search_max_duration {
                    info!("Search gave up, resting for {:?}", self.config.search_rest);
                    self.search = SearchState::Resting {
                        until: now + self.config.search_rest,
                    };
                    return self.admit(now, Command::Stop);
                }
                self.admit(now, Command::Search)
            }
            SearchState::Resting { until } => {
                if now < until {
                    return None;
                }
                info!("Resuming search");
                self.search = SearchState::Searching { since: now };
                self.admit(now, Command::Search)
            }
        }
    }

    fn interval_for(&self, cmd: Command) -> Duration {
        match cmd {
            Command::Forward | Command::Backward | Command::Stop => self.config.forward_interval,
            Command::Left | Command::Right => self.config.turn_interval,
            Command::Search => self.config.search_interval,
        }
    }

    fn admit(&self, now: Instant, cmd: Command) -> Option<Command> {
        if let Some((last, at)) = self.last_sent {
            if cmd == Command::Stop && last == Command::Stop {
                return None;
            }
            if now.saturating_duration_since(at) < self.interval_for(cmd) {
                return None;
            }
        }
        Some(cmd)
    }

    /// `cmd` was handed to the relay at `now`.
    pub fn record_sent(&mut self, now: Instant, cmd: Command) {
        self.last_sent = Some((cmd, now));
    }

    /// The relay did not carry out `cmd`. A failed Stop must not suppress the
    /// next one; other commands recover once their interval passes.
    pub fn record_failed(&mut self, cmd: Command) {
        if cmd == Command::Stop && matches!(self.last_sent, Some((Command::Stop, _))) {
            self.last_sent = None;
        }
    }
}
