// Command relay
//
// Bridges directional intents from the network to the serial link. All link
// I/O goes through a single async mutex, so submissions are serialized on the
// wire. Status lives behind its own lock and is only ever held for a copy, so
// a slow write never starves a status read.

pub mod link;
pub mod service;

use std::io;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::messages::{Command, CommandParseError, FailureReason, LinkReply, LinkStatus, StatusReport};
use link::{LinkConnector, LinkHandle};

pub use link::SerialConnector;

/// How often the background monitor drains telemetry
const MONITOR_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid command: {0}")]
    InvalidCommand(#[from] CommandParseError),

    #[error("Link to controller is down")]
    LinkDown,

    #[error("No acknowledgment for {command} within {}ms", .timeout.as_millis())]
    Timeout { command: Command, timeout: Duration },

    #[error("Controller rejected {command} (NAK:{detail})")]
    Rejected { command: Command, detail: String },
}

impl RelayError {
    pub fn reason(&self) -> FailureReason {
        match self {
            RelayError::InvalidCommand(_) => FailureReason::InvalidCommand,
            RelayError::LinkDown => FailureReason::LinkDown,
            RelayError::Timeout { .. } => FailureReason::Timeout,
            RelayError::Rejected { .. } => FailureReason::Rejected,
        }
    }
}

/// Successful round trip for one command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ack {
    pub command: Command,
    pub round_trip: Duration,
}

#[derive(Debug, Default)]
struct Snapshot {
    link: LinkStatus,
    last_command: Option<(Command, Instant)>,
    distance_cm: Option<f32>,
}

pub struct CommandRelay {
    link: Mutex<Option<LinkHandle>>,
    snapshot: RwLock<Snapshot>,
    connector: Arc<dyn LinkConnector>,
    config: RelayConfig,
}

impl CommandRelay {
    pub fn new(connector: Arc<dyn LinkConnector>, config: RelayConfig) -> Self {
        Self {
            link: Mutex::new(None),
            snapshot: RwLock::new(Snapshot::default()),
            connector,
            config,
        }
    }

    /// Parse and submit a textual intent (`"F"`, `"S"`, ...).
    pub async fn submit_str(&self, raw: &str) -> Result<Ack, RelayError> {
        let command: Command = raw.trim().parse()?;
        self.submit(command).await
    }

    /// Write one command to the controller and wait for its ack.
    ///
    /// Fails fast with `LinkDown` while disconnected. Concurrent callers queue
    /// on the link lock; their bytes are never interleaved.
    pub async fn submit(&self, command: Command) -> Result<Ack, RelayError> {
        if !self.link_status().is_connected() {
            return Err(RelayError::LinkDown);
        }

        let mut guard = self.link.lock().await;
        let timeout = self.config.ack_timeout;
        let started = Instant::now();
        let exchange = self
            .on_link(&mut guard, move |handle| handle.exchange(command, timeout))
            .await?;
        drop(guard);

        if let Some(cm) = exchange.distance {
            self.update(|s| s.distance_cm = cm);
        }

        match exchange.reply {
            Some(LinkReply::Ack(_)) => {
                let round_trip = started.elapsed();
                debug!("{} acknowledged in {:?}", command, round_trip);
                self.update(|s| s.last_command = Some((command, Instant::now())));
                Ok(Ack {
                    command,
                    round_trip,
                })
            }
            Some(LinkReply::Nak(detail)) => {
                warn!("Controller rejected {}: NAK:{}", command, detail);
                Err(RelayError::Rejected { command, detail })
            }
            _ => {
                warn!("No ack for {} within {:?}", command, timeout);
                Err(RelayError::Timeout { command, timeout })
            }
        }
    }

    pub fn link_status(&self) -> LinkStatus {
        self.read(|s| s.link.clone())
    }

    /// Link state, last acknowledged command and latest distance telemetry.
    pub fn status(&self) -> StatusReport {
        self.read(|s| StatusReport {
            link: s.link.clone(),
            last_command: s.last_command.map(|(cmd, _)| cmd),
            last_command_age_ms: s
                .last_command
                .map(|(_, at)| at.elapsed().as_millis() as u64),
            distance_cm: s.distance_cm,
        })
    }

    /// Try every candidate port once. Returns true when a link is open.
    pub async fn connect(&self) -> bool {
        let mut guard = self.link.lock().await;
        if guard.is_some() {
            return true;
        }

        let connector = Arc::clone(&self.connector);
        let opened = tokio::task::spawn_blocking(move || {
            for port in connector.candidates() {
                match connector.open(&port) {
                    Ok(io) => return Some(LinkHandle::new(port, io)),
                    Err(e) => debug!("Port {} unavailable: {}", port, e),
                }
            }
            None
        })
        .await
        .ok()
        .flatten();

        match opened {
            Some(handle) => {
                info!("Link connected on {}", handle.port());
                let port = handle.port().to_string();
                *guard = Some(handle);
                self.update(|s| s.link = LinkStatus::Connected(port));
                true
            }
            None => false,
        }
    }

    /// Background task: reconnect while the link is down, drain distance
    /// telemetry while it is idle.
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(MONITOR_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_attempt: Option<Instant> = None;

            loop {
                tick.tick().await;

                if !relay.link_status().is_connected() {
                    let due = last_attempt
                        .is_none_or(|at| at.elapsed() >= relay.config.reconnect_interval);
                    if due {
                        last_attempt = Some(Instant::now());
                        if !relay.connect().await {
                            debug!("No controller link found, retrying");
                        }
                    }
                    continue;
                }

                // Skip the drain if a submission currently owns the link
                let Ok(mut guard) = relay.link.try_lock() else {
                    continue;
                };
                if let Ok(Some(cm)) = relay.on_link(&mut guard, |h| h.drain_telemetry()).await {
                    relay.update(|s| s.distance_cm = cm);
                }
            }
        })
    }

    /// Run blocking link I/O off the async runtime. Any I/O failure drops the
    /// handle and marks the link down.
    async fn on_link<T, F>(
        &self,
        guard: &mut MutexGuard<'_, Option<LinkHandle>>,
        f: F,
    ) -> Result<T, RelayError>
    where
        T: Send + 'static,
        F: FnOnce(&mut LinkHandle) -> io::Result<T> + Send + 'static,
    {
        let Some(mut handle) = guard.take() else {
            self.mark_down();
            return Err(RelayError::LinkDown);
        };

        let joined = tokio::task::spawn_blocking(move || {
            let result = f(&mut handle);
            (handle, result)
        })
        .await;

        match joined {
            Ok((handle, Ok(value))) => {
                **guard = Some(handle);
                Ok(value)
            }
            Ok((handle, Err(e))) => {
                warn!("Link I/O error on {}: {}", handle.port(), e);
                self.mark_down();
                Err(RelayError::LinkDown)
            }
            Err(e) => {
                warn!("Link task failed: {}", e);
                self.mark_down();
                Err(RelayError::LinkDown)
            }
        }
    }

    fn mark_down(&self) {
        self.update(|s| {
            if s.link.is_connected() {
                warn!("Link disconnected");
            }
            s.link = LinkStatus::Disconnected;
        });
    }

    fn read<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> T {
        match self.snapshot.read() {
            Ok(s) => f(&*s),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn update(&self, f: impl FnOnce(&mut Snapshot)) {
        match self.snapshot.write() {
            Ok(mut s) => f(&mut *s),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}
