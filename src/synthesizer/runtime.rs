// Vision frames in, intents out
//
// Frames arrive on a Zenoh topic. Each decided command is handed to a
// background send with a bounded timeout; the frame loop never waits on the
// relay. Only one send may be outstanding, later commands are dropped until
// it finishes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use zenoh::Session;

use super::heuristic::CommandSynthesizer;
use crate::config::{SynthesizerConfig, TOPIC_VISION_SUBJECT};
use crate::messages::{Command, TrackedSubject};
use crate::relay::service::request_intent;

/// Without any frame for this long, the subject counts as missing
const FRAME_GAP: Duration = Duration::from_secs(1);

/// How often the frame gap is checked; fine enough that Search keeps its
/// configured cadence when no frames arrive at all
const WATCHDOG_PERIOD: Duration = Duration::from_millis(250);

/// Allows a single in-flight send.
#[derive(Clone, Default)]
pub struct SendGate(Arc<AtomicBool>);

impl SendGate {
    /// Claim the gate; `None` if a send is already outstanding.
    pub fn try_acquire(&self) -> Option<SendPermit> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SendPermit(Arc::clone(&self.0)))
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Releases the gate when dropped.
pub struct SendPermit(Arc<AtomicBool>);

impl Drop for SendPermit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Decode a frame payload: a subject object, or JSON `null` for "none".
pub fn parse_frame(payload: &[u8]) -> Result<Option<TrackedSubject>, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Start a background send. Returns false when the command was dropped
/// because another send is still outstanding; delivery failures are reported
/// on `failed`.
fn dispatch(
    session: &Session,
    gate: &SendGate,
    failed: &mpsc::UnboundedSender<Command>,
    cmd: Command,
    timeout: Duration,
) -> bool {
    let Some(permit) = gate.try_acquire() else {
        debug!("Send in flight, dropping {}", cmd);
        return false;
    };

    let session = session.clone();
    let failed = failed.clone();
    tokio::spawn(async move {
        let _permit = permit;
        match request_intent(&session, cmd, timeout).await {
            Ok(response) if response.ok => {
                debug!("Relay accepted {}", cmd);
                return;
            }
            Ok(response) => debug!(
                "Relay refused {}: {:?} {}",
                cmd,
                response.reason,
                response.detail.unwrap_or_default()
            ),
            Err(e) => debug!("Dropping {}: {}", cmd, e),
        }
        let _ = failed.send(cmd);
    });
    true
}

pub async fn run(config: SynthesizerConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let frames = session.declare_subscriber(TOPIC_VISION_SUBJECT).await?;

    let send_timeout = config.send_timeout;
    let mut synth = CommandSynthesizer::new(config, Instant::now());
    let gate = SendGate::default();
    let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();

    let mut watchdog = interval(WATCHDOG_PERIOD);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_frame = Instant::now();

    info!("Following subject from {}", TOPIC_VISION_SUBJECT);

    loop {
        let decided = tokio::select! {
            sample = frames.recv_async() => {
                let sample = sample?;
                last_frame = Instant::now();
                match parse_frame(&sample.payload().to_bytes()) {
                    Ok(subject) => synth.observe(last_frame, subject.as_ref()),
                    Err(e) => {
                        warn!("Failed to parse frame: {}", e);
                        None
                    }
                }
            }
            _ = watchdog.tick() => {
                if last_frame.elapsed() >= FRAME_GAP {
                    synth.observe(Instant::now(), None)
                } else {
                    None
                }
            }
            Some(cmd) = failed_rx.recv() => {
                synth.record_failed(cmd);
                None
            }
        };

        if let Some(cmd) = decided {
            if dispatch(&session, &gate, &failed_tx, cmd, send_timeout) {
                synth.record_sent(Instant::now(), cmd);
            }
        }
    }
}
