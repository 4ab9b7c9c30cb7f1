// Network surface of the relay
//
// Two Zenoh queryables: intent submission and status. Each query is answered
// on its own task, so a slow link round trip only delays its own caller.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use zenoh::Session;
use zenoh::query::Query;

use super::{CommandRelay, SerialConnector};
use crate::config::{KEY_RELAY_COMMAND, KEY_RELAY_STATUS, RelayConfig};
use crate::messages::{Command, FailureReason, IntentRequest, IntentResponse, StatusReport};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Zenoh error: {0}")]
    Zenoh(BoxError),

    #[error("No reply from relay within {}ms", .0.as_millis())]
    NoReply(Duration),

    #[error("Relay replied with an error: {0}")]
    ErrorReply(String),

    #[error("Undecodable reply: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Turn a raw intent payload into the response sent back to the caller.
pub async fn handle_intent(relay: &CommandRelay, payload: &[u8]) -> IntentResponse {
    let request = match serde_json::from_slice::<IntentRequest>(payload) {
        Ok(request) => request,
        Err(e) => {
            return IntentResponse::failed(
                FailureReason::InvalidCommand,
                format!("malformed request: {}", e),
            );
        }
    };

    match relay.submit_str(&request.command).await {
        Ok(ack) => IntentResponse::accepted(ack.command),
        Err(e) => IntentResponse::failed(e.reason(), e.to_string()),
    }
}

async fn answer_intent(relay: Arc<CommandRelay>, query: Query) {
    let payload = query
        .payload()
        .map(|p| p.to_bytes().into_owned())
        .unwrap_or_default();
    let response = handle_intent(&relay, &payload).await;
    if !response.ok {
        debug!("Intent refused: {:?}", response.reason);
    }
    reply_json(&query, &response).await;
}

async fn reply_json<T: serde::Serialize>(query: &Query, body: &T) {
    let json = match serde_json::to_string(body) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to encode reply: {}", e);
            return;
        }
    };
    if let Err(e) = query.reply(query.key_expr().clone(), json).await {
        warn!("Failed to reply on {}: {}", query.key_expr(), e);
    }
}

pub async fn run(config: RelayConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let connector = Arc::new(SerialConnector::new(&config));
    let relay = Arc::new(CommandRelay::new(connector, config));

    if !relay.connect().await {
        warn!("Controller link not found yet; will keep scanning");
    }
    let _monitor = relay.spawn_monitor();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let commands = session.declare_queryable(KEY_RELAY_COMMAND).await?;
    let status = session.declare_queryable(KEY_RELAY_STATUS).await?;

    info!("Relay serving {} and {}", KEY_RELAY_COMMAND, KEY_RELAY_STATUS);

    loop {
        tokio::select! {
            query = commands.recv_async() => {
                let query = query?;
                tokio::spawn(answer_intent(Arc::clone(&relay), query));
            }
            query = status.recv_async() => {
                let query = query?;
                reply_json(&query, &relay.status()).await;
            }
        }
    }
}

/// Submit one intent to a running relay and wait (bounded) for its verdict.
pub async fn request_intent(
    session: &Session,
    command: Command,
    timeout: Duration,
) -> Result<IntentResponse, ClientError> {
    let request = serde_json::to_string(&IntentRequest {
        command: command.to_string(),
    })?;
    query_json(session, KEY_RELAY_COMMAND, Some(request), timeout).await
}

pub async fn request_status(
    session: &Session,
    timeout: Duration,
) -> Result<StatusReport, ClientError> {
    query_json(session, KEY_RELAY_STATUS, None, timeout).await
}

async fn query_json<T: serde::de::DeserializeOwned>(
    session: &Session,
    key: &str,
    payload: Option<String>,
    timeout: Duration,
) -> Result<T, ClientError> {
    let get = session.get(key).timeout(timeout);
    let replies = match payload {
        Some(body) => get.payload(body).await,
        None => get.await,
    }
    .map_err(ClientError::Zenoh)?;

    let reply = match tokio::time::timeout(timeout, replies.recv_async()).await {
        Ok(Ok(reply)) => reply,
        _ => return Err(ClientError::NoReply(timeout)),
    };

    match reply.result() {
        Ok(sample) => Ok(serde_json::from_slice(&sample.payload().to_bytes())?),
        Err(e) => Err(ClientError::ErrorReply(format!("{:?}", e))),
    }
}
