//! Push channel - realtime chat hub client
//!
//! The server emits the same event under several names. Names are mapped to a
//! fixed `EventKind` here; anything else is dropped at the boundary.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::RawMessage;
use crate::signalr::{self, HubFrame};
use crate::storage::Credentials;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Push channel state, feeds the online/offline indicator only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Known hub event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Message,
    UserOnline,
    UserOffline,
    StatusChanged,
}

impl EventKind {
    /// Exact-name mapping; unknown targets give `None`
    pub fn from_target(target: &str) -> Option<Self> {
        match target {
            "ReceiveMessage" | "NewMessage" | "MessageReceived" | "ReceivePrivateMessage" => {
                Some(EventKind::Message)
            }
            "UserOnline" | "UserConnected" => Some(EventKind::UserOnline),
            "UserOffline" | "UserDisconnected" => Some(EventKind::UserOffline),
            "UserStatusChanged" | "OnlineStatus" => Some(EventKind::StatusChanged),
            _ => None,
        }
    }
}

/// A decoded push event
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Message(RawMessage),
    Presence { user_id: String, online: bool },
}

/// Map an invocation to an event; `None` for unknown names or bad payloads
pub fn decode_event(target: &str, arguments: &[Value]) -> Option<HubEvent> {
    let Some(kind) = EventKind::from_target(target) else {
        debug!(event_name = target, "ignoring unknown hub event");
        return None;
    };

    let event = match kind {
        EventKind::Message => arguments
            .iter()
            .filter(|arg| arg.is_object())
            .find_map(|arg| serde_json::from_value::<RawMessage>(arg.clone()).ok())
            .map(HubEvent::Message),
        EventKind::UserOnline => id_arg(arguments.first()).map(|user_id| HubEvent::Presence {
            user_id,
            online: true,
        }),
        EventKind::UserOffline => id_arg(arguments.first()).map(|user_id| HubEvent::Presence {
            user_id,
            online: false,
        }),
        EventKind::StatusChanged => decode_status_change(arguments),
    };

    if event.is_none() {
        warn!(event_name = target, "hub event payload not understood");
    }
    event
}

fn decode_status_change(arguments: &[Value]) -> Option<HubEvent> {
    match arguments {
        [Value::Object(obj)] => {
            let user_id = id_arg(obj.get("userId"))?;
            let online = obj.get("isOnline").and_then(Value::as_bool)?;
            Some(HubEvent::Presence { user_id, online })
        }
        [id, Value::Bool(online), ..] => Some(HubEvent::Presence {
            user_id: id_arg(Some(id))?,
            online: *online,
        }),
        _ => None,
    }
}

fn id_arg(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Build the hub URL with the bearer token as `access_token`
pub fn hub_url(config: &Config, credentials: &Credentials) -> Result<Url> {
    let mut url = Url::parse(&config.hub_url)?;
    match url.scheme() {
        "ws" | "wss" => {}
        "http" => url
            .set_scheme("ws")
            .map_err(|_| Error::Config(format!("bad hub url {}", config.hub_url)))?,
        "https" => url
            .set_scheme("wss")
            .map_err(|_| Error::Config(format!("bad hub url {}", config.hub_url)))?,
        other => return Err(Error::Config(format!("unsupported hub scheme {}", other))),
    }
    url.query_pairs_mut()
        .append_pair("access_token", &credentials.token);
    Ok(url)
}

/// Handle to a running hub connection
pub struct HubConnection {
    pub events: mpsc::Receiver<HubEvent>,
    pub status: watch::Receiver<ConnectionStatus>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl HubConnection {
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Stop the reader task and wait for it
    pub async fn close(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "hub task ended abnormally");
        }
    }
}

/// Connects to the chat hub on a background task
pub struct HubClient;

impl HubClient {
    /// Spawn the connection; status starts at `Connecting`
    pub fn spawn(config: &Config, credentials: &Credentials) -> Result<HubConnection> {
        let url = hub_url(config, credentials)?;
        let join_method = config.hub_join_method.clone();
        let ping_interval = config.hub_ping_interval();
        let user_id = credentials.user_id.clone();

        let (event_tx, events) = mpsc::channel(64);
        let (status_tx, status) = watch::channel(ConnectionStatus::Connecting);
        let shutdown = CancellationToken::new();

        let task_shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = tokio::select! {
                _ = task_shutdown.cancelled() => Ok(()),
                result = run_connection(url, &join_method, &user_id, ping_interval, &event_tx, &status_tx) => result,
            };
            match result {
                Ok(()) => {
                    let _ = status_tx.send(ConnectionStatus::Disconnected);
                }
                Err(e) => {
                    error!(error = %e, "chat hub connection failed");
                    let _ = status_tx.send(ConnectionStatus::Failed);
                }
            }
        });

        Ok(HubConnection {
            events,
            status,
            shutdown,
            task,
        })
    }
}

async fn run_connection(
    url: Url,
    join_method: &str,
    user_id: &str,
    ping_interval: Duration,
    events: &mpsc::Sender<HubEvent>,
    status: &watch::Sender<ConnectionStatus>,
) -> Result<()> {
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (mut write, mut read) = ws.split();

    write
        .send(WsMessage::Text(signalr::handshake_request().into()))
        .await?;

    // The first text message answers the handshake and may carry frames too
    let leftover: Vec<String> = loop {
        match read.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                break signalr::parse_handshake_response(text.as_str())?
                    .into_iter()
                    .map(str::to_string)
                    .collect();
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(Error::Hub("closed during handshake".to_string()));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    };

    let join = signalr::encode_invocation(join_method, &[Value::String(user_id.to_string())], None)?;
    write.send(WsMessage::Text(join.into())).await?;

    let _ = status.send(ConnectionStatus::Connected);
    info!(user_id, "joined chat hub");

    for frame in &leftover {
        if !dispatch_frame(frame, events).await {
            return Ok(());
        }
    }

    // The server drops clients it has not heard from, so ping while idle
    let mut keepalive = tokio::time::interval(ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keepalive.tick().await;

    loop {
        tokio::select! {
            msg = read.next() => {
                let Some(msg) = msg else {
                    return Ok(());
                };
                match msg? {
                    WsMessage::Text(text) => {
                        for frame in signalr::split_frames(text.as_str()) {
                            if !dispatch_frame(frame, events).await {
                                return Ok(());
                            }
                        }
                    }
                    WsMessage::Close(_) => {
                        info!("chat hub closed by server");
                        return Ok(());
                    }
                    _ => {}
                }
            }
            _ = keepalive.tick() => {
                write.send(WsMessage::Text(signalr::encode_ping().into())).await?;
                debug!("hub keep-alive ping sent");
            }
        }
    }
}

/// Returns false when the connection should end
async fn dispatch_frame(payload: &str, events: &mpsc::Sender<HubEvent>) -> bool {
    match signalr::decode_frame(payload) {
        Ok(HubFrame::Invocation { target, arguments, .. }) => {
            if let Some(event) = decode_event(&target, &arguments) {
                if events.send(event).await.is_err() {
                    debug!("event receiver dropped, stopping hub reader");
                    return false;
                }
            }
            true
        }
        Ok(HubFrame::Close { error, allow_reconnect }) => {
            info!(?error, allow_reconnect, "hub sent close frame");
            false
        }
        Ok(HubFrame::Completion { invocation_id, error: Some(error), .. }) => {
            warn!(%invocation_id, %error, "hub invocation failed");
            true
        }
        Ok(_) => true,
        Err(e) => {
            warn!(error = %e, "undecodable hub frame");
            true
        }
    }
}
