//! Request/response correlation across a task boundary.
//!
//! The [`Connector`] is the calling side. It numbers every outgoing [`Command`], keeps a pending entry per request
//! and matches replies by id, so replies may arrive in any order. Messages without an id are push notifications;
//! they are re-broadcast to subscribers and the two connection-state notifications update the connector itself.

use crate::error::Result;
use crate::error::SwrError;
use crate::types::Dump;
use crate::types::GetOptions;
use fieldx_plus::fx_plus;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;
use strum::AsRefStr;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

pub const CONNECTION_LOST: &str = "connectionLost";
pub const CONNECTION_ESTABLISHED: &str = "connectionEstablished";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, AsRefStr)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum Command {
    Get {
        table:   String,
        #[serde(default)]
        id:      Option<String>,
        #[serde(default)]
        options: GetOptions,
    },
    GetAll {
        table:   String,
        #[serde(default)]
        options: GetOptions,
    },
    Configure {
        expiry_ms:   u64,
        throttle_ms: u64,
    },
    Reconnect {
        host: String,
    },
    Dump,
    InjectRow {
        table: String,
        data:  Value,
    },
    RemoveInjectedRows,
}

impl Command {
    pub fn kind(&self) -> &str {
        self.as_ref()
    }
}

/// A numbered command on its way to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id:      u64,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushNotification {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload:    Value,
}

/// Anything the worker sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    #[serde(rename_all = "camelCase")]
    Response { id: u64, result: Value, is_error: bool },
    Push(PushNotification),
}

/// The last connection failure reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    pub code:    Option<u16>,
    pub message: String,
}

#[derive(Debug)]
struct PendingRequest {
    kind:       String,
    created_at: Instant,
    reply:      oneshot::Sender<Result<Value>>,
}

#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`Connector`].", "", "See [`Connector::builder()`] method."),
        method_doc("Implement builder pattern for [`Connector`]."),
    )
)]
pub struct Connector {
    #[fieldx(private, get, builder(vis(pub), required))]
    outbound: mpsc::UnboundedSender<Envelope>,

    /// How long a request may stay unanswered.
    #[fieldx(get(copy), default(Duration::from_millis(5000)))]
    request_timeout: Duration,

    #[fieldx(get(copy), default(64))]
    notification_capacity: usize,

    #[fieldx(lock, private, get(copy), get_mut, builder(off), default(0))]
    last_id: u64,

    #[fieldx(inner_mut, private, get, get_mut, builder(off), default(HashMap::new()))]
    pending: HashMap<u64, PendingRequest>,

    #[fieldx(lock, private, get(copy), set, builder(off), default(false))]
    connected: bool,

    #[fieldx(lock, private, get(clone), set, builder(off), default(None))]
    last_error: Option<ConnectionError>,

    #[fieldx(lazy, private, get(clone), builder(off))]
    notifications: broadcast::Sender<PushNotification>,
}

impl Connector {
    fn build_notifications(&self) -> broadcast::Sender<PushNotification> {
        broadcast::channel(self.notification_capacity().max(1)).0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushNotification> {
        self.notifications().subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected()
    }

    pub fn last_connection_error(&self) -> Option<ConnectionError> {
        self.last_error()
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    fn next_id(&self) -> u64 {
        let mut last_id = self.last_id_mut();
        *last_id += 1;
        *last_id
    }

    /// Send a command and wait for its reply.
    ///
    /// Fails with [`SwrError::Timeout`] if no reply arrives within [`request_timeout`](Self::request_timeout). A
    /// reply arriving after that is dropped.
    pub async fn send(&self, command: Command) -> Result<Value> {
        let kind = command.kind().to_string();
        let id = self.next_id();
        let (reply, response) = oneshot::channel();

        self.pending_mut().insert(
            id,
            PendingRequest {
                kind: kind.clone(),
                created_at: Instant::now(),
                reply,
            },
        );

        // Forgets the request on every exit, including the caller dropping this future.
        let _guard = PendingGuard { connector: self, id };

        if self.outbound().send(Envelope { id, command }).is_err() {
            return Err(SwrError::TransportClosed);
        }

        match tokio::time::timeout(self.request_timeout(), response).await {
            Ok(Ok(result)) => result,
            // The pending entry was dropped because the inbound side went away.
            Ok(Err(_)) => Err(SwrError::TransportClosed),
            Err(_) => {
                warn!("Request #{id} '{kind}' timed out");
                Err(SwrError::Timeout { kind })
            }
        }
    }

    /// Process a message from the worker.
    pub fn handle(&self, message: WorkerMessage) {
        match message {
            WorkerMessage::Response { id, result, is_error } => {
                let Some(pending) = self.pending_mut().remove(&id)
                else {
                    debug!("Dropping reply to unknown or expired request #{id}");
                    return;
                };
                debug!(
                    "Request #{id} '{}' answered in {:?}",
                    pending.kind,
                    pending.created_at.elapsed()
                );
                let result = if is_error {
                    Err(SwrError::Remote {
                        message: match result {
                            Value::String(message) => message,
                            other => other.to_string(),
                        },
                        kind:    pending.kind,
                    })
                }
                else {
                    Ok(result)
                };
                // The caller may have given up already.
                let _ = pending.reply.send(result);
            }
            WorkerMessage::Push(notification) => {
                match notification.event_type.as_str() {
                    CONNECTION_LOST => {
                        self.set_connected(false);
                        self.set_last_error(Some(ConnectionError {
                            code:    notification
                                .payload
                                .get("code")
                                .and_then(Value::as_u64)
                                .and_then(|c| u16::try_from(c).ok()),
                            message: notification
                                .payload
                                .get("message")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                        }));
                    }
                    CONNECTION_ESTABLISHED => {
                        self.set_connected(true);
                        self.set_last_error(None);
                    }
                    _ => (),
                }
                let _ = self.notifications().send(notification);
            }
        }
    }

    /// Consume worker messages until the channel closes. Requests still pending at that point fail with
    /// [`SwrError::TransportClosed`].
    pub async fn listen(&self, mut inbound: mpsc::UnboundedReceiver<WorkerMessage>) {
        while let Some(message) = inbound.recv().await {
            self.handle(message);
        }
        debug!("Worker channel closed, failing {} pending requests", self.pending_count());
        self.pending_mut().clear();
    }

    pub async fn get(&self, table: &str, id: Option<&str>, options: GetOptions) -> Result<Option<Value>> {
        let value = self
            .send(Command::Get {
                table: table.to_string(),
                id: id.map(str::to_string),
                options,
            })
            .await?;
        Ok((!value.is_null()).then_some(value))
    }

    pub async fn get_all(&self, table: &str, options: GetOptions) -> Result<Vec<Value>> {
        let value = self
            .send(Command::GetAll {
                table: table.to_string(),
                options,
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn configure(&self, expiry: Duration, throttle: Duration) -> Result<()> {
        self.send(Command::Configure {
            expiry_ms:   expiry.as_millis() as u64,
            throttle_ms: throttle.as_millis() as u64,
        })
        .await?;
        Ok(())
    }

    pub async fn reconnect(&self, host: &str) -> Result<()> {
        self.send(Command::Reconnect { host: host.to_string() }).await?;
        Ok(())
    }

    pub async fn dump(&self) -> Result<Dump> {
        Ok(serde_json::from_value(self.send(Command::Dump).await?)?)
    }

    pub async fn inject_row(&self, table: &str, data: Value) -> Result<()> {
        self.send(Command::InjectRow {
            table: table.to_string(),
            data,
        })
        .await?;
        Ok(())
    }

    pub async fn remove_injected_rows(&self) -> Result<()> {
        self.send(Command::RemoveInjectedRows).await?;
        Ok(())
    }
}

struct PendingGuard<'a> {
    connector: &'a Connector,
    id:        u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.connector.pending_mut().remove(&self.id).is_some() {
            debug!("Request #{} abandoned before its reply", self.id);
        }
    }
}
