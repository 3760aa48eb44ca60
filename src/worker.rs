use crate::error::Result;
use crate::error::SwrError;
use crate::store::Store;
use crate::transport::Command;
use crate::transport::Connector;
use crate::transport::ConnectorBuilder;
use crate::transport::Envelope;
use crate::transport::PushNotification;
use crate::transport::WorkerMessage;
use crate::types::StoreEvent;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

/// The background side of a [`Connector`].
///
/// Every command runs in its own task, so a slow `reconnect` doesn't hold up cache reads and replies go back in
/// completion order. Store events are forwarded as push notifications named after the event kind.
pub struct Worker {
    store:    Arc<Store>,
    outbound: mpsc::UnboundedSender<WorkerMessage>,
}

impl Worker {
    /// Start a worker over `store` and return the connector talking to it along with the worker task.
    pub fn spawn(store: Arc<Store>) -> Result<(Arc<Connector>, JoinHandle<()>)> {
        Self::start(store, Connector::builder())
    }

    pub fn spawn_with_timeout(store: Arc<Store>, request_timeout: Duration) -> Result<(Arc<Connector>, JoinHandle<()>)> {
        Self::start(store, Connector::builder().request_timeout(request_timeout))
    }

    fn start(store: Arc<Store>, builder: ConnectorBuilder) -> Result<(Arc<Connector>, JoinHandle<()>)> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let connector = builder
            .outbound(request_tx)
            .build()
            .map_err(|err| SwrError::Config(err.to_string()))?;

        let listener = Arc::clone(&connector);
        tokio::spawn(async move { listener.listen(message_rx).await });

        let worker = Self {
            store,
            outbound: message_tx,
        };
        Ok((connector, tokio::spawn(worker.run(request_rx))))
    }

    async fn run(self, mut requests: mpsc::UnboundedReceiver<Envelope>) {
        let mut events = self.store.subscribe();
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(envelope) => self.dispatch(envelope),
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(event) => self.forward(event),
                    Err(RecvError::Lagged(skipped)) => warn!("Worker missed {skipped} store events"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Worker stopped");
    }

    fn dispatch(&self, envelope: Envelope) {
        let store = Arc::clone(&self.store);
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let Envelope { id, command } = envelope;
            let message = match Self::execute(&store, command).await {
                Ok(result) => WorkerMessage::Response {
                    id,
                    result,
                    is_error: false,
                },
                Err(err) => WorkerMessage::Response {
                    id,
                    result: Value::String(err.to_string()),
                    is_error: true,
                },
            };
            if outbound.send(message).is_err() {
                debug!("Connector is gone, reply to #{id} dropped");
            }
        });
    }

    fn forward(&self, event: StoreEvent) {
        let notification = match serde_json::to_value(&event) {
            Ok(payload) => PushNotification {
                event_type: event.kind().to_string(),
                payload,
            },
            Err(err) => {
                warn!("Cannot serialize {} event: {err}", event.kind());
                return;
            }
        };
        let _ = self.outbound.send(WorkerMessage::Push(notification));
    }

    #[instrument(level = "debug", skip_all, fields(kind = command.kind()))]
    async fn execute(store: &Store, command: Command) -> Result<Value> {
        Ok(match command {
            Command::Get { table, id, options } => serde_json::to_value(store.get(&table, id.as_deref(), &options).await?)?,
            Command::GetAll { table, options } => serde_json::to_value(store.get_all(&table, &options).await?)?,
            Command::Configure {
                expiry_ms,
                throttle_ms,
            } => {
                store.configure(Duration::from_millis(expiry_ms), Duration::from_millis(throttle_ms));
                Value::Null
            }
            Command::Reconnect { host } => {
                store.reconnect(&host).await?;
                Value::Null
            }
            Command::Dump => serde_json::to_value(store.dump().await?)?,
            Command::InjectRow { table, data } => {
                store.inject_row(&table, data).await?;
                Value::Null
            }
            Command::RemoveInjectedRows => {
                store.remove_injected_rows().await?;
                Value::Null
            }
        })
    }
}
