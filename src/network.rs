use crate::error::FetchError;
use crate::realtime::PushMessage;
use async_trait::async_trait;
use serde_json::Value;
use std::pin::Pin;
use tokio_stream::Stream;

/// Stream of server-push messages. Errors are transient; the source is expected to reconnect on its own.
pub type PushStream = Pin<Box<dyn Stream<Item = Result<PushMessage, FetchError>> + Send>>;

/// The REST side of the upstream API.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// Fetch `<host>/<locator>` and decode the JSON body.
    async fn fetch(&self, host: &str, locator: &str) -> Result<Value, FetchError>;
}

/// The server-push side of the upstream API.
#[async_trait]
pub trait PushSource: Send + Sync + 'static {
    async fn subscribe(&self, host: &str) -> Result<PushStream, FetchError>;
}

/// A fetcher for setups that never go online, e.g. demo mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct Offline;

#[async_trait]
impl Fetcher for Offline {
    async fn fetch(&self, host: &str, locator: &str) -> Result<Value, FetchError> {
        Err(FetchError::new(format!("Offline: cannot fetch {host}/{locator}")))
    }
}
