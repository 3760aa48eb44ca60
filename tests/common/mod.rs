#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use swr_cache::error::FetchError;
use swr_cache::error::SwrError;
use swr_cache::network::Fetcher;
use swr_cache::network::PushSource;
use swr_cache::network::PushStream;
use swr_cache::realtime::PushMessage;
use swr_cache::storage::LocalStorage;
use swr_cache::storage::MemoryStorage;
use swr_cache::table::TableDescriptor;
use swr_cache::table::TableSet;
use swr_cache::types::StoreEvent;
use swr_cache::Store;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;

/// Canned REST responses keyed by locator, with per-locator call counters.
#[derive(Debug, Default)]
pub struct MockFetcher {
    responses: Mutex<HashMap<String, Result<Value, FetchError>>>,
    calls:     Mutex<HashMap<String, usize>>,
    delay:     Duration,
}

impl MockFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn respond(&self, locator: &str, value: Value) {
        self.responses.lock().unwrap().insert(locator.to_string(), Ok(value));
    }

    pub fn fail(&self, locator: &str, err: FetchError) {
        self.responses.lock().unwrap().insert(locator.to_string(), Err(err));
    }

    pub fn calls(&self, locator: &str) -> usize {
        self.calls.lock().unwrap().get(locator).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, _host: &str, locator: &str) -> Result<Value, FetchError> {
        *self.calls.lock().unwrap().entry(locator.to_string()).or_insert(0) += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let response = self.responses.lock().unwrap().get(locator).cloned();
        response.unwrap_or_else(|| Err(FetchError::with_status(404, format!("No mock for {locator}"))))
    }
}

/// Delivers a fixed set of messages, then stays open forever.
#[derive(Debug, Default)]
pub struct MockPush {
    pub messages: Vec<PushMessage>,
}

#[async_trait]
impl PushSource for MockPush {
    async fn subscribe(&self, _host: &str) -> Result<PushStream, FetchError> {
        let stream = tokio_stream::iter(self.messages.clone().into_iter().map(Ok))
            .chain(tokio_stream::pending::<Result<PushMessage, FetchError>>());
        Ok(Box::pin(stream))
    }
}

/// Storage that refuses to open, as a browser does when the quota is gone. Everything else goes to memory.
#[derive(Debug, Default)]
pub struct UnopenableStorage {
    inner: MemoryStorage,
}

#[async_trait]
impl LocalStorage for UnopenableStorage {
    async fn open(&self, _tables: &[String], _version: u32) -> Result<(), SwrError> {
        Err(SwrError::Storage("quota exceeded".into()))
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>, SwrError> {
        self.inner.get(table, key).await
    }

    async fn get_all(&self, table: &str) -> Result<Vec<Value>, SwrError> {
        self.inner.get_all(table).await
    }

    async fn put(&self, table: &str, key: &str, record: Value) -> Result<Option<Value>, SwrError> {
        self.inner.put(table, key, record).await
    }

    async fn patch(&self, table: &str, key: &str, field: &str, value: Value) -> Result<Option<Value>, SwrError> {
        self.inner.patch(table, key, field, value).await
    }

    async fn delete(&self, table: &str, key: &str) -> Result<Option<Value>, SwrError> {
        self.inner.delete(table, key).await
    }

    async fn replace_all(&self, table: &str, records: Vec<(String, Value)>) -> Result<(), SwrError> {
        self.inner.replace_all(table, records).await
    }

    async fn fill(&self, tables: BTreeMap<String, Vec<(String, Value)>>) -> Result<(), SwrError> {
        self.inner.fill(tables).await
    }

    async fn table_names(&self) -> Result<Vec<String>, SwrError> {
        self.inner.table_names().await
    }

    async fn version(&self) -> Result<u32, SwrError> {
        self.inner.version().await
    }
}

pub fn things() -> TableDescriptor {
    TableDescriptor::rest("things", "rest/things").key("UID")
}

pub fn items() -> TableDescriptor {
    TableDescriptor::rest("items", "rest/items").key("name")
}

pub fn store(tables: Vec<TableDescriptor>, fetcher: Arc<MockFetcher>) -> (Arc<Store>, Arc<MemoryStorage>) {
    let memory = Arc::new(MemoryStorage::new());
    let storage: Arc<dyn LocalStorage> = memory.clone();
    let store = Store::builder()
        .tables(TableSet::new(tables).expect("Invalid table set"))
        .fetcher(fetcher)
        .storage(storage)
        .build()
        .expect("Failed to build store");
    (store, memory)
}

pub async fn next_event(events: &mut broadcast::Receiver<StoreEvent>) -> StoreEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("No event in time")
        .expect("Event channel closed")
}

pub fn drain(events: &mut broadcast::Receiver<StoreEvent>) -> Vec<StoreEvent> {
    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    received
}
