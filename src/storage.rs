//! Local persistent tables.
//!
//! A storage keeps one keyed table per resource plus the layout version. Every trait method is a single transaction:
//! either it is fully applied or, when it fails, the previous state stays visible.

pub mod file;

use crate::error::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tokio::sync::RwLock;
use tracing::info;

#[doc(inline)]
pub use file::FileStorage;

pub type Table = BTreeMap<String, Value>;

#[async_trait]
pub trait LocalStorage: Debug + Send + Sync + 'static {
    /// Prepare the tables. A version different from the stored one wipes and recreates everything.
    async fn open(&self, tables: &[String], version: u32) -> Result<()>;
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>>;
    async fn get_all(&self, table: &str) -> Result<Vec<Value>>;
    /// Insert or replace a record. Returns the record it replaced.
    async fn put(&self, table: &str, key: &str, record: Value) -> Result<Option<Value>>;
    /// Set a single field of an existing record. Returns the patched record or `None` if there was nothing to patch.
    async fn patch(&self, table: &str, key: &str, field: &str, value: Value) -> Result<Option<Value>>;
    /// Returns the removed record, `None` if it didn't exist.
    async fn delete(&self, table: &str, key: &str) -> Result<Option<Value>>;
    async fn replace_all(&self, table: &str, records: Vec<(String, Value)>) -> Result<()>;
    /// Replace the content of several tables at once.
    async fn fill(&self, tables: BTreeMap<String, Vec<(String, Value)>>) -> Result<()>;
    async fn table_names(&self) -> Result<Vec<String>>;
    async fn version(&self) -> Result<u32>;
}

/// The whole persisted state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    pub version: u32,
    pub tables:  BTreeMap<String, Table>,
}

impl Layout {
    /// Returns `true` if the layout had to be wiped.
    pub(crate) fn open(&mut self, tables: &[String], version: u32) -> bool {
        let wiped = self.version != version;
        if wiped {
            info!(
                "Local layout version changed from {} to {version}, recreating tables",
                self.version
            );
            self.tables.clear();
            self.version = version;
        }
        for name in tables {
            self.tables.entry(name.clone()).or_default();
        }
        wiped
    }

    pub(crate) fn get(&self, table: &str, key: &str) -> Option<Value> {
        self.tables.get(table).and_then(|t| t.get(key)).cloned()
    }

    pub(crate) fn get_all(&self, table: &str) -> Vec<Value> {
        self.tables
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn put(&mut self, table: &str, key: &str, record: Value) -> Option<Value> {
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), record)
    }

    pub(crate) fn patch(&mut self, table: &str, key: &str, field: &str, value: Value) -> Option<Value> {
        let record = self.tables.get_mut(table)?.get_mut(key)?;
        match record {
            Value::Object(map) => {
                map.insert(field.to_string(), value);
            }
            _ => return None,
        }
        Some(record.clone())
    }

    pub(crate) fn delete(&mut self, table: &str, key: &str) -> Option<Value> {
        self.tables.get_mut(table)?.remove(key)
    }

    pub(crate) fn replace_all(&mut self, table: &str, records: Vec<(String, Value)>) {
        self.tables.insert(table.to_string(), records.into_iter().collect());
    }

    pub(crate) fn fill(&mut self, tables: BTreeMap<String, Vec<(String, Value)>>) {
        for (table, records) in tables {
            self.replace_all(&table, records);
        }
    }
}

/// Process-local storage. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    layout: RwLock<Layout>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Layout {
        self.layout.read().await.clone()
    }
}

#[async_trait]
impl LocalStorage for MemoryStorage {
    async fn open(&self, tables: &[String], version: u32) -> Result<()> {
        self.layout.write().await.open(tables, version);
        Ok(())
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.layout.read().await.get(table, key))
    }

    async fn get_all(&self, table: &str) -> Result<Vec<Value>> {
        Ok(self.layout.read().await.get_all(table))
    }

    async fn put(&self, table: &str, key: &str, record: Value) -> Result<Option<Value>> {
        Ok(self.layout.write().await.put(table, key, record))
    }

    async fn patch(&self, table: &str, key: &str, field: &str, value: Value) -> Result<Option<Value>> {
        Ok(self.layout.write().await.patch(table, key, field, value))
    }

    async fn delete(&self, table: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.layout.write().await.delete(table, key))
    }

    async fn replace_all(&self, table: &str, records: Vec<(String, Value)>) -> Result<()> {
        self.layout.write().await.replace_all(table, records);
        Ok(())
    }

    async fn fill(&self, tables: BTreeMap<String, Vec<(String, Value)>>) -> Result<()> {
        self.layout.write().await.fill(tables);
        Ok(())
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        Ok(self.layout.read().await.tables.keys().cloned().collect())
    }

    async fn version(&self) -> Result<u32> {
        Ok(self.layout.read().await.version)
    }
}
