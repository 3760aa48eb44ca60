use super::Layout;
use super::LocalStorage;
use crate::error::Result;
use crate::error::SwrError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::instrument;

/// Storage persisted as a JSON snapshot.
///
/// Mutations are applied to a copy of the layout which is written to a temporary file and renamed over the snapshot.
/// Only then the copy replaces the in-memory state. A failed write leaves both the file and the memory untouched.
#[derive(Debug)]
pub struct FileStorage {
    path:   PathBuf,
    layout: RwLock<Layout>,
}

impl FileStorage {
    /// Load the snapshot at `path`, or start empty if there is none.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let layout = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Layout::default(),
            Err(err) => return Err(err.into()),
        };
        debug!("Loaded local layout from {}", path.display());
        Ok(Self {
            path,
            layout: RwLock::new(layout),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, layout: &Layout) -> Result<()> {
        let bytes = serde_json::to_vec(layout)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| SwrError::Storage(format!("{}: {err}", self.path.display())))
    }

    #[instrument(level = "trace", skip(self, f))]
    async fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Layout) -> T + Send,
        T: Send,
    {
        let mut guard = self.layout.write().await;
        let mut next = guard.clone();
        let outcome = f(&mut next);
        self.persist(&next).await?;
        *guard = next;
        Ok(outcome)
    }
}

#[async_trait]
impl LocalStorage for FileStorage {
    async fn open(&self, tables: &[String], version: u32) -> Result<()> {
        self.transact(|layout| layout.open(tables, version)).await?;
        Ok(())
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.layout.read().await.get(table, key))
    }

    async fn get_all(&self, table: &str) -> Result<Vec<Value>> {
        Ok(self.layout.read().await.get_all(table))
    }

    async fn put(&self, table: &str, key: &str, record: Value) -> Result<Option<Value>> {
        self.transact(|layout| layout.put(table, key, record)).await
    }

    async fn patch(&self, table: &str, key: &str, field: &str, value: Value) -> Result<Option<Value>> {
        self.transact(|layout| layout.patch(table, key, field, value)).await
    }

    async fn delete(&self, table: &str, key: &str) -> Result<Option<Value>> {
        self.transact(|layout| layout.delete(table, key)).await
    }

    async fn replace_all(&self, table: &str, records: Vec<(String, Value)>) -> Result<()> {
        self.transact(|layout| layout.replace_all(table, records)).await
    }

    async fn fill(&self, tables: BTreeMap<String, Vec<(String, Value)>>) -> Result<()> {
        self.transact(|layout| layout.fill(tables)).await
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        Ok(self.layout.read().await.tables.keys().cloned().collect())
    }

    async fn version(&self) -> Result<u32> {
        Ok(self.layout.read().await.version)
    }
}
