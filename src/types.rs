use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use strum::AsRefStr;

/// Notifications produced by the store. Subscribers should treat them as invalidation hints: events for different
/// tables are not ordered relative to each other and a push may race a bulk refresh of the same table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, AsRefStr)]
#[serde(tag = "type", rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum StoreEvent {
    /// The table content was replaced wholesale.
    ResourceChanged { table: String, items: Vec<Value> },
    ItemChanged { table: String, value: Value },
    ItemAdded { table: String, value: Value },
    /// `value` is the removed record when it was still present locally.
    ItemRemoved {
        table: String,
        key:   String,
        value: Option<Value>,
    },
    ConnectionLost { code: u16, message: String },
    ConnectionEstablished,
    DumpProgress { table: String, done: usize, total: usize },
}

impl StoreEvent {
    pub fn kind(&self) -> &str {
        self.as_ref()
    }

    pub fn table(&self) -> Option<&str> {
        match self {
            Self::ResourceChanged { table, .. }
            | Self::ItemChanged { table, .. }
            | Self::ItemAdded { table, .. }
            | Self::ItemRemoved { table, .. }
            | Self::DumpProgress { table, .. } => Some(table),
            Self::ConnectionLost { .. } | Self::ConnectionEstablished => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "↑")]
    Ascending,
    #[serde(rename = "↓")]
    Descending,
}

/// Per-call options of [`Store::get()`](crate::Store::get) and [`Store::get_all()`](crate::Store::get_all).
///
/// Only `force` is interpreted by the store. The rest is carried for list adapters that filter, sort and limit the
/// raw result themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetOptions {
    /// When the local copy is empty, wait for the network instead of returning nothing.
    pub force:     bool,
    pub filter:    Option<String>,
    pub sort:      Option<String>,
    pub direction: Option<Direction>,
    pub limit:     Option<usize>,
}

impl GetOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }
}

/// Why a table or record is served from the local copy only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockReason {
    /// Demo/offline mode is active.
    Offline,
    /// The table is derived from other tables.
    Virtual,
    /// The table or record carries injected rows.
    Injected,
}

/// Exportable copy of the whole local database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dump {
    pub exported_at:    DateTime<Utc>,
    pub layout_version: u32,
    pub tables:         BTreeMap<String, Vec<Value>>,
}
