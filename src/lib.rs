//! # swr-cache
//!
//! State-while-revalidate client cache for a REST + server-push API.
//!
//! Reads are answered from a local, persistent copy of every table right away. A network refresh runs alongside and
//! reports what it changed through an event channel. Two ideas keep the notification volume sane:
//!
//! - Records are compared by [structural hash](hash_diff::structural_hash), so a payload that merely lists its keys in
//!   a different order is not a change.
//! - A [`DatasetComparator`](hash_diff::DatasetComparator) gives up on per-record events once more than a few records
//!   differ and the table is reported as changed as a whole instead.
//!
//! # The Basics
//!
//! - A [`Store`] owns a [`TableSet`](table::TableSet), a [`Fetcher`](network::Fetcher) for the REST side, an optional
//!   [`PushSource`](network::PushSource) for server push, and a [`LocalStorage`](storage::LocalStorage).
//! - [`Store::get_all()`] and [`Store::get()`] never wait for the network unless asked to with
//!   [`GetOptions::force`](types::GetOptions::force) on an empty local copy.
//! - A refreshed locator stays fresh for the configured expiry window. Concurrent refreshes of one locator share one
//!   fetch.
//! - Tables can be blocked from refreshing: in demo mode, when they are [virtual](table::VirtualResolver), or while
//!   they carry injected rows.
//! - [`Store::reconnect()`] preloads the tables marked for it and opens the push stream.
//!
//! When the store must live on another task, [`Worker::spawn()`](worker::Worker::spawn) puts it behind a
//! [`Connector`](transport::Connector), which correlates requests and replies by id.

pub mod error;
pub mod hash_diff;
pub mod network;
pub mod realtime;
pub mod set_diff;
pub mod storage;
pub mod store;
pub mod table;
pub mod transport;
pub mod types;
pub mod worker;

#[doc(inline)]
pub use error::SwrError;
#[doc(inline)]
pub use store::Store;

pub mod prelude {
    pub use crate::error::FetchError;
    pub use crate::error::Result;
    pub use crate::error::SwrError;
    pub use crate::network::Fetcher;
    pub use crate::network::PushSource;
    pub use crate::network::PushStream;
    pub use crate::realtime::PushMessage;
    pub use crate::storage::FileStorage;
    pub use crate::storage::LocalStorage;
    pub use crate::storage::MemoryStorage;
    pub use crate::store::Store;
    pub use crate::table::KeyField;
    pub use crate::table::TableConfig;
    pub use crate::table::TableDescriptor;
    pub use crate::table::TableSet;
    pub use crate::transport::Connector;
    pub use crate::types::*;
    pub use crate::worker::Worker;
}
