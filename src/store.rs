use crate::error::ConnectionFailure;
use crate::error::FetchError;
use crate::error::Result;
use crate::error::SwrError;
use crate::hash_diff::DatasetComparator;
use crate::hash_diff::DEFAULT_UNEQUAL_THRESHOLD;
use crate::network::Fetcher;
use crate::network::PushSource;
use crate::network::PushStream;
use crate::realtime::PushAction;
use crate::realtime::PushEvent;
use crate::realtime::PushMessage;
use crate::realtime::PushRouter;
use crate::storage::LocalStorage;
use crate::table::Source;
use crate::table::TableDescriptor;
use crate::table::TableSet;
use crate::types::BlockReason;
use crate::types::Dump;
use crate::types::GetOptions;
use crate::types::StoreEvent;
use chrono::Utc;
use fieldx_plus::fx_plus;
use moka::future::Cache;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

// Presence of a locator means its last successful refresh is younger than the expiry window. The value is what that
// refresh produced; concurrent refreshes of a locator are coalesced by `try_get_with`.
type Ledger = Cache<String, Arc<Value>>;

enum Target {
    All,
    One(Option<String>),
}

// Releases the dump flag even if the dump future is dropped midway.
struct DumpGuard<'a>(&'a Store);

impl Drop for DumpGuard<'_> {
    fn drop(&mut self) {
        self.0.set_dumping(false);
    }
}

/// The state-while-revalidate engine.
///
/// Reads are served from the local storage right away. Unless the table is blocked or its last refresh is still
/// fresh, a network refresh is started in the background; its outcome is only observable through the event channel.
/// Callers that need the network result can await [`refresh_all()`](Self::refresh_all) or
/// [`refresh()`](Self::refresh) instead.
///
/// ```ignore
/// let store = Store::builder()
///     .tables(TableSet::new(vec![TableDescriptor::rest("things", "rest/things").key("UID").preload()])?)
///     .fetcher(Arc::new(MyHttpFetcher::new()))
///     .storage(Arc::new(MemoryStorage::new()))
///     .build()?;
///
/// let mut events = store.subscribe();
/// store.reconnect("http://openhab:8080").await?;
/// let things = store.get_all("things", &GetOptions::default()).await?;
/// ```
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`Store`].", "", "See [`Store::builder()`] method."),
        method_doc("Implement builder pattern for [`Store`]."),
    )
)]
pub struct Store {
    #[fieldx(get, builder(vis(pub), required))]
    tables: TableSet,

    #[fieldx(vis(pub(crate)), builder(vis(pub), required), get(clone))]
    fetcher: Arc<dyn Fetcher>,

    #[fieldx(builder(vis(pub), required), get(clone))]
    storage: Arc<dyn LocalStorage>,

    #[fieldx(optional, get(clone))]
    push_source: Arc<dyn PushSource>,

    #[fieldx(get, default(PushRouter::default()))]
    router: PushRouter,

    /// How long a successful refresh keeps a locator fresh.
    #[fieldx(lock, get(copy), set, default(Duration::from_secs(3600)))]
    expiry: Duration,

    /// Minimal delay between two refresh attempts of the same locator. Zero disables throttling.
    #[fieldx(lock, get(copy), set, default(Duration::ZERO))]
    throttle: Duration,

    #[fieldx(get(copy), default(Duration::from_secs(30)))]
    fetch_timeout: Duration,

    /// How many changed records a refresh may report individually before the whole table is reported as changed.
    #[fieldx(get(copy), default(DEFAULT_UNEQUAL_THRESHOLD))]
    unequal_threshold: usize,

    #[fieldx(get(copy), default(1))]
    layout_version: u32,

    #[fieldx(get(copy), default(256))]
    event_capacity: usize,

    #[fieldx(lazy, lock, private, clearer, get(clone), builder(off))]
    ledger: Arc<Ledger>,

    #[fieldx(lazy, private, get(clone), builder(off))]
    events: broadcast::Sender<StoreEvent>,

    #[fieldx(inner_mut, private, get, get_mut, builder(off), default(HashMap::new()))]
    attempts: HashMap<String, Instant>,

    // Table name -> keys of the injected rows.
    #[fieldx(inner_mut, private, get, get_mut, builder(off), default(HashMap::new()))]
    injected: HashMap<String, HashSet<String>>,

    #[fieldx(lock, private, get(clone), set, builder(off), default(None))]
    demo_fixture: Option<Arc<Value>>,

    #[fieldx(lock, private, get(clone), set, builder(off), default(String::new()))]
    host: String,

    #[fieldx(lock, private, get(copy), set, builder(off), default(false))]
    connected: bool,

    #[fieldx(lock, private, get(copy), set, builder(off), default(false))]
    disposed: bool,

    #[fieldx(lock, private, get(copy), get_mut, set, builder(off), default(false))]
    dumping: bool,

    // Bumped by reconnect and dispose. Results of fetches started under an older generation are discarded.
    #[fieldx(lock, private, get(copy), get_mut, builder(off), default(0))]
    generation: u64,

    #[fieldx(private, clearer, lock, get, set, builder(off))]
    realtime_task: tokio::task::JoinHandle<()>,
}

impl Store {
    fn build_ledger(&self) -> Arc<Ledger> {
        Arc::new(
            Cache::builder()
                .name("refresh-ledger")
                .max_capacity(10_000)
                .time_to_live(self.expiry().max(Duration::from_millis(1)))
                .build(),
        )
    }

    fn build_events(&self) -> broadcast::Sender<StoreEvent> {
        broadcast::channel(self.event_capacity().max(1)).0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events().subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        debug!("Emitting {}", event.kind());
        // Nobody listening is fine.
        let _ = self.events().send(event);
    }

    /// Change the expiry and throttle windows. Freshness recorded so far is forgotten.
    pub fn configure(&self, expiry: Duration, throttle: Duration) {
        self.set_expiry(expiry);
        self.set_throttle(throttle);
        self.clear_ledger();
        debug!("Configured expiry={expiry:?}, throttle={throttle:?}");
    }

    pub fn is_connected(&self) -> bool {
        self.connected()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed()
    }

    /// Serve everything from `fixture` on the next [`reconnect()`](Self::reconnect). The fixture maps table names to
    /// their records.
    pub fn enable_demo_mode(&self, fixture: Value) {
        self.set_demo_fixture(Some(Arc::new(fixture)));
    }

    pub fn disable_demo_mode(&self) {
        self.set_demo_fixture(None);
    }

    pub fn is_demo_mode(&self) -> bool {
        self.demo_fixture().is_some()
    }

    /// Why `table` (or one of its records) must not be refreshed from the network, if it must not.
    pub fn block_reason(&self, table: &TableDescriptor, id: Option<&str>) -> Option<BlockReason> {
        if self.is_demo_mode() {
            Some(BlockReason::Offline)
        }
        else if table.is_virtual() {
            Some(BlockReason::Virtual)
        }
        else if self.injected().get(table.id()).is_some_and(|keys| match id {
            Some(id) => keys.contains(id),
            None => !keys.is_empty(),
        }) {
            Some(BlockReason::Injected)
        }
        else {
            None
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.disposed() {
            Err(SwrError::Disposed)
        }
        else {
            Ok(())
        }
    }

    fn ensure_current(&self, generation: u64) -> Result<()> {
        self.ensure_alive()?;
        if self.generation() != generation {
            debug!("Discarding a result of connection generation {generation}");
            return Err(SwrError::Stale);
        }
        Ok(())
    }

    async fn is_fresh(&self, ledger_key: &str) -> bool {
        self.ledger().get(ledger_key).await.is_some()
    }

    fn is_throttled(&self, ledger_key: &str) -> bool {
        let throttle = self.throttle();
        !throttle.is_zero()
            && self
                .attempts()
                .get(ledger_key)
                .is_some_and(|at| at.elapsed() < throttle)
    }

    /// All records of a table from local storage. A failed read counts as an empty table.
    pub async fn cached_all(&self, table: &str) -> Vec<Value> {
        match self.storage().get_all(table).await {
            Ok(records) => records,
            Err(err) => {
                warn!("Reading '{table}' from local storage failed, treating it as empty: {err}");
                Vec::new()
            }
        }
    }

    /// A single record from local storage, unwrapped. `id` is ignored for singleton tables.
    pub async fn cached(&self, table: &str, id: Option<&str>) -> Result<Option<Value>> {
        let desc = self.tables().require(table)?;
        self.cached_record(desc, id).await
    }

    async fn cached_record(&self, desc: &TableDescriptor, id: Option<&str>) -> Result<Option<Value>> {
        let key = Self::record_key(desc, id)?;
        Ok(match self.storage().get(desc.id(), &key).await {
            Ok(record) => record.map(|r| desc.unwrap_value(r)),
            Err(err) => {
                warn!("Reading '{key}' of '{}' failed, treating it as missing: {err}", desc.id());
                None
            }
        })
    }

    fn record_key(desc: &TableDescriptor, id: Option<&str>) -> Result<String> {
        if desc.is_singleton() {
            Ok(crate::table::SINGLETON_KEY.to_string())
        }
        else {
            id.map(str::to_string).ok_or_else(|| SwrError::MissingKey {
                table: desc.id().to_string(),
            })
        }
    }

    // Two records under one key would silently collapse into one in storage.
    fn keyed(desc: &TableDescriptor, records: &[Value]) -> Result<Vec<(String, Value)>> {
        let mut seen = HashSet::with_capacity(records.len());
        records
            .iter()
            .map(|record| {
                let key = desc.key_of(record).ok_or_else(|| SwrError::MissingKey {
                    table: desc.id().to_string(),
                })?;
                if !seen.insert(key.clone()) {
                    return Err(SwrError::DuplicateKey(key));
                }
                Ok((key, record.clone()))
            })
            .collect()
    }

    fn into_records(value: Value) -> Vec<Value> {
        match value {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        }
    }

    /// Local copy of a table now, refreshed in the background.
    ///
    /// With `options.force` and nothing cached locally, the network result is awaited instead.
    #[instrument(level = "debug", skip(self, options))]
    pub async fn get_all(&self, table: &str, options: &GetOptions) -> Result<Vec<Value>> {
        self.ensure_alive()?;
        let desc = self.tables().require(table)?;

        if let Source::Virtual(resolver) = desc.source() {
            return Ok(Self::into_records(resolver.resolve(self, options, None).await?));
        }

        let cached = self.cached_all(table).await;

        if let Some(reason) = self.block_reason(desc, None) {
            debug!("Serving '{table}' from the local copy only: {reason:?}");
            return Ok(cached);
        }

        let Some(ledger_key) = desc.ledger_key(None)
        else {
            return Ok(cached);
        };

        if self.is_fresh(&ledger_key).await || self.is_throttled(&ledger_key) {
            return Ok(cached);
        }

        if options.force && cached.is_empty() {
            return self.fetch_all(desc).await;
        }

        self.spawn_refresh(table, Target::All)?;
        Ok(cached)
    }

    /// Local copy of a record now, refreshed in the background.
    ///
    /// `id` is ignored for singleton tables and required otherwise.
    #[instrument(level = "debug", skip(self, options))]
    pub async fn get(&self, table: &str, id: Option<&str>, options: &GetOptions) -> Result<Option<Value>> {
        self.ensure_alive()?;
        let desc = self.tables().require(table)?;

        if let Source::Virtual(resolver) = desc.source() {
            let value = resolver.resolve(self, options, id).await?;
            return Ok((!value.is_null()).then_some(value));
        }

        let cached = self.cached_record(desc, id).await?;

        if let Some(reason) = self.block_reason(desc, id) {
            debug!("Serving '{table}' record from the local copy only: {reason:?}");
            return Ok(cached);
        }

        let Some(ledger_key) = desc.ledger_key(id)
        else {
            return Ok(cached);
        };

        if self.is_fresh(&ledger_key).await || self.is_throttled(&ledger_key) {
            return Ok(cached);
        }

        if options.force && cached.is_none() {
            return self.fetch_one(desc, id).await.map(Some);
        }

        self.spawn_refresh(table, Target::One(id.map(str::to_string)))?;
        Ok(cached)
    }

    fn spawn_refresh(&self, table: &str, target: Target) -> Result<()> {
        let myself = self.myself().ok_or(SwrError::Disposed)?;
        let table = table.to_string();
        tokio::spawn(async move {
            let outcome = match target {
                Target::All => myself.refresh_all(&table, false).await.map(|_| ()),
                Target::One(id) => myself.refresh(&table, id.as_deref(), false).await.map(|_| ()),
            };
            match outcome {
                Ok(()) => (),
                Err(err @ (SwrError::Disposed | SwrError::Stale)) => debug!("Refresh of '{table}' dropped: {err}"),
                Err(err) => warn!("Background refresh of '{table}' failed: {err}"),
            }
        });
        Ok(())
    }

    /// Refresh a table from the network and return the result.
    ///
    /// Without `force` a fresh or throttled table is returned from the local copy. Blocked tables are never fetched.
    #[instrument(level = "debug", skip(self))]
    pub async fn refresh_all(&self, table: &str, force: bool) -> Result<Vec<Value>> {
        self.ensure_alive()?;
        let desc = self.tables().require(table)?;

        if let Source::Virtual(resolver) = desc.source() {
            return Ok(Self::into_records(
                resolver.resolve(self, &GetOptions::default(), None).await?,
            ));
        }

        let Some(ledger_key) = desc.ledger_key(None).filter(|_| self.block_reason(desc, None).is_none())
        else {
            return Ok(self.cached_all(table).await);
        };

        if force {
            self.ledger().invalidate(&ledger_key).await;
        }
        else if self.is_fresh(&ledger_key).await || self.is_throttled(&ledger_key) {
            return Ok(self.cached_all(table).await);
        }

        self.fetch_all(desc).await
    }

    /// Refresh a single record from the network and return it, unwrapped.
    #[instrument(level = "debug", skip(self))]
    pub async fn refresh(&self, table: &str, id: Option<&str>, force: bool) -> Result<Option<Value>> {
        self.ensure_alive()?;
        let desc = self.tables().require(table)?;

        if let Source::Virtual(resolver) = desc.source() {
            let value = resolver.resolve(self, &GetOptions::default(), id).await?;
            return Ok((!value.is_null()).then_some(value));
        }

        let Some(ledger_key) = desc.ledger_key(id).filter(|_| self.block_reason(desc, id).is_none())
        else {
            return self.cached_record(desc, id).await;
        };

        if force {
            self.ledger().invalidate(&ledger_key).await;
        }
        else if self.is_fresh(&ledger_key).await || self.is_throttled(&ledger_key) {
            return self.cached_record(desc, id).await;
        }

        self.fetch_one(desc, id).await.map(Some)
    }

    async fn fetch(&self, locator: &str) -> Result<Value> {
        self.attempts_mut().insert(locator.to_string(), Instant::now());
        let host = self.host();
        let timeout = self.fetch_timeout();
        debug!("Fetching '{locator}' from '{host}'");
        match tokio::time::timeout(timeout, self.fetcher().fetch(&host, locator)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(FetchError::new(format!("Fetching '{locator}' timed out after {timeout:?}")).into()),
        }
    }

    async fn fetch_all(&self, desc: &TableDescriptor) -> Result<Vec<Value>> {
        let (Some(locator), Some(ledger_key)) = (desc.locator(None), desc.ledger_key(None))
        else {
            return Err(SwrError::Config(format!("Table '{}' has no network source", desc.id())));
        };
        let generation = self.generation();

        let fetched = self
            .ledger()
            .try_get_with(ledger_key, async {
                let value = self.fetch(&locator).await?;
                self.ensure_current(generation)?;
                let records = self.reconcile_all(desc, value).await?;
                Ok::<_, SwrError>(Arc::new(Value::Array(records)))
            })
            .await
            .map_err(|err| (*err).clone())?;

        Ok(Self::into_records((*fetched).clone()))
    }

    async fn fetch_one(&self, desc: &TableDescriptor, id: Option<&str>) -> Result<Value> {
        // A singleton lives under its table locator, so its record is the bulk result. Sharing the ledger entry
        // with fetch_all keeps both calls coalesced and of the same shape.
        if desc.is_singleton() {
            let records = self.fetch_all(desc).await?;
            return Ok(desc.unwrap_value(records.into_iter().next().unwrap_or(Value::Null)));
        }

        let (Some(locator), Some(ledger_key)) = (desc.locator(id), desc.ledger_key(id))
        else {
            return Err(SwrError::Config(format!("Table '{}' has no network source", desc.id())));
        };
        // Fail early on a missing id rather than after the fetch.
        Self::record_key(desc, id)?;
        let generation = self.generation();

        let record = self
            .ledger()
            .try_get_with(ledger_key, async {
                let mut value = self.fetch(&locator).await?;
                self.ensure_current(generation)?;
                if let Some(id) = id.filter(|_| !desc.single_item_fetch()) {
                    value = Self::extract(desc, value, id)?;
                }
                let record = desc.wrap_value(value, id);
                self.insert_record(desc.id(), record.clone()).await?;
                Ok::<_, SwrError>(Arc::new(record))
            })
            .await
            .map_err(|err| (*err).clone())?;

        Ok(desc.unwrap_value((*record).clone()))
    }

    // Pick a record out of a bulk response.
    fn extract(desc: &TableDescriptor, value: Value, id: &str) -> Result<Value> {
        Self::into_records(value)
            .into_iter()
            .find(|record| desc.key_of(record).as_deref() == Some(id))
            .ok_or_else(|| SwrError::NotFound {
                table: desc.id().to_string(),
                id:    id.to_string(),
            })
    }

    // Apply a bulk network result to the local table and tell subscribers what changed.
    async fn reconcile_all(&self, desc: &TableDescriptor, value: Value) -> Result<Vec<Value>> {
        let table = desc.id();

        if desc.is_singleton() {
            let record = desc.wrap_value(value, None);
            self.insert_record(table, record.clone()).await?;
            return Ok(vec![record]);
        }

        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(SwrError::Payload {
                    table:   table.to_string(),
                    message: format!("expected an array, got {other}"),
                })
            }
        };
        let keyed = Self::keyed(desc, &items)?;
        let previous = self.cached_all(table).await;

        // Per-record diffing is only attempted when the counts match.
        if let Some(key_field) = desc.key_field().filter(|_| items.len() == previous.len()) {
            let mut comparator =
                DatasetComparator::new(key_field, &previous).with_threshold(self.unequal_threshold());
            for item in &items {
                comparator.compare(item);
            }

            if comparator.ok() && comparator.unequal().iter().all(|r| comparator.knows(r)) {
                self.storage().replace_all(table, keyed).await?;
                for value in comparator.into_unequal() {
                    self.emit(StoreEvent::ItemChanged {
                        table: table.to_string(),
                        value,
                    });
                }
                return Ok(items);
            }
            debug!("'{table}' diverged too much for per-record events");
        }

        self.storage().replace_all(table, keyed).await?;
        self.emit(StoreEvent::ResourceChanged {
            table: table.to_string(),
            items: items.clone(),
        });
        Ok(items)
    }

    /// Insert or replace a record. Emits `itemAdded` for new records and `itemChanged` if the serialized form
    /// differs from the stored one.
    pub async fn insert_record(&self, table: &str, record: Value) -> Result<()> {
        let desc = self.tables().require(table)?;
        let key = desc.key_of(&record).ok_or_else(|| SwrError::MissingKey {
            table: table.to_string(),
        })?;

        match self.storage().put(table, &key, record.clone()).await? {
            None => self.emit(StoreEvent::ItemAdded {
                table: table.to_string(),
                value: record,
            }),
            Some(previous) if serde_json::to_string(&previous)? != serde_json::to_string(&record)? => {
                self.emit(StoreEvent::ItemChanged {
                    table: table.to_string(),
                    value: record,
                })
            }
            Some(_) => debug!("'{key}' of '{table}' is unchanged"),
        }
        Ok(())
    }

    /// Set one field of an existing record. A missing record is not an error; pushes may arrive before the record
    /// itself.
    pub async fn patch_field(&self, table: &str, key: &str, field: &str, value: Value) -> Result<()> {
        self.tables().require(table)?;
        match self.storage().patch(table, key, field, value).await? {
            Some(record) => self.emit(StoreEvent::ItemChanged {
                table: table.to_string(),
                value: record,
            }),
            None => debug!("No '{key}' in '{table}' to patch '{field}' of"),
        }
        Ok(())
    }

    /// Remove a record. Removing a record that isn't there is not an error.
    pub async fn remove_record(&self, table: &str, key: &str) -> Result<()> {
        self.tables().require(table)?;
        let value = self.storage().delete(table, key).await?;
        self.emit(StoreEvent::ItemRemoved {
            table: table.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    /// Apply a server-push message. Malformed messages and unknown event types are logged and dropped.
    #[instrument(level = "trace", skip(self))]
    pub async fn ingest(&self, message: &PushMessage) -> Result<()> {
        let Some(event) = PushEvent::parse(message)
        else {
            warn!("Dropping malformed push message: {message:?}");
            return Ok(());
        };

        let Some(desc) = self.tables().get(&event.table).filter(|d| !d.is_virtual())
        else {
            debug!("No table for pushes on '{}'", event.table);
            return Ok(());
        };

        let Some(action) = self.router().action_for(&event.event_type)
        else {
            debug!("Ignoring push event of unrecognized type '{}'", event.event_type);
            return Ok(());
        };

        match action {
            PushAction::Upsert => {
                let record = match event.payload {
                    Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
                    payload => payload,
                };
                self.insert_record(desc.id(), record).await
            }
            PushAction::Remove => {
                let key = desc
                    .key_of(&event.payload)
                    .or(event.id)
                    .ok_or_else(|| SwrError::MissingKey {
                        table: desc.id().to_string(),
                    })?;
                self.remove_record(desc.id(), &key).await
            }
            PushAction::Patch { field, value } => {
                let Some(id) = event.id
                else {
                    warn!("'{}' push without a record id", event.event_type);
                    return Ok(());
                };
                let Some(new_value) = value.extract(event.payload)
                else {
                    warn!("'{}' push for '{id}' has no usable value", event.event_type);
                    return Ok(());
                };
                self.patch_field(desc.id(), &id, field, new_value).await
            }
        }
    }

    async fn listen(&self, mut stream: PushStream, generation: u64) {
        debug!("Listening for push events");
        while let Some(item) = stream.next().await {
            if self.disposed() || self.generation() != generation {
                break;
            }
            match item {
                Ok(message) => {
                    if let Err(err) = self.ingest(&message).await {
                        warn!("Applying a push event failed: {err}");
                    }
                }
                // The source reconnects by itself.
                Err(err) => debug!("Push stream error: {err}"),
            }
        }
        debug!("Push stream ended");
    }

    /// Put a row into the local table and keep it out of network refreshes until
    /// [`remove_injected_rows()`](Self::remove_injected_rows).
    pub async fn inject_row(&self, table: &str, data: Value) -> Result<()> {
        self.ensure_alive()?;
        let desc = self.tables().require(table)?;
        let key = desc.key_of(&data).ok_or_else(|| SwrError::MissingKey {
            table: table.to_string(),
        })?;
        self.injected_mut()
            .entry(table.to_string())
            .or_default()
            .insert(key);
        self.insert_record(table, data).await
    }

    pub async fn remove_injected_rows(&self) -> Result<()> {
        let injected = std::mem::take(&mut *self.injected_mut());
        let ledger = self.ledger();
        for (table, keys) in injected {
            let Some(desc) = self.tables().get(&table)
            else {
                continue;
            };
            for key in keys {
                self.remove_record(&table, &key).await?;
                if let Some(ledger_key) = desc.ledger_key(Some(&key)) {
                    ledger.invalidate(&ledger_key).await;
                }
            }
            if let Some(ledger_key) = desc.ledger_key(None) {
                ledger.invalidate(&ledger_key).await;
            }
        }
        Ok(())
    }

    /// Drop the current connection and establish a new one to `host`.
    ///
    /// In demo mode the fixture is loaded into every table. Otherwise all preloaded tables are fetched in parallel
    /// and the push stream is opened. The store counts as connected only when all of this succeeded; a failure is
    /// reported with a `connectionLost` event and returned.
    #[instrument(level = "debug", skip(self))]
    pub async fn reconnect(&self, host: &str) -> Result<()> {
        self.ensure_alive()?;

        if let Some(task) = self.clear_realtime_task() {
            task.abort();
        }
        let generation = {
            let mut generation = self.generation_mut();
            *generation += 1;
            *generation
        };
        self.ledger().invalidate_all();
        self.attempts_mut().clear();
        self.set_connected(false);
        self.set_host(host.to_string());

        let names = self
            .tables()
            .iter()
            .filter(|t| !t.is_virtual())
            .map(|t| t.id().to_string())
            .collect::<Vec<_>>();
        let outcome = match self.storage().open(&names, self.layout_version()).await {
            Ok(()) => {
                if let Some(fixture) = self.demo_fixture() {
                    self.load_fixture(&fixture).await
                }
                else {
                    self.preload_and_listen(host, generation).await
                }
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => {
                self.set_connected(true);
                info!("Connected to '{host}'");
                self.emit(StoreEvent::ConnectionEstablished);
                Ok(())
            }
            Err(err) => {
                self.connection_lost(&err);
                Err(err)
            }
        }
    }

    fn connection_lost(&self, err: &SwrError) {
        let failure = match err {
            SwrError::Fetch(fetch_err) => fetch_err.failure(),
            _ => ConnectionFailure::Unreachable,
        };
        warn!("Connection lost ({failure}): {err}");
        self.set_connected(false);
        self.emit(StoreEvent::ConnectionLost {
            code:    failure.code(),
            message: err.to_string(),
        });
    }

    async fn preload_and_listen(&self, host: &str, generation: u64) -> Result<()> {
        let myself = self.myself().ok_or(SwrError::Disposed)?;

        let mut preloads = JoinSet::new();
        for table in self.tables().iter().filter(|t| t.preload_on_start() && !t.is_virtual()) {
            let store = Arc::clone(&myself);
            let name = table.id().to_string();
            preloads.spawn(async move { store.refresh_all(&name, true).await });
        }

        while let Some(joined) = preloads.join_next().await {
            let outcome = joined.map_err(|err| SwrError::Task(err.to_string())).and_then(|r| r);
            if let Err(err) = outcome {
                preloads.abort_all();
                return Err(err);
            }
        }

        self.ensure_current(generation)?;

        if let Some(source) = self.push_source() {
            let stream = source.subscribe(host).await?;
            let store = Arc::clone(&myself);
            self.set_realtime_task(tokio::spawn(async move { store.listen(stream, generation).await }));
        }

        Ok(())
    }

    async fn load_fixture(&self, fixture: &Value) -> Result<()> {
        let mut data = BTreeMap::new();
        let mut filled = Vec::new();

        for desc in self.tables().iter().filter(|t| !t.is_virtual()) {
            let Some(value) = fixture.get(desc.id())
            else {
                continue;
            };
            let records = match value {
                Value::Array(items) if !desc.is_singleton() => items.clone(),
                other => vec![desc.wrap_value(other.clone(), None)],
            };
            data.insert(desc.id().to_string(), Self::keyed(desc, &records)?);
            filled.push((desc.id().to_string(), records));
        }

        self.storage().fill(data).await?;
        info!("Loaded demo data into {} tables", filled.len());

        for (table, items) in filled {
            self.emit(StoreEvent::ResourceChanged { table, items });
        }
        Ok(())
    }

    /// Force a refresh of every table, one after another, and export the whole local database.
    #[instrument(level = "debug", skip(self))]
    pub async fn dump(&self) -> Result<Dump> {
        self.ensure_alive()?;
        {
            let mut dumping = self.dumping_mut();
            if *dumping {
                return Err(SwrError::DumpInProgress);
            }
            *dumping = true;
        }

        let _guard = DumpGuard(self);
        self.dump_tables().await
    }

    async fn dump_tables(&self) -> Result<Dump> {
        let live = self.tables().iter().filter(|t| !t.is_virtual()).collect::<Vec<_>>();
        let total = live.len();

        for (idx, desc) in live.iter().enumerate() {
            if let Err(err) = self.refresh_all(desc.id(), true).await {
                warn!("Refreshing '{}' for the dump failed: {err}", desc.id());
            }
            self.emit(StoreEvent::DumpProgress {
                table: desc.id().to_string(),
                done: idx + 1,
                total,
            });
        }

        let mut tables = BTreeMap::new();
        for desc in live {
            tables.insert(desc.id().to_string(), self.storage().get_all(desc.id()).await?);
        }

        Ok(Dump {
            exported_at: Utc::now(),
            layout_version: self.layout_version(),
            tables,
        })
    }

    /// Stop the push stream and forget in-flight refreshes. Results arriving afterwards are discarded.
    pub fn dispose(&self) {
        if self.disposed() {
            return;
        }
        self.set_disposed(true);
        *self.generation_mut() += 1;
        if let Some(task) = self.clear_realtime_task() {
            task.abort();
        }
        self.ledger().invalidate_all();
        self.attempts_mut().clear();
        self.set_connected(false);
        info!("Store disposed");
    }
}
