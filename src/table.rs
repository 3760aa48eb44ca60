use crate::error::Result;
use crate::error::SwrError;
use crate::store::Store;
use crate::types::GetOptions;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Storage key of the only record of a singleton table.
pub const SINGLETON_KEY: &str = "_";

/// Separator between the parts of a composite key.
pub const KEY_SEPARATOR: char = '/';

/// One or more fields forming the identity of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "KeyFieldRepr", into = "KeyFieldRepr")]
pub struct KeyField(Vec<String>);

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum KeyFieldRepr {
    Single(String),
    Composite(Vec<String>),
}

impl From<KeyFieldRepr> for KeyField {
    fn from(repr: KeyFieldRepr) -> Self {
        match repr {
            KeyFieldRepr::Single(f) => Self(vec![f]),
            KeyFieldRepr::Composite(fs) => Self(fs),
        }
    }
}

impl From<KeyField> for KeyFieldRepr {
    fn from(key: KeyField) -> Self {
        if key.0.len() == 1 {
            Self::Single(key.0.into_iter().next().unwrap_or_default())
        }
        else {
            Self::Composite(key.0)
        }
    }
}

impl KeyField {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }

    pub fn fields(&self) -> &[String] {
        &self.0
    }

    pub fn primary(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Extract the key value of a record. Strings, numbers and booleans make keys; anything else doesn't.
    pub fn key_of(&self, record: &Value) -> Option<String> {
        let mut parts = Vec::with_capacity(self.0.len());
        for field in &self.0 {
            parts.push(match record.get(field)? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            });
        }
        if parts.is_empty() {
            None
        }
        else {
            Some(parts.join(&KEY_SEPARATOR.to_string()))
        }
    }
}

impl From<&str> for KeyField {
    fn from(field: &str) -> Self {
        Self(vec![field.to_string()])
    }
}

/// Computes the content of a virtual table from the rest of the store instead of fetching it.
#[async_trait]
pub trait VirtualResolver: Debug + Send + Sync + 'static {
    /// With `id` set, return the single matching record or `Value::Null`. Otherwise return an array.
    async fn resolve(&self, store: &Store, options: &GetOptions, id: Option<&str>) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub enum Source {
    /// Fetched from `<host>/<uri>[/<id>]<suffix>`.
    Rest { uri: String, suffix: Option<String> },
    Virtual(Arc<dyn VirtualResolver>),
}

#[derive(Debug, Clone)]
pub struct TableDescriptor {
    id:                String,
    key_field:         Option<KeyField>,
    source:            Source,
    single_item_fetch: bool,
    preload_on_start:  bool,
    wrap_key:          Option<String>,
}

impl TableDescriptor {
    pub fn rest<S: Into<String>, U: Into<String>>(id: S, uri: U) -> Self {
        Self {
            id:                id.into(),
            key_field:         None,
            source:            Source::Rest {
                uri:    uri.into(),
                suffix: None,
            },
            single_item_fetch: true,
            preload_on_start:  false,
            wrap_key:          None,
        }
    }

    pub fn virtual_table<S: Into<String>>(id: S, key_field: KeyField, resolver: Arc<dyn VirtualResolver>) -> Self {
        Self {
            id:                id.into(),
            key_field:         Some(key_field),
            source:            Source::Virtual(resolver),
            single_item_fetch: false,
            preload_on_start:  false,
            wrap_key:          None,
        }
    }

    pub fn key<K: Into<KeyField>>(mut self, key_field: K) -> Self {
        self.key_field = Some(key_field.into());
        self
    }

    pub fn suffix<S: Into<String>>(mut self, suffix: S) -> Self {
        if let Source::Rest { suffix: ref mut sfx, .. } = self.source {
            *sfx = Some(suffix.into());
        }
        self
    }

    /// Individual records can only be obtained by fetching the whole collection.
    pub fn bulk_only(mut self) -> Self {
        self.single_item_fetch = false;
        self
    }

    pub fn preload(mut self) -> Self {
        self.preload_on_start = true;
        self
    }

    pub fn wrap<S: Into<String>>(mut self, wrap_key: S) -> Self {
        self.wrap_key = Some(wrap_key.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key_field(&self) -> Option<&KeyField> {
        self.key_field.as_ref()
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn single_item_fetch(&self) -> bool {
        self.single_item_fetch
    }

    pub fn preload_on_start(&self) -> bool {
        self.preload_on_start
    }

    pub fn wrap_key(&self) -> Option<&str> {
        self.wrap_key.as_deref()
    }

    pub fn is_singleton(&self) -> bool {
        self.key_field.is_none()
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.source, Source::Virtual(_))
    }

    /// Storage key of a record. Singletons always use [`SINGLETON_KEY`].
    pub fn key_of(&self, record: &Value) -> Option<String> {
        match self.key_field {
            Some(ref kf) => kf.key_of(record),
            None => Some(SINGLETON_KEY.to_string()),
        }
    }

    /// Resource locator to fetch, relative to the host.
    pub fn locator(&self, id: Option<&str>) -> Option<String> {
        let Source::Rest { ref uri, ref suffix } = self.source
        else {
            return None;
        };
        let mut locator = uri.trim_end_matches('/').to_string();
        if let Some(id) = id.filter(|_| self.single_item_fetch && !self.is_singleton()) {
            locator.push('/');
            locator.push_str(id);
        }
        if let Some(suffix) = suffix {
            locator.push_str(suffix);
        }
        Some(locator)
    }

    /// Key of the refresh ledger entry. Records of bulk-only tables share the collection locator for fetching, but
    /// their freshness is tracked separately.
    pub fn ledger_key(&self, id: Option<&str>) -> Option<String> {
        let locator = self.locator(id)?;
        Some(match id {
            Some(id) if !self.single_item_fetch && !self.is_singleton() => format!("{locator}#{id}"),
            _ => locator,
        })
    }

    /// Bare values are stored under the wrap key, next to the record key.
    pub fn wrap_value(&self, value: Value, id: Option<&str>) -> Value {
        let Some(wrap_key) = self.wrap_key.as_deref()
        else {
            return value;
        };
        let mut record = serde_json::Map::new();
        if let (Some(field), Some(id)) = (self.key_field.as_ref().and_then(|kf| kf.primary()), id) {
            record.insert(field.to_string(), Value::String(id.to_string()));
        }
        record.insert(wrap_key.to_string(), value);
        Value::Object(record)
    }

    pub fn unwrap_value(&self, record: Value) -> Value {
        match (self.wrap_key.as_deref(), record) {
            (Some(wrap_key), Value::Object(mut map)) => map.remove(wrap_key).unwrap_or(Value::Null),
            (_, record) => record,
        }
    }
}

/// The validated set of table descriptors a store works with.
#[derive(Debug, Clone, Default)]
pub struct TableSet {
    tables: Vec<TableDescriptor>,
    index:  HashMap<String, usize>,
}

impl TableSet {
    pub fn new(tables: Vec<TableDescriptor>) -> Result<Self> {
        let mut index = HashMap::with_capacity(tables.len());
        for (idx, table) in tables.iter().enumerate() {
            if index.insert(table.id.clone(), idx).is_some() {
                return Err(SwrError::Config(format!("Table '{}' is declared more than once", table.id)));
            }
        }
        Ok(Self { tables, index })
    }

    pub fn get(&self, id: &str) -> Option<&TableDescriptor> {
        self.index.get(id).map(|idx| &self.tables[*idx])
    }

    pub fn require(&self, id: &str) -> Result<&TableDescriptor> {
        self.get(id).ok_or_else(|| SwrError::UnknownTable(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.iter()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Serializable description of a REST-backed table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TableConfig {
    pub id:                String,
    pub uri:               String,
    #[serde(default)]
    pub key_field:         Option<KeyField>,
    #[serde(default)]
    pub suffix:            Option<String>,
    #[serde(default = "TableConfig::default_single_item_fetch")]
    pub single_item_fetch: bool,
    #[serde(default)]
    pub preload_on_start:  bool,
    #[serde(default)]
    pub wrap_key:          Option<String>,
}

impl TableConfig {
    fn default_single_item_fetch() -> bool {
        true
    }
}

impl From<TableConfig> for TableDescriptor {
    fn from(config: TableConfig) -> Self {
        Self {
            id:                config.id,
            key_field:         config.key_field,
            source:            Source::Rest {
                uri:    config.uri,
                suffix: config.suffix,
            },
            single_item_fetch: config.single_item_fetch,
            preload_on_start:  config.preload_on_start,
            wrap_key:          config.wrap_key,
        }
    }
}

/// Distinct values of a field across a source table, with usage counts.
///
/// Scalar fields contribute one value per record, array fields one per element. Records come out as
/// `{"name": <value>, "count": <n>}` ordered by name.
#[derive(Debug, Clone)]
pub struct FieldIndex {
    source: String,
    field:  String,
}

impl FieldIndex {
    pub fn new<S: Into<String>, F: Into<String>>(source: S, field: F) -> Self {
        Self {
            source: source.into(),
            field:  field.into(),
        }
    }

    fn collect(&self, records: &[Value]) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        let mut count = |v: &Value| {
            let name = match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return,
            };
            *counts.entry(name).or_insert(0) += 1;
        };
        for record in records {
            match record.get(&self.field) {
                Some(Value::Array(items)) => items.iter().for_each(&mut count),
                Some(v) => count(v),
                None => (),
            }
        }
        counts
    }
}

#[async_trait]
impl VirtualResolver for FieldIndex {
    async fn resolve(&self, store: &Store, _options: &GetOptions, id: Option<&str>) -> Result<Value> {
        let records = store.cached_all(&self.source).await;
        let counts = self.collect(&records);
        Ok(match id {
            Some(id) => counts
                .get(id)
                .map_or(Value::Null, |count| json!({"name": id, "count": count})),
            None => Value::Array(
                counts
                    .into_iter()
                    .map(|(name, count)| json!({"name": name, "count": count}))
                    .collect(),
            ),
        })
    }
}
