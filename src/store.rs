//! Document store collaborator.
//!
//! Jobs see the store through [`DocumentStore`]: stream documents matching a
//! [`Query`], look one up by id, and commit a [`WriteBatch`] atomically.
//! [`BatchWriter`] accumulates writes and commits them once a batch reaches
//! the configured threshold, which stays below the provider limit of
//! [`MAX_BATCH_OPS`].
//!
//! [`JsonFileStore`] is a local implementation that keeps every collection in
//! one JSON file, shaped `{ collection: { id: { field: value } } }`.

use crate::error::StoreError;
use chrono::Utc;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Hard cap on operations in a single committed batch.
pub const MAX_BATCH_OPS: usize = 500;

pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// Result of a point lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(Document),
    NotFound,
}

/// A field filter applied by [`DocumentStore::stream`].
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    /// Field absent or null.
    Missing(String),
}

impl Filter {
    /// Parse `FIELD<op>VALUE` where op is one of `=`, `==`, `<`, `<=`, `>`,
    /// `>=`. VALUE is read as JSON when it parses (`3`, `true`, `"x"`) and as
    /// a bare string otherwise.
    pub fn parse(expr: &str) -> Result<Filter, String> {
        let malformed = || format!("expected FIELD<op>VALUE, got {expr:?}");
        let at = expr.find(['<', '>', '=']).ok_or_else(malformed)?;
        let name = expr[..at].trim();
        if name.is_empty() {
            return Err(malformed());
        }
        let rest = &expr[at..];
        let (op, raw) = ["<=", ">=", "==", "<", ">", "="]
            .iter()
            .find_map(|op| rest.strip_prefix(op).map(|raw| (*op, raw.trim())))
            .ok_or_else(malformed)?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        let name = name.to_string();
        Ok(match op {
            "<" => Filter::Lt(name, value),
            "<=" => Filter::Le(name, value),
            ">" => Filter::Gt(name, value),
            ">=" => Filter::Ge(name, value),
            _ => Filter::Eq(name, value),
        })
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        match self {
            Filter::Eq(name, v) => fields.get(name) == Some(v),
            Filter::Lt(name, v) => compare(fields.get(name), v) == Some(Ordering::Less),
            Filter::Le(name, v) => matches!(
                compare(fields.get(name), v),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Filter::Gt(name, v) => compare(fields.get(name), v) == Some(Ordering::Greater),
            Filter::Ge(name, v) => matches!(
                compare(fields.get(name), v),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Missing(name) => fields.get(name).is_none_or(Value::is_null),
        }
    }
}

/// Order two values of the same JSON type; mixed types never compare.
fn compare(field: Option<&Value>, target: &Value) -> Option<Ordering> {
    match (field?, target) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub ids: Option<Vec<String>>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(name: &str) -> Self {
        Self {
            collection: name.to_string(),
            filters: Vec::new(),
            ids: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn admits(&self, id: &str, fields: &Fields) -> bool {
        let id_ok = self.ids.as_ref().is_none_or(|ids| ids.iter().any(|i| i == id));
        id_ok && self.filters.iter().all(|f| f.matches(fields))
    }
}

/// Value written to a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Set(Value),
    /// Replaced with the commit time (RFC 3339, UTC).
    ServerTimestamp,
    Delete,
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Set(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Merge fields into a document, creating it if needed.
    Update {
        collection: String,
        id: String,
        fields: Vec<(String, FieldValue)>,
    },
}

/// Operations committed together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) -> Result<(), StoreError> {
        if self.ops.len() >= MAX_BATCH_OPS {
            return Err(StoreError::BatchTooLarge(self.ops.len() + 1, MAX_BATCH_OPS));
        }
        self.ops.push(op);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }
}

pub trait DocumentStore {
    /// Documents of `query.collection` matching every filter, ordered by id.
    async fn stream(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Lookup, StoreError>;

    /// Apply every operation in `batch`. Returns the number applied.
    async fn commit(&self, batch: WriteBatch) -> Result<usize, StoreError>;
}

/// Accumulates writes and commits every `limit` operations.
#[derive(Debug)]
pub struct BatchWriter<'a, S> {
    store: &'a S,
    batch: WriteBatch,
    limit: usize,
    committed: usize,
}

impl<'a, S: DocumentStore> BatchWriter<'a, S> {
    pub fn new(store: &'a S, limit: usize) -> Self {
        Self {
            store,
            batch: WriteBatch::new(),
            limit: limit.clamp(1, MAX_BATCH_OPS),
            committed: 0,
        }
    }

    pub async fn push(&mut self, op: WriteOp) -> Result<(), StoreError> {
        self.batch.push(op)?;
        if self.batch.len() >= self.limit {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn update(
        &mut self,
        collection: &str,
        id: &str,
        fields: Vec<(String, FieldValue)>,
    ) -> Result<(), StoreError> {
        self.push(WriteOp::Update {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
        })
        .await
    }

    /// Commit whatever is pending.
    pub async fn flush(&mut self) -> Result<(), StoreError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        let n = self.store.commit(batch).await?;
        self.committed += n;
        debug!(ops = n, total = self.committed, "Committed write batch");
        Ok(())
    }

    /// Operations committed so far.
    pub fn committed(&self) -> usize {
        self.committed
    }
}

type Collections = BTreeMap<String, BTreeMap<String, Fields>>;

/// Document store persisted to a single JSON file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    data: Mutex<Collections>,
}

impl JsonFileStore {
    /// Open `path`, starting empty if it does not exist yet.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let data: Collections = match fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => Collections::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Collections::new(),
            Err(e) => return Err(e.into()),
        };
        let docs: usize = data.values().map(BTreeMap::len).sum();
        info!(collections = data.len(), docs, "Opened document store");
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    async fn persist(&self, data: &Collections) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(data)?).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

impl DocumentStore for JsonFileStore {
    async fn stream(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let data = self.data.lock().await;
        let Some(docs) = data.get(&query.collection) else {
            return Ok(Vec::new());
        };
        let matched = docs
            .iter()
            .filter(|(id, fields)| query.admits(id, fields))
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|(id, fields)| Document {
                id: id.clone(),
                fields: fields.clone(),
            })
            .collect();
        Ok(matched)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Lookup, StoreError> {
        let data = self.data.lock().await;
        Ok(match data.get(collection).and_then(|c| c.get(id)) {
            Some(fields) => Lookup::Found(Document {
                id: id.to_string(),
                fields: fields.clone(),
            }),
            None => Lookup::NotFound,
        })
    }

    async fn commit(&self, batch: WriteBatch) -> Result<usize, StoreError> {
        if batch.len() > MAX_BATCH_OPS {
            return Err(StoreError::BatchTooLarge(batch.len(), MAX_BATCH_OPS));
        }
        let mut data = self.data.lock().await;
        // Apply to a copy so a failed persist leaves memory untouched.
        let mut next = data.clone();
        let now = Value::String(Utc::now().to_rfc3339());

        for op in batch.ops() {
            match op {
                WriteOp::Update { collection, id, fields } => {
                    let doc = next
                        .entry(collection.clone())
                        .or_default()
                        .entry(id.clone())
                        .or_default();
                    for (name, value) in fields {
                        match value {
                            FieldValue::Set(v) => {
                                doc.insert(name.clone(), v.clone());
                            }
                            FieldValue::ServerTimestamp => {
                                doc.insert(name.clone(), now.clone());
                            }
                            FieldValue::Delete => {
                                doc.remove(name);
                            }
                        }
                    }
                }
            }
        }

        self.persist(&next).await?;
        *data = next;
        Ok(batch.len())
    }
}
