//! Sled-backed keyspace for aggregates, the saga log and consumer offsets.
//!
//! One sled database is the keyspace; each table is a named tree:
//! - `load_following_aggregates`: key `device_id \0 window_end`, JSON row
//! - `saga_log`: key `saga_id \0 step_number`, JSON row
//! - `consumer_offsets`: key source name, value next offset (u64 BE)
//! - `__schema`: `version` marker written by `init_schema`
//!
//! Keys embed the row identity, so a re-append overwrites in place.
//! Inserts run on the blocking pool to keep lane tasks responsive.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sled::Tree;

use super::persistence::{DurableStore, OffsetStore, SinkError};
use crate::config::defaults::{
    AGGREGATES_TABLE, OFFSETS_TABLE, SAGA_LOG_TABLE, SCHEMA_TABLE, SCHEMA_VERSION,
};
use crate::types::{AggregateRow, EventTime, SagaAction, SagaLogEntry};

const SCHEMA_VERSION_KEY: &[u8] = b"version";

#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    path: PathBuf,
    aggregates: Tree,
    saga_log: Tree,
    offsets: Tree,
}

impl SledStore {
    /// Open an existing keyspace.
    ///
    /// A keyspace without a schema marker is a fatal startup error unless
    /// `create_schema` is set, in which case the schema is created.
    pub fn open<P: AsRef<Path>>(path: P, create_schema: bool) -> Result<Self, SinkError> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        let schema = db.open_tree(SCHEMA_TABLE)?;

        match schema.get(SCHEMA_VERSION_KEY)? {
            Some(raw) => {
                let found = decode_version(&raw);
                if found != SCHEMA_VERSION {
                    return Err(SinkError::SchemaMismatch {
                        path: path.display().to_string(),
                        found,
                        expected: SCHEMA_VERSION,
                    });
                }
            }
            None if create_schema => {
                write_schema(&db)?;
                tracing::info!(path = %path.display(), version = SCHEMA_VERSION, "Created sink schema");
            }
            None => return Err(SinkError::SchemaNotFound(path.display().to_string())),
        }

        Ok(Self {
            aggregates: db.open_tree(AGGREGATES_TABLE)?,
            saga_log: db.open_tree(SAGA_LOG_TABLE)?,
            offsets: db.open_tree(OFFSETS_TABLE)?,
            path: path.to_path_buf(),
            db,
        })
    }

    /// Create the keyspace and its tables if missing. Safe to run repeatedly.
    pub fn init_schema<P: AsRef<Path>>(path: P) -> Result<(), SinkError> {
        let db = sled::open(path.as_ref())?;
        write_schema(&db)?;
        db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn aggregate_count(&self) -> usize {
        self.aggregates.len()
    }

    pub fn saga_log_count(&self) -> usize {
        self.saga_log.len()
    }

    /// Aggregate rows for one device, ordered by window end.
    pub fn aggregates_for(&self, device_id: &str) -> Result<Vec<AggregateRow>, SinkError> {
        let mut prefix = device_id.as_bytes().to_vec();
        prefix.push(0);
        self.aggregates
            .scan_prefix(prefix)
            .map(|item| {
                let (_, value) = item?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }
}

fn write_schema(db: &sled::Db) -> Result<(), SinkError> {
    for table in [AGGREGATES_TABLE, SAGA_LOG_TABLE, OFFSETS_TABLE] {
        db.open_tree(table)?;
    }
    db.open_tree(SCHEMA_TABLE)?
        .insert(SCHEMA_VERSION_KEY, SCHEMA_VERSION.to_be_bytes().to_vec())?;
    Ok(())
}

fn decode_version(raw: &[u8]) -> u32 {
    raw.try_into().map_or(0, u32::from_be_bytes)
}

/// `device_id \0 window_end`, with the sign bit flipped so negative times
/// sort before positive ones.
fn aggregate_key(device_id: &str, window_end: EventTime) -> Vec<u8> {
    let mut key = Vec::with_capacity(device_id.len() + 9);
    key.extend_from_slice(device_id.as_bytes());
    key.push(0);
    #[allow(clippy::cast_sign_loss)]
    let ordered = (window_end as u64) ^ (1 << 63);
    key.extend_from_slice(&ordered.to_be_bytes());
    key
}

fn saga_key(saga_id: &str, step_number: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(saga_id.len() + 5);
    key.extend_from_slice(saga_id.as_bytes());
    key.push(0);
    key.extend_from_slice(&step_number.to_be_bytes());
    key
}

async fn insert_blocking(tree: &Tree, key: Vec<u8>, value: Vec<u8>) -> Result<(), SinkError> {
    let tree = tree.clone();
    tokio::task::spawn_blocking(move || tree.insert(key, value)).await??;
    Ok(())
}

#[async_trait]
impl DurableStore for SledStore {
    async fn append_aggregate(&self, row: &AggregateRow) -> Result<(), SinkError> {
        let value = serde_json::to_vec(row)?;
        insert_blocking(&self.aggregates, aggregate_key(&row.device_id, row.window_end), value)
            .await
    }

    async fn append_saga_log(&self, entry: &SagaLogEntry) -> Result<(), SinkError> {
        let value = serde_json::to_vec(entry)?;
        insert_blocking(&self.saga_log, saga_key(&entry.saga_id, entry.step_number), value).await
    }

    async fn started_sagas(&self) -> Result<Vec<SagaLogEntry>, SinkError> {
        let tree = self.saga_log.clone();
        let mut started = tokio::task::spawn_blocking(move || {
            let mut started = Vec::new();
            for item in tree.iter() {
                let (_, value) = item?;
                match serde_json::from_slice::<SagaLogEntry>(&value) {
                    Ok(entry) if entry.action_type == SagaAction::Started => started.push(entry),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Skipping unreadable saga log row"),
                }
            }
            Ok::<_, SinkError>(started)
        })
        .await??;
        started.sort_by_key(|e| e.timestamp);
        Ok(started)
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}

impl OffsetStore for SledStore {
    fn load_offset(&self, source: &str) -> Result<Option<u64>, SinkError> {
        Ok(self.offsets.get(source.as_bytes())?.and_then(|raw| {
            let bytes: [u8; 8] = raw.as_ref().try_into().ok()?;
            Some(u64::from_be_bytes(bytes))
        }))
    }

    fn commit_offset(&self, source: &str, next_offset: u64) -> Result<(), SinkError> {
        self.offsets
            .insert(source.as_bytes(), next_offset.to_be_bytes().to_vec())?;
        Ok(())
    }
}
