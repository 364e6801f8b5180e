use crate::error::{LinkGuardError, Result};
use crate::storage::{validate_write, ClusterStore, ClusterWrite};
use crate::types::{AttributeKind, Cluster, ClusterId, Signal, StoreStats};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS clusters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS cluster_fingerprints (
        value TEXT PRIMARY KEY,
        cluster_id INTEGER NOT NULL REFERENCES clusters(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_cluster_fingerprints_cluster
        ON cluster_fingerprints(cluster_id);

    CREATE TABLE IF NOT EXISTS cluster_account_ids (
        value TEXT PRIMARY KEY,
        cluster_id INTEGER NOT NULL REFERENCES clusters(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_cluster_account_ids_cluster
        ON cluster_account_ids(cluster_id);

    CREATE TABLE IF NOT EXISTS cluster_ips (
        value TEXT PRIMARY KEY,
        cluster_id INTEGER NOT NULL REFERENCES clusters(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_cluster_ips_cluster
        ON cluster_ips(cluster_id);
";

/// Index table for one attribute kind. The value column is the primary key,
/// so SQLite itself refuses a value owned by two clusters.
fn table(kind: AttributeKind) -> &'static str {
    match kind {
        AttributeKind::Fingerprint => "cluster_fingerprints",
        AttributeKind::AccountId => "cluster_account_ids",
        AttributeKind::Ip => "cluster_ips",
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn load_cluster(conn: &Connection, id: ClusterId) -> Result<Option<Cluster>> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM clusters WHERE id = ?1",
            params![id.0],
            |_| Ok(()),
        )
        .optional()?;
    if exists.is_none() {
        return Ok(None);
    }

    let mut cluster = Cluster::new(id);
    for kind in AttributeKind::ALL {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT value FROM {} WHERE cluster_id = ?1",
            table(kind)
        ))?;
        let values = stmt
            .query_map(params![id.0], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<BTreeSet<String>>>()?;
        *cluster.attributes_mut(kind) = values;
    }
    Ok(Some(cluster))
}

fn require_cluster(conn: &Connection, id: ClusterId) -> Result<Cluster> {
    load_cluster(conn, id)?
        .ok_or_else(|| LinkGuardError::Storage(format!("Cluster {} does not exist", id)))
}

fn owner(conn: &Connection, kind: AttributeKind, value: &str) -> Result<Option<ClusterId>> {
    Ok(conn
        .query_row(
            &format!("SELECT cluster_id FROM {} WHERE value = ?1", table(kind)),
            params![value],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .map(ClusterId))
}

/// Insert every attribute of `target` missing from `current`. A value owned
/// by any other cluster violates the primary key and aborts the transaction.
fn insert_missing(conn: &Connection, target: &Cluster, current: &Cluster) -> Result<()> {
    for (kind, value) in target.iter_attributes() {
        if current.contains(kind, value) {
            continue;
        }
        conn.execute(
            &format!(
                "INSERT INTO {} (value, cluster_id) VALUES (?1, ?2)",
                table(kind)
            ),
            params![value, target.id.0],
        )?;
    }
    Ok(())
}

fn touch(conn: &Connection, id: ClusterId) -> Result<()> {
    conn.execute(
        "UPDATE clusters SET updated_at = ?1 WHERE id = ?2",
        params![now_secs(), id.0],
    )?;
    Ok(())
}

fn apply_write(conn: &mut Connection, write: ClusterWrite) -> Result<ClusterId> {
    validate_write(&write)?;
    let tx = conn.transaction()?;

    let id = match write {
        ClusterWrite::Create { mut cluster } => {
            let now = now_secs();
            tx.execute(
                "INSERT INTO clusters (created_at, updated_at) VALUES (?1, ?2)",
                params![now, now],
            )?;
            cluster.id = ClusterId(tx.last_insert_rowid());
            insert_missing(&tx, &cluster, &Cluster::new(cluster.id))?;
            cluster.id
        }
        ClusterWrite::Extend { cluster } => {
            let current = require_cluster(&tx, cluster.id)?;
            if !cluster.is_superset_of(&current) {
                return Err(LinkGuardError::Storage(format!(
                    "Extending cluster {} would drop attributes",
                    cluster.id
                )));
            }
            insert_missing(&tx, &cluster, &current)?;
            touch(&tx, cluster.id)?;
            cluster.id
        }
        ClusterWrite::Merge { survivor, losers } => {
            let current = require_cluster(&tx, survivor.id)?;
            if !survivor.is_superset_of(&current) {
                return Err(LinkGuardError::Storage(format!(
                    "Merged cluster {} would drop its own attributes",
                    survivor.id
                )));
            }

            for loser in &losers {
                let absorbed = require_cluster(&tx, *loser)?;
                if !survivor.is_superset_of(&absorbed) {
                    return Err(LinkGuardError::Storage(format!(
                        "Merged cluster {} would drop attributes of cluster {}",
                        survivor.id, loser
                    )));
                }
                // Cascades to the loser's index rows
                let deleted = tx.execute("DELETE FROM clusters WHERE id = ?1", params![loser.0])?;
                if deleted != 1 {
                    return Err(LinkGuardError::Storage(format!(
                        "Cluster {} vanished during merge",
                        loser
                    )));
                }
            }

            insert_missing(&tx, &survivor, &current)?;
            touch(&tx, survivor.id)?;
            survivor.id
        }
    };

    tx.commit()?;
    Ok(id)
}

/// Cluster store backed by a SQLite database file.
///
/// The connection is shared behind a mutex and every call runs on the
/// blocking pool. A write runs to commit or rollback once started, even if the
/// request that issued it goes away.
#[derive(Clone)]
pub struct SqlClusterStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlClusterStore {
    /// Open (creating if needed) the database at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        info!("Opened cluster database at {:?}", path);
        Ok(store)
    }

    /// Volatile database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        debug!("Cluster database schema initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await?
    }
}

#[async_trait]
impl ClusterStore for SqlClusterStore {
    async fn find_matching(&self, signal: &Signal) -> Result<Vec<Cluster>> {
        let signal = signal.clone();
        self.with_conn(move |conn| {
            let conn: &Connection = conn;
            let mut ids = BTreeSet::new();
            for kind in AttributeKind::ALL {
                if let Some(id) = owner(conn, kind, signal.attribute(kind))? {
                    ids.insert(id);
                }
            }
            ids.into_iter()
                .map(|id| require_cluster(conn, id))
                .collect()
        })
        .await
    }

    async fn apply(&self, write: ClusterWrite) -> Result<ClusterId> {
        let id = self.with_conn(move |conn| apply_write(conn, write)).await?;
        debug!("Applied cluster write, result cluster {}", id);
        Ok(id)
    }

    async fn get(&self, id: ClusterId) -> Result<Option<Cluster>> {
        self.with_conn(move |conn| load_cluster(conn, id)).await
    }

    async fn lookup(&self, kind: Option<AttributeKind>, value: &str) -> Result<Option<Cluster>> {
        let value = value.to_string();
        self.with_conn(move |conn| {
            let kinds = match kind {
                Some(kind) => vec![kind],
                None => AttributeKind::ALL.to_vec(),
            };
            for kind in kinds {
                if let Some(id) = owner(conn, kind, &value)? {
                    return load_cluster(conn, id);
                }
            }
            Ok(None)
        })
        .await
    }

    async fn list(&self, limit: Option<usize>, offset: Option<usize>) -> Result<Vec<Cluster>> {
        // SQLite treats a negative LIMIT as unbounded
        let limit = limit.map_or(-1, |l| l.min(i64::MAX as usize) as i64);
        let offset = offset.unwrap_or(0).min(i64::MAX as usize) as i64;

        self.with_conn(move |conn| {
            let conn: &Connection = conn;
            let ids = {
                let mut stmt =
                    conn.prepare("SELECT id FROM clusters ORDER BY id LIMIT ?1 OFFSET ?2")?;
                let rows = stmt.query_map(params![limit, offset], |row| row.get::<_, i64>(0))?;
                rows.collect::<rusqlite::Result<Vec<i64>>>()?
            };
            ids.into_iter()
                .map(|id| require_cluster(conn, ClusterId(id)))
                .collect()
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.with_conn(|conn| {
            let count = |name: &str| -> Result<usize> {
                let n: i64 =
                    conn.query_row(&format!("SELECT COUNT(*) FROM {}", name), [], |row| {
                        row.get(0)
                    })?;
                Ok(n as usize)
            };
            Ok(StoreStats {
                clusters: count("clusters")?,
                fingerprints: count(table(AttributeKind::Fingerprint))?,
                account_ids: count(table(AttributeKind::AccountId))?,
                ips: count(table(AttributeKind::Ip))?,
            })
        })
        .await
    }
}
