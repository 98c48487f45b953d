use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use deepresearch_schema::memory::{LayerStats, MemoryLayer, MemoryRecord, MemoryRole, MemoryStats};
use deepresearch_schema::CoreError;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::task;
use uuid::Uuid;

use crate::migrations::run_migrations;

/// Process-lifetime activity counters per layer. Unlike `stored`/
/// `validated_count`, these are not persisted: they reset on restart,
/// which is acceptable since they describe recent operational activity
/// rather than durable record state.
#[derive(Debug, Clone, Copy, Default)]
struct LayerActivity {
    retrieved: usize,
    validated: usize,
    summarized: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct UserActivity {
    working: LayerActivity,
    episodic: LayerActivity,
    semantic: LayerActivity,
}

impl UserActivity {
    fn layer_mut(&mut self, layer: MemoryLayer) -> &mut LayerActivity {
        match layer {
            MemoryLayer::Working => &mut self.working,
            MemoryLayer::Episodic => &mut self.episodic,
            MemoryLayer::Semantic => &mut self.semantic,
        }
    }
}

fn lock_err(_: impl std::fmt::Debug) -> CoreError {
    CoreError::ProviderError("failed to lock sqlite connection".to_string())
}

fn sqlite_err(e: rusqlite::Error) -> CoreError {
    CoreError::ProviderError(format!("sqlite error: {e}"))
}

fn join_err(e: tokio::task::JoinError) -> CoreError {
    CoreError::ProviderError(format!("blocking task join error: {e}"))
}

/// A per-user sqlite-backed store for all three memory layers, partitioned
/// by the `layer` column. Every blocking call runs inside
/// `spawn_blocking`; the connection is shared behind `Arc<Mutex<_>>`.
#[derive(Clone)]
pub struct MemoryStore {
    db: Arc<Mutex<Connection>>,
    activity: Arc<Mutex<BTreeMap<String, UserActivity>>>,
}

impl MemoryStore {
    pub fn open(path: &str) -> Result<Self, CoreError> {
        let conn = Connection::open(path).map_err(sqlite_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(sqlite_err)?;
        run_migrations(&conn).map_err(sqlite_err)?;
        Ok(Self { db: Arc::new(Mutex::new(conn)), activity: Arc::new(Mutex::new(BTreeMap::new())) })
    }

    pub fn open_in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        run_migrations(&conn).map_err(sqlite_err)?;
        Ok(Self { db: Arc::new(Mutex::new(conn)), activity: Arc::new(Mutex::new(BTreeMap::new())) })
    }

    pub async fn insert(&self, user: &str, record: MemoryRecord) -> Result<MemoryRecord, CoreError> {
        if record.content.trim().is_empty() {
            return Err(CoreError::ValidationError {
                field: "content".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        let db = Arc::clone(&self.db);
        let user = user.to_string();
        let record_clone = record.clone();
        task::spawn_blocking(move || -> Result<(), CoreError> {
            let conn = db.lock().map_err(lock_err)?;
            let tags = serde_json::to_string(&record_clone.tags).unwrap_or_else(|_| "[]".into());
            let metadata = serde_json::to_string(&record_clone.metadata).unwrap_or_else(|_| "{}".into());
            conn.execute(
                "INSERT INTO memories (id, user, layer, role, content, tags, metadata, source, timestamp, validated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)",
                params![
                    record_clone.id.to_string(),
                    user,
                    record_clone.layer.as_str(),
                    role_str(record_clone.role),
                    record_clone.content,
                    tags,
                    metadata,
                    record_clone.source,
                    record_clone.timestamp.to_rfc3339(),
                ],
            )
            .map_err(sqlite_err)?;
            Ok(())
        })
        .await
        .map_err(join_err)??;

        Ok(record)
    }

    pub async fn list_for_user(&self, user: &str, layer: Option<MemoryLayer>) -> Result<Vec<MemoryRecord>, CoreError> {
        let db = Arc::clone(&self.db);
        let user = user.to_string();
        task::spawn_blocking(move || -> Result<Vec<MemoryRecord>, CoreError> {
            let conn = db.lock().map_err(lock_err)?;
            let mut rows = Vec::new();
            if let Some(layer) = layer {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, layer, role, content, tags, metadata, source, timestamp
                         FROM memories WHERE user = ?1 AND layer = ?2 ORDER BY timestamp DESC",
                    )
                    .map_err(sqlite_err)?;
                let mapped = stmt
                    .query_map(params![user, layer.as_str()], row_to_record)
                    .map_err(sqlite_err)?;
                for r in mapped {
                    rows.push(r.map_err(sqlite_err)?);
                }
            } else {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, layer, role, content, tags, metadata, source, timestamp
                         FROM memories WHERE user = ?1 ORDER BY timestamp DESC",
                    )
                    .map_err(sqlite_err)?;
                let mapped = stmt.query_map(params![user], row_to_record).map_err(sqlite_err)?;
                for r in mapped {
                    rows.push(r.map_err(sqlite_err)?);
                }
            }
            Ok(rows)
        })
        .await
        .map_err(join_err)?
    }

    pub async fn stats_for_user(&self, user: &str) -> Result<MemoryStats, CoreError> {
        let db = Arc::clone(&self.db);
        let user_s = user.to_string();
        let (working_stored, working_validated, episodic_stored, episodic_validated, semantic_stored, semantic_validated) =
            task::spawn_blocking(move || -> Result<(usize, usize, usize, usize, usize, usize), CoreError> {
                let conn = db.lock().map_err(lock_err)?;
                Ok((
                    count_layer(&conn, &user_s, "working")?,
                    count_validated_layer(&conn, &user_s, "working")?,
                    count_layer(&conn, &user_s, "episodic")?,
                    count_validated_layer(&conn, &user_s, "episodic")?,
                    count_layer(&conn, &user_s, "semantic")?,
                    count_validated_layer(&conn, &user_s, "semantic")?,
                ))
            })
            .await
            .map_err(join_err)??;

        let activity = {
            let guard = self.activity.lock().unwrap_or_else(|e| e.into_inner());
            guard.get(user).copied().unwrap_or_default()
        };

        let mut stats = MemoryStats::default();
        stats.working = LayerStats {
            stored: working_stored,
            retrieved: activity.working.retrieved,
            validated: activity.working.validated,
            summarized: activity.working.summarized,
            ephemeral_count: working_stored,
            validated_count: working_validated,
        };
        stats.episodic = LayerStats {
            stored: episodic_stored,
            retrieved: activity.episodic.retrieved,
            validated: activity.episodic.validated,
            summarized: activity.episodic.summarized,
            ephemeral_count: 0,
            validated_count: episodic_validated,
        };
        stats.semantic = LayerStats {
            stored: semantic_stored,
            retrieved: activity.semantic.retrieved,
            validated: activity.semantic.validated,
            summarized: activity.semantic.summarized,
            ephemeral_count: 0,
            validated_count: semantic_validated,
        };
        stats.recompute_totals();
        Ok(stats)
    }

    /// Marks a record as validated. Explicit callable only; never invoked
    /// implicitly by `insert`/`list_for_user`.
    pub async fn validate(&self, user: &str, id: Uuid) -> Result<bool, CoreError> {
        let db = Arc::clone(&self.db);
        let user_s = user.to_string();
        let id_s = id.to_string();
        let layer = task::spawn_blocking(move || -> Result<Option<MemoryLayer>, CoreError> {
            let conn = db.lock().map_err(lock_err)?;
            let layer: Option<String> = conn
                .query_row(
                    "SELECT layer FROM memories WHERE id = ?1 AND user = ?2",
                    params![id_s, user_s],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sqlite_err)?;
            Ok(layer.map(|l| layer_from_str(&l)))
        })
        .await
        .map_err(join_err)??;

        let Some(layer) = layer else {
            return Ok(false);
        };

        let db = Arc::clone(&self.db);
        let user_s = user.to_string();
        let id_s = id.to_string();
        let updated = task::spawn_blocking(move || -> Result<usize, CoreError> {
            let conn = db.lock().map_err(lock_err)?;
            conn.execute(
                "UPDATE memories SET validated = 1 WHERE id = ?1 AND user = ?2",
                params![id_s, user_s],
            )
            .map_err(sqlite_err)
        })
        .await
        .map_err(join_err)??;

        if updated > 0 {
            let mut activity = self.activity.lock().unwrap_or_else(|e| e.into_inner());
            activity.entry(user.to_string()).or_default().layer_mut(layer).validated += 1;
        }
        Ok(updated > 0)
    }

    /// Records that `count` memories were surfaced to a caller via `recall`.
    pub async fn record_retrieved(&self, user: &str, layer: MemoryLayer, count: usize) {
        let mut activity = self.activity.lock().unwrap_or_else(|e| e.into_inner());
        activity.entry(user.to_string()).or_default().layer_mut(layer).retrieved += count;
    }

    /// Records that a `summarize` call produced a new memory on `layer`.
    pub async fn record_summarized(&self, user: &str, layer: MemoryLayer) {
        let mut activity = self.activity.lock().unwrap_or_else(|e| e.into_inner());
        activity.entry(user.to_string()).or_default().layer_mut(layer).summarized += 1;
    }
}

fn count_layer(conn: &Connection, user: &str, layer: &str) -> Result<usize, CoreError> {
    conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE user = ?1 AND layer = ?2",
        params![user, layer],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map_err(sqlite_err)
    .map(|v| v.unwrap_or(0) as usize)
}

fn count_validated_layer(conn: &Connection, user: &str, layer: &str) -> Result<usize, CoreError> {
    conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE user = ?1 AND layer = ?2 AND validated = 1",
        params![user, layer],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map_err(sqlite_err)
    .map(|v| v.unwrap_or(0) as usize)
}

fn role_str(role: MemoryRole) -> &'static str {
    match role {
        MemoryRole::User => "user",
        MemoryRole::Assistant => "assistant",
        MemoryRole::System => "system",
    }
}

fn role_from_str(s: &str) -> MemoryRole {
    match s {
        "assistant" => MemoryRole::Assistant,
        "system" => MemoryRole::System,
        _ => MemoryRole::User,
    }
}

fn layer_from_str(s: &str) -> MemoryLayer {
    match s {
        "episodic" => MemoryLayer::Episodic,
        "semantic" => MemoryLayer::Semantic,
        _ => MemoryLayer::Working,
    }
}

fn row_to_record(row: &Row) -> rusqlite::Result<MemoryRecord> {
    let id: String = row.get(0)?;
    let layer: String = row.get(1)?;
    let role: String = row.get(2)?;
    let content: String = row.get(3)?;
    let tags: String = row.get(4)?;
    let metadata: String = row.get(5)?;
    let source: Option<String> = row.get(6)?;
    let timestamp: String = row.get(7)?;

    let tags: BTreeSet<String> = serde_json::from_str(&tags).unwrap_or_default();
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata).unwrap_or_default();
    let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&timestamp)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(MemoryRecord {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        layer: layer_from_str(&layer),
        role: role_from_str(&role),
        content,
        tags,
        metadata,
        source,
        timestamp,
        score: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepresearch_schema::memory::MemoryRecord as Rec;

    #[tokio::test]
    async fn insert_and_list_round_trips() {
        let store = MemoryStore::open_in_memory().unwrap();
        let record = Rec::new(MemoryLayer::Episodic, MemoryRole::User, "hello there")
            .with_tags(["greeting".to_string()]);
        let inserted = store.insert("alice", record.clone()).await.unwrap();
        assert_eq!(inserted.id, record.id);

        let listed = store.list_for_user("alice", Some(MemoryLayer::Episodic)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].content, "hello there");
        assert!(listed[0].tags.contains("greeting"));
    }

    #[tokio::test]
    async fn insert_rejects_empty_content() {
        let store = MemoryStore::open_in_memory().unwrap();
        let record = Rec::new(MemoryLayer::Working, MemoryRole::User, "   ");
        let err = store.insert("alice", record).await.unwrap_err();
        assert!(matches!(err, CoreError::ValidationError { .. }));
    }

    #[tokio::test]
    async fn stats_counts_per_layer() {
        let store = MemoryStore::open_in_memory().unwrap();
        store
            .insert("alice", Rec::new(MemoryLayer::Working, MemoryRole::User, "a"))
            .await
            .unwrap();
        store
            .insert("alice", Rec::new(MemoryLayer::Episodic, MemoryRole::User, "b"))
            .await
            .unwrap();
        let stats = store.stats_for_user("alice").await.unwrap();
        assert_eq!(stats.working.stored, 1);
        assert_eq!(stats.episodic.stored, 1);
        assert_eq!(stats.total_stored, 2);
        assert_eq!(stats.working.ephemeral_count, 1);
        assert_eq!(stats.episodic.ephemeral_count, 0);
    }

    #[tokio::test]
    async fn list_does_not_leak_across_users() {
        let store = MemoryStore::open_in_memory().unwrap();
        store
            .insert("alice", Rec::new(MemoryLayer::Working, MemoryRole::User, "secret"))
            .await
            .unwrap();
        let bob_records = store.list_for_user("bob", None).await.unwrap();
        assert!(bob_records.is_empty());
    }

    #[tokio::test]
    async fn validate_marks_record_and_is_explicit() {
        let store = MemoryStore::open_in_memory().unwrap();
        let record = store
            .insert("alice", Rec::new(MemoryLayer::Working, MemoryRole::User, "x"))
            .await
            .unwrap();
        let ok = store.validate("alice", record.id).await.unwrap();
        assert!(ok);
        let missing = store.validate("alice", Uuid::nil()).await.unwrap();
        assert!(!missing);

        let stats = store.stats_for_user("alice").await.unwrap();
        assert_eq!(stats.working.validated_count, 1);
        assert_eq!(stats.working.validated, 1);
    }

    #[tokio::test]
    async fn record_retrieved_and_summarized_feed_into_stats() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.record_retrieved("alice", MemoryLayer::Semantic, 3).await;
        store.record_summarized("alice", MemoryLayer::Episodic).await;

        let stats = store.stats_for_user("alice").await.unwrap();
        assert_eq!(stats.semantic.retrieved, 3);
        assert_eq!(stats.episodic.summarized, 1);
        assert_eq!(stats.total_retrieved, 3);
        assert_eq!(stats.total_summarized, 1);
    }
}
