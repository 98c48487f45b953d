use rusqlite::Connection;

/// Applies the memory schema. Idempotent: safe to call on every open.
pub fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS memories (
            id TEXT PRIMARY KEY,
            user TEXT NOT NULL,
            layer TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            source TEXT,
            timestamp TEXT NOT NULL,
            validated INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_memories_user_layer ON memories(user, layer);
        "#,
    )
}
