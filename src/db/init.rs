use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;

pub fn init_db(db_path: &Path) -> Result<Connection> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let conn = Connection::open(db_path).context("Failed to open database connection")?;

    migrate(&conn)?;

    Ok(conn)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS spy_sessions (
            id TEXT PRIMARY KEY,
            buffalo_call_id TEXT NOT NULL,
            provider_call_sid TEXT,
            agent_extension TEXT NOT NULL,
            direction TEXT NOT NULL,
            caller_info TEXT NOT NULL,
            destination_number TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'initiated',
            recording_id TEXT,
            audio_storage_path TEXT,
            duration_seconds INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            recorded_at TEXT
        )",
        [],
    )
    .context("Failed to create spy_sessions table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_spy_sessions_buffalo_call_id ON spy_sessions(buffalo_call_id)",
        [],
    )
    .context("Failed to create buffalo_call_id index")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_spy_sessions_call_sid ON spy_sessions(provider_call_sid)",
        [],
    )
    .context("Failed to create provider_call_sid index")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_spy_sessions_created_at ON spy_sessions(created_at DESC)",
        [],
    )
    .context("Failed to create created_at index")?;

    Ok(())
}
