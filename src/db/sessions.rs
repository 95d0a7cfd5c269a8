//! Spy session persistence.
//!
//! CRUD operations for the `spy_sessions` table, raw SQL with rusqlite.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::schemas::{NewSpySession, SessionStatus, SpySession};

const COLUMNS: &str = "id, buffalo_call_id, provider_call_sid, agent_extension, direction, \
     caller_info, destination_number, status, recording_id, audio_storage_path, \
     duration_seconds, created_at, updated_at, recorded_at";

fn now() -> String {
    // Fixed width so text ordering matches time ordering.
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<SpySession> {
    let status: String = row.get(7)?;
    let status = SessionStatus::parse(&status).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(SpySession {
        id: row.get(0)?,
        buffalo_call_id: row.get(1)?,
        provider_call_sid: row.get(2)?,
        agent_extension: row.get(3)?,
        direction: row.get(4)?,
        caller_info: row.get(5)?,
        destination_number: row.get(6)?,
        status,
        recording_id: row.get(8)?,
        audio_storage_path: row.get(9)?,
        duration_seconds: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
        recorded_at: row.get(13)?,
    })
}

pub struct SpySessionRepository;

impl SpySessionRepository {
    /// Insert a session in `initiated` status and return it.
    pub fn insert(conn: &Connection, new: &NewSpySession) -> Result<SpySession> {
        let id = uuid::Uuid::new_v4().to_string();
        let ts = now();

        conn.execute(
            "INSERT INTO spy_sessions (id, buffalo_call_id, provider_call_sid, agent_extension, \
             direction, caller_info, destination_number, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id,
                new.buffalo_call_id,
                new.provider_call_sid,
                new.agent_extension,
                new.direction,
                new.caller_info,
                new.destination_number,
                SessionStatus::Initiated.as_str(),
                ts,
            ],
        )
        .context("Failed to insert spy session")?;

        Self::get(conn, &id)?.context("Inserted spy session not found")
    }

    pub fn get(conn: &Connection, id: &str) -> Result<Option<SpySession>> {
        conn.query_row(
            &format!("SELECT {} FROM spy_sessions WHERE id = ?1", COLUMNS),
            params![id],
            from_row,
        )
        .optional()
        .context("Failed to query spy session")
    }

    /// Most recent session for a PBX call id.
    pub fn find_by_buffalo_call_id(
        conn: &Connection,
        buffalo_call_id: &str,
    ) -> Result<Option<SpySession>> {
        conn.query_row(
            &format!(
                "SELECT {} FROM spy_sessions WHERE buffalo_call_id = ?1 \
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                COLUMNS
            ),
            params![buffalo_call_id],
            from_row,
        )
        .optional()
        .context("Failed to query spy session by buffalo call id")
    }

    pub fn find_by_call_sid(conn: &Connection, call_sid: &str) -> Result<Option<SpySession>> {
        conn.query_row(
            &format!(
                "SELECT {} FROM spy_sessions WHERE provider_call_sid = ?1 \
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                COLUMNS
            ),
            params![call_sid],
            from_row,
        )
        .optional()
        .context("Failed to query spy session by call sid")
    }

    pub fn update_status(conn: &Connection, id: &str, status: SessionStatus) -> Result<()> {
        conn.execute(
            "UPDATE spy_sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now(), id],
        )
        .context("Failed to update spy session status")?;
        Ok(())
    }

    /// Move a session forward only while the provider call is still active.
    /// Returns whether a row changed.
    pub fn advance_status(conn: &Connection, id: &str, status: SessionStatus) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE spy_sessions SET status = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND status IN ('initiated', 'calling', 'in_progress')",
                params![status.as_str(), now(), id],
            )
            .context("Failed to advance spy session status")?;
        Ok(changed > 0)
    }

    /// Attach a persisted recording and mark the session `recorded`.
    /// Returns `false` when the session already had one; nothing is changed.
    pub fn mark_recorded(
        conn: &Connection,
        id: &str,
        recording_id: &str,
        audio_storage_path: &str,
        duration_seconds: i64,
    ) -> Result<bool> {
        let ts = now();
        let changed = conn
            .execute(
                "UPDATE spy_sessions SET recording_id = ?1, audio_storage_path = ?2, \
                 duration_seconds = ?3, status = ?4, recorded_at = ?5, updated_at = ?5 \
                 WHERE id = ?6 AND recording_id IS NULL",
                params![
                    recording_id,
                    audio_storage_path,
                    duration_seconds,
                    SessionStatus::Recorded.as_str(),
                    ts,
                    id,
                ],
            )
            .context("Failed to mark spy session recorded")?;

        if changed == 0 {
            if Self::get(conn, id)?.is_none() {
                anyhow::bail!("Spy session {} not found", id);
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// List sessions, newest first.
    pub fn list(conn: &Connection, limit: usize) -> Result<Vec<SpySession>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM spy_sessions ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                COLUMNS
            ))
            .context("Failed to prepare spy sessions list query")?;

        let rows = stmt
            .query_map(params![limit as i64], from_row)
            .context("Failed to list spy sessions")?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }

        Ok(sessions)
    }
}
