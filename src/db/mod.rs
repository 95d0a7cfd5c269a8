mod init;
pub mod schemas;
pub mod sessions;


pub use init::{init_db, migrate};
pub use schemas::{NewSpySession, SessionStatus, SpySession};
pub use sessions::SpySessionRepository;

use anyhow::{anyhow, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Shared handle to the session database.
///
/// Calls are short single statements, so a blocking mutex around one
/// connection is enough for the monitor and the worker to share it.
#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_connection(init_db(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("session database lock poisoned"))?;
        f(&conn)
    }

    pub fn insert(&self, new: &NewSpySession) -> Result<SpySession> {
        self.with_conn(|conn| SpySessionRepository::insert(conn, new))
    }

    pub fn get(&self, id: &str) -> Result<Option<SpySession>> {
        self.with_conn(|conn| SpySessionRepository::get(conn, id))
    }

    pub fn find_by_buffalo_call_id(&self, buffalo_call_id: &str) -> Result<Option<SpySession>> {
        self.with_conn(|conn| SpySessionRepository::find_by_buffalo_call_id(conn, buffalo_call_id))
    }

    pub fn find_by_call_sid(&self, call_sid: &str) -> Result<Option<SpySession>> {
        self.with_conn(|conn| SpySessionRepository::find_by_call_sid(conn, call_sid))
    }

    pub fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        self.with_conn(|conn| SpySessionRepository::update_status(conn, id, status))
    }

    pub fn advance_status(&self, id: &str, status: SessionStatus) -> Result<bool> {
        self.with_conn(|conn| SpySessionRepository::advance_status(conn, id, status))
    }

    pub fn mark_recorded(
        &self,
        id: &str,
        recording_id: &str,
        audio_storage_path: &str,
        duration_seconds: i64,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            SpySessionRepository::mark_recorded(
                conn,
                id,
                recording_id,
                audio_storage_path,
                duration_seconds,
            )
        })
    }

    pub fn list(&self, limit: usize) -> Result<Vec<SpySession>> {
        self.with_conn(|conn| SpySessionRepository::list(conn, limit))
    }
}
