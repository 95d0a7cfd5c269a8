use crate::app;
use crate::config::Config;
use crate::db::{SessionStore, SpySession};
use anyhow::Result;

use super::args::{CleanupCliArgs, SessionsCliArgs};

pub fn handle_sessions_command(args: SessionsCliArgs) -> Result<()> {
    let config = Config::load()?;
    let sessions = SessionStore::open(&config.database_path()?)?;
    let rows = sessions.list(args.limit)?;

    if rows.is_empty() {
        println!("No spy sessions recorded yet.");
        return Ok(());
    }

    println!("Found {} session(s):\n", rows.len());
    for session in &rows {
        println!("{}", format_session(session));
        println!("---");
    }

    Ok(())
}

pub async fn handle_cleanup_command(args: CleanupCliArgs) -> Result<()> {
    let outcome = app::run_cleanup_once(&args.call_id).await?;

    println!("Cleanup of {}: {}", args.call_id, outcome.as_str());
    if let Some(session_id) = outcome.session_id() {
        println!("Session: {}", session_id);
    }

    Ok(())
}

fn format_session(session: &SpySession) -> String {
    let mut lines = vec![
        format!("ID: {}", session.id),
        format!("Call: {}", session.buffalo_call_id),
        format!(
            "Agent: {} ({}) {} -> {}",
            session.agent_extension,
            session.direction,
            session.caller_info,
            session.destination_number
        ),
        format!("Status: {}", session.status.as_str()),
        format!("Created: {}", session.created_at),
    ];
    if let Some(path) = &session.audio_storage_path {
        lines.push(format!(
            "Recording: {} ({}s)",
            path, session.duration_seconds
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewSpySession;

    #[test]
    fn test_format_session_shows_recording_once_stored() {
        let store = SessionStore::in_memory().unwrap();
        let session = store
            .insert(&NewSpySession {
                buffalo_call_id: "c1".to_string(),
                provider_call_sid: "CA1".to_string(),
                agent_extension: "1001".to_string(),
                direction: "INBOUND".to_string(),
                caller_info: "Alice".to_string(),
                destination_number: "5551234567".to_string(),
            })
            .unwrap();

        let text = format_session(&session);
        assert!(text.contains("Agent: 1001 (INBOUND) Alice -> 5551234567"));
        assert!(text.contains("Status: initiated"));
        assert!(!text.contains("Recording:"));

        store
            .mark_recorded(&session.id, "RE1", "spy-recordings/s/RE1.wav", 42)
            .unwrap();
        let session = store.get(&session.id).unwrap().unwrap();
        assert!(format_session(&session).contains("Recording: spy-recordings/s/RE1.wav (42s)"));
    }
}
