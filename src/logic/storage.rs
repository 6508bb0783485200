//! Audit Storage - append-only incident and action log
//!
//! SQLite as a durable append log: one row per incident state transition
//! and per action record update, full JSON payload alongside the indexed
//! columns. The core only relies on append, `load_recent`, and the open-
//! incident lookup used to reopen state after a restart - the engine
//! behind this interface is replaceable.

use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use super::incident::Incident;
use super::response::ActionRecord;

// ============================================================================
// RECORD KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Incident,
    Action,
}

// ============================================================================
// EVENT STORE
// ============================================================================

pub struct EventStore {
    conn: Mutex<Connection>,
}

impl EventStore {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        log::info!("Audit store opened at {:?}", path);
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Default location under the local data directory
    pub fn open_default() -> rusqlite::Result<Self> {
        Self::open(&default_db_path())
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS incident_log (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                incident_id TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                state       TEXT NOT NULL,
                severity    TEXT NOT NULL,
                attack_type TEXT NOT NULL,
                source      TEXT NOT NULL,
                payload     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_incident_log_id ON incident_log(incident_id);
            CREATE INDEX IF NOT EXISTS idx_incident_log_time ON incident_log(recorded_at);

            CREATE TABLE IF NOT EXISTS action_log (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id   TEXT NOT NULL,
                incident_id TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                status      TEXT NOT NULL,
                kind        TEXT NOT NULL,
                payload     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_action_log_time ON action_log(recorded_at);",
        )
    }

    /// Append one incident state transition
    pub fn record_incident(&self, incident: &Incident) -> rusqlite::Result<()> {
        let payload = serde_json::to_string(incident).unwrap_or_else(|_| "{}".to_string());
        self.conn.lock().execute(
            "INSERT INTO incident_log
             (incident_id, recorded_at, state, severity, attack_type, source, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                incident.id.to_string(),
                Utc::now().to_rfc3339(),
                incident.state.as_str(),
                incident.severity.as_str(),
                incident.attack_type.as_str(),
                incident.source.to_string(),
                payload,
            ],
        )?;
        Ok(())
    }

    /// Append one action record snapshot
    pub fn record_action(&self, record: &ActionRecord) -> rusqlite::Result<()> {
        let payload = serde_json::to_string(record).unwrap_or_else(|_| "{}".to_string());
        self.conn.lock().execute(
            "INSERT INTO action_log
             (record_id, incident_id, recorded_at, status, kind, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id.to_string(),
                record.request.incident_id.to_string(),
                Utc::now().to_rfc3339(),
                record.status.as_str(),
                record.request.kind.as_str(),
                payload,
            ],
        )?;
        Ok(())
    }

    /// All rows of a kind recorded at or after `since`, newest last
    pub fn load_recent(
        &self,
        kind: RecordKind,
        since: DateTime<Utc>,
    ) -> rusqlite::Result<Vec<serde_json::Value>> {
        let table = match kind {
            RecordKind::Incident => "incident_log",
            RecordKind::Action => "action_log",
        };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT payload FROM {} WHERE recorded_at >= ?1 ORDER BY seq ASC",
            table
        ))?;
        let rows = stmt.query_map(params![since.to_rfc3339()], |row| {
            row.get::<_, String>(0)
        })?;

        let mut out = Vec::new();
        for row in rows {
            let text = row?;
            match serde_json::from_str(&text) {
                Ok(value) => out.push(value),
                Err(e) => log::warn!("Skipping unreadable audit row: {}", e),
            }
        }
        Ok(out)
    }

    /// Latest snapshot of every incident whose last recorded state is not
    /// terminal - the reopen set after a restart.
    pub fn load_open_incidents(&self) -> rusqlite::Result<Vec<Incident>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT payload, state FROM incident_log
             WHERE seq IN (SELECT MAX(seq) FROM incident_log GROUP BY incident_id)
               AND state NOT IN ('resolved', 'expired')",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for row in rows {
            let text = row?;
            match serde_json::from_str::<Incident>(&text) {
                Ok(incident) => out.push(incident),
                Err(e) => log::warn!("Skipping unreadable incident snapshot: {}", e),
            }
        }
        Ok(out)
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("net-security")
        .join("audit.db")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::capture::FlowRef;
    use crate::logic::detect::{AnomalyScore, AttackType, ScoreMethod};
    use crate::logic::incident::IncidentState;
    use crate::logic::response::{ActionKind, ActionRequest, ActionTarget};
    use chrono::Duration;
    use std::collections::HashMap;

    fn incident() -> Incident {
        Incident::new(AnomalyScore {
            score: 0.85,
            confidence: 0.9,
            method: ScoreMethod::Statistical,
            attack_type: AttackType::BruteForce,
            explanation: "test".to_string(),
            triggered: vec![],
            flow: FlowRef::default(),
            observed_at: Utc::now(),
        })
    }

    #[test]
    fn test_append_and_load_recent() {
        let store = EventStore::in_memory().unwrap();
        let mut inc = incident();
        store.record_incident(&inc).unwrap();
        inc.state = IncidentState::Open;
        store.record_incident(&inc).unwrap();

        let rows = store
            .load_recent(RecordKind::Incident, Utc::now() - Duration::minutes(1))
            .unwrap();
        assert_eq!(rows.len(), 2);

        let old = store
            .load_recent(RecordKind::Incident, Utc::now() + Duration::minutes(1))
            .unwrap();
        assert!(old.is_empty());
    }

    #[test]
    fn test_open_incident_reload() {
        let store = EventStore::in_memory().unwrap();

        let mut open = incident();
        open.state = IncidentState::Open;
        store.record_incident(&open).unwrap();

        let mut closed = incident();
        closed.state = IncidentState::Open;
        store.record_incident(&closed).unwrap();
        closed.state = IncidentState::Resolved;
        store.record_incident(&closed).unwrap();

        let reopened = store.load_open_incidents().unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened[0].id, open.id);
    }

    #[test]
    fn test_action_log_round_trip() {
        let store = EventStore::in_memory().unwrap();
        let record = crate::logic::response::ActionRecord::new(ActionRequest {
            incident_id: uuid::Uuid::new_v4(),
            kind: ActionKind::FirewallBlock,
            target: ActionTarget { ip: "10.0.0.1".parse().unwrap(), port: None },
            params: HashMap::new(),
            duration: None,
            dry_run: false,
        });
        store.record_action(&record).unwrap();

        let rows = store
            .load_recent(RecordKind::Action, Utc::now() - Duration::minutes(1))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["request"]["kind"], "FirewallBlock");
    }

    #[test]
    fn test_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        {
            let store = EventStore::open(&path).unwrap();
            store.record_incident(&incident()).unwrap();
        }
        let store = EventStore::open(&path).unwrap();
        let rows = store
            .load_recent(RecordKind::Incident, Utc::now() - Duration::minutes(1))
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
