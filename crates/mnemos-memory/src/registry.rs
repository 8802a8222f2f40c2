//! Agent Registry.
//!
//! The minimal record of which agents exist, so agent memories have an owner
//! to validate against and to cascade from.
//!
//! # Storage layout
//!
//! A single table `agents` is created (if it does not already exist):
//!
//! | column      | type | description                                  |
//! |-------------|------|----------------------------------------------|
//! | id          | TEXT | UUID v4 primary key                          |
//! | name        | TEXT | Unique agent name                            |
//! | description | TEXT | Optional free-form description               |
//! | created_at  | TEXT | RFC-3339 registration timestamp (UTC)        |
//! | updated_at  | TEXT | RFC-3339 timestamp of the last accepted write |
//!
//! Re-registering an existing name updates its description and stamps
//! `updated_at`; the id is stable.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use mnemos_types::Agent;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::store::StorageLocation;

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let id: String = row.get(0)?;
    let created: String = row.get(3)?;
    let updated: String = row.get(4)?;
    let parse_ts = |idx: usize, raw: &str| {
        raw.parse::<DateTime<Utc>>()
            .map_err(|e| rusqlite::Error::InvalidColumnType(idx, e.to_string(), Type::Text))
    };
    Ok(Agent {
        id: Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), Type::Text))?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: parse_ts(3, &created)?,
        updated_at: parse_ts(4, &updated)?,
    })
}

/// SQLite-backed registry of agents.
pub struct AgentRegistry {
    conn: Mutex<Connection>,
}

impl AgentRegistry {
    pub fn open(location: &StorageLocation) -> Result<Self> {
        let conn = location.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agents (
                id          TEXT NOT NULL PRIMARY KEY,
                name        TEXT NOT NULL UNIQUE,
                description TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a temporary in-memory registry (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(&StorageLocation::InMemory)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| MemoryError::IndexUnavailable("agent registry lock poisoned".to_string()))
    }

    /// Register `name`, or update the description of an existing agent with
    /// that name. Returns the stored agent.
    pub fn register(&self, name: &str, description: Option<&str>) -> Result<Agent> {
        if name.trim().is_empty() {
            return Err(MemoryError::EmptyContent);
        }
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let existing: Option<String> = conn
            .query_row("SELECT id FROM agents WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?;
        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE agents SET description = ?1, updated_at = ?2 WHERE id = ?3",
                    params![description, now, id],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO agents (id, name, description, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![Uuid::new_v4().to_string(), name, description, now],
                )?;
            }
        }
        let agent = conn.query_row(
            "SELECT id, name, description, created_at, updated_at FROM agents WHERE name = ?1",
            params![name],
            row_to_agent,
        )?;
        Ok(agent)
    }

    pub fn get(&self, id: &Uuid) -> Result<Agent> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, description, created_at, updated_at FROM agents WHERE id = ?1",
            params![id.to_string()],
            row_to_agent,
        )
        .optional()?
        .ok_or_else(|| MemoryError::NotFound(format!("agent {id}")))
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<Agent>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, name, description, created_at, updated_at FROM agents WHERE name = ?1",
                params![name],
                row_to_agent,
            )
            .optional()?)
    }

    /// Every agent, oldest registration first.
    pub fn list(&self) -> Result<Vec<Agent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, description, created_at, updated_at
             FROM agents
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([], row_to_agent)?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row?);
        }
        Ok(agents)
    }

    /// Remove an agent. Returns [`MemoryError::NotFound`] if absent.
    pub fn remove(&self, id: &Uuid) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM agents WHERE id = ?1", params![id.to_string()])?;
        if changed == 0 {
            return Err(MemoryError::NotFound(format!("agent {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_get() {
        let reg = AgentRegistry::open_in_memory().unwrap();
        let agent = reg.register("researcher", Some("digs up sources")).unwrap();
        assert_eq!(agent.name, "researcher");
        assert_eq!(agent.created_at, agent.updated_at);
        assert_eq!(reg.get(&agent.id).unwrap(), agent);
    }

    #[test]
    fn reregister_keeps_id_and_stamps_updated_at() {
        let reg = AgentRegistry::open_in_memory().unwrap();
        let first = reg.register("writer", None).unwrap();
        let second = reg.register("writer", Some("drafts reports")).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.description.as_deref(), Some("drafts reports"));
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(reg.list().unwrap().len(), 1);
    }

    #[test]
    fn register_rejects_blank_name() {
        let reg = AgentRegistry::open_in_memory().unwrap();
        assert!(matches!(reg.register("  ", None).unwrap_err(), MemoryError::EmptyContent));
    }

    #[test]
    fn lookup_by_name() {
        let reg = AgentRegistry::open_in_memory().unwrap();
        let agent = reg.register("planner", None).unwrap();
        assert_eq!(reg.get_by_name("planner").unwrap().unwrap().id, agent.id);
        assert!(reg.get_by_name("nobody").unwrap().is_none());
    }

    #[test]
    fn list_in_registration_order() {
        let reg = AgentRegistry::open_in_memory().unwrap();
        let names = ["a", "b", "c"];
        for n in names {
            reg.register(n, None).unwrap();
        }
        let listed: Vec<String> = reg.list().unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(listed, names);
    }

    #[test]
    fn remove_then_get_is_not_found() {
        let reg = AgentRegistry::open_in_memory().unwrap();
        let agent = reg.register("temp", None).unwrap();
        reg.remove(&agent.id).unwrap();
        assert!(matches!(reg.get(&agent.id).unwrap_err(), MemoryError::NotFound(_)));
        assert!(matches!(reg.remove(&agent.id).unwrap_err(), MemoryError::NotFound(_)));
    }
}
