//! SQLite-backed store.
//!
//! One connection behind a mutex; WAL so external `switch.claim` processes
//! can share the file. Timestamps are fixed-width UTC strings, which keeps
//! SQL string comparison aligned with time order.

use std::path::Path;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;
use vigil_protocol::BroadcastPayload;
use vigil_protocol::LedgerEntry;
use vigil_protocol::LedgerKind;

use crate::error::Result;
use crate::error::SwitchError;
use crate::ledger::NewLedgerEntry;
use crate::store::GraceRecord;
use crate::store::PrimaryRecord;
use crate::store::SwitchStore;

const SCHEMA_SQL: &str = include_str!("schema.sql");

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SwitchError::storage_with(
                    format!("failed to create db directory {}", parent.display()),
                    Box::new(e),
                )
            })?;
        }
        let conn = Connection::open(path).map_err(|e| {
            SwitchError::storage_with(
                format!("failed to open db at {}", path.display()),
                Box::new(e),
            )
        })?;
        conn.busy_timeout(Duration::from_millis(5_000))?;
        // journal_mode returns a result row, so it cannot go through execute.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::apply_schema(&conn)?;
        tracing::debug!(path = %path.display(), "switch store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SwitchError::storage_with("failed to open in-memory db", Box::new(e)))?;
        Self::apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn apply_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| SwitchError::storage_with("failed to apply schema", Box::new(e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SwitchError::storage("store mutex poisoned"))
    }

    fn read_grace(conn: &Connection) -> Result<GraceRecord> {
        let row = conn
            .query_row(
                r#"
                SELECT trigger_at, active, payload, created_at, updated_at
                FROM grace_timer WHERE id = 1
                "#,
                [],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        let (trigger_at, active, payload, created_at, updated_at) =
            row.ok_or_else(|| SwitchError::storage("grace timer missing; store not bootstrapped"))?;
        Ok(GraceRecord {
            trigger_at: trigger_at.as_deref().map(parse_ts).transpose()?,
            active,
            payload: payload.as_deref().map(parse_payload).transpose()?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    }
}

impl SwitchStore for SqliteStore {
    fn bootstrap(&self, now: DateTime<Utc>, initial_expiry: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO primary_timer (id, target_expiry, terminal, created_at, updated_at)
            VALUES (1, ?1, 0, ?2, ?2)
            "#,
            params![fmt_ts(initial_expiry), fmt_ts(now)],
        )?;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO grace_timer (id, trigger_at, active, payload, created_at, updated_at)
            VALUES (1, NULL, 0, NULL, ?1, ?1)
            "#,
            params![fmt_ts(now)],
        )?;
        Ok(())
    }

    fn primary(&self) -> Result<PrimaryRecord> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT target_expiry, terminal, created_at, updated_at
                FROM primary_timer WHERE id = 1
                "#,
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        let (target_expiry, terminal, created_at, updated_at) = row.ok_or_else(|| {
            SwitchError::storage("primary timer missing; store not bootstrapped")
        })?;
        Ok(PrimaryRecord {
            target_expiry: parse_ts(&target_expiry)?,
            terminal,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    }

    fn grace(&self) -> Result<GraceRecord> {
        let conn = self.conn()?;
        Self::read_grace(&conn)
    }

    fn set_primary_expiry(&self, target_expiry: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        // Touches only the expiry column; the terminal latch stays where it is.
        let changed = conn.execute(
            "UPDATE primary_timer SET target_expiry = ?1, updated_at = ?2 WHERE id = 1",
            params![fmt_ts(target_expiry), fmt_ts(now)],
        )?;
        if changed == 0 {
            return Err(SwitchError::storage(
                "primary timer missing; store not bootstrapped",
            ));
        }
        Ok(())
    }

    fn arm_grace(
        &self,
        trigger_at: DateTime<Utc>,
        payload: &BroadcastPayload,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let payload = serde_json::to_string(payload)
            .map_err(|e| SwitchError::storage_with("failed to encode payload", Box::new(e)))?;
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE grace_timer SET trigger_at = ?1, active = 1, payload = ?2, updated_at = ?3
            WHERE id = 1
            "#,
            params![fmt_ts(trigger_at), payload, fmt_ts(now)],
        )?;
        if changed == 0 {
            return Err(SwitchError::storage(
                "grace timer missing; store not bootstrapped",
            ));
        }
        Ok(())
    }

    fn disarm_grace(&self, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE grace_timer SET active = 0, updated_at = ?1 WHERE id = 1 AND active = 1",
            params![fmt_ts(now)],
        )?;
        Ok(changed == 1)
    }

    fn claim_grace(&self, now: DateTime<Utc>) -> Result<Option<GraceRecord>> {
        let conn = self.conn()?;
        // The whole exactly-once guarantee is this conditional update: only
        // the caller whose UPDATE flips `active` proceeds to publish.
        let changed = conn.execute(
            r#"
            UPDATE grace_timer SET active = 0, updated_at = ?1
            WHERE id = 1 AND active = 1 AND trigger_at IS NOT NULL AND trigger_at <= ?2
            "#,
            params![fmt_ts(now), fmt_ts(now)],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(Self::read_grace(&conn)?))
    }

    fn set_terminal(&self, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE primary_timer SET terminal = 1, updated_at = ?1 WHERE id = 1",
            params![fmt_ts(now)],
        )?;
        Ok(())
    }

    fn append(&self, entry: &NewLedgerEntry) -> Result<LedgerEntry> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO ledger (kind, actor, occurred_at, location, remainder_seconds, details)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                entry.kind.as_str(),
                entry.actor,
                fmt_ts(entry.occurred_at),
                entry.location,
                entry.remainder_seconds,
                entry.details.to_string()
            ],
        )?;
        let seq = conn.last_insert_rowid() as u64;
        Ok(entry.clone().into_entry(seq))
    }

    fn count_resets(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ledger WHERE kind = ?1",
            params![LedgerKind::Reset.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn count_resets_since(&self, since: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ledger WHERE kind = ?1 AND occurred_at >= ?2",
            params![LedgerKind::Reset.as_str(), fmt_ts(since)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn recent(&self, limit: u32) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT seq, kind, actor, occurred_at, location, remainder_seconds, details
            FROM ledger ORDER BY seq DESC LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (seq, kind, actor, occurred_at, location, remainder_seconds, details) = row?;
            entries.push(LedgerEntry {
                seq: seq as u64,
                kind: parse_kind(&kind)?,
                actor,
                occurred_at: parse_ts(&occurred_at)?,
                location,
                remainder_seconds,
                details: serde_json::from_str(&details).map_err(|e| {
                    SwitchError::storage_with("corrupt ledger details", Box::new(e))
                })?,
            });
        }
        Ok(entries)
    }

    fn ledger_len(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM ledger", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SwitchError::storage_with(format!("bad timestamp '{raw}'"), Box::new(e)))
}

fn parse_payload(raw: &str) -> Result<BroadcastPayload> {
    serde_json::from_str(raw)
        .map_err(|e| SwitchError::storage_with("corrupt grace payload", Box::new(e)))
}

fn parse_kind(raw: &str) -> Result<LedgerKind> {
    LedgerKind::parse(raw)
        .ok_or_else(|| SwitchError::storage(format!("unknown ledger kind '{raw}'")))
}
