//! Durable operation log and purge strategies for the page tree.

use crate::{Operation, Result};
use rusqlite::{Connection, Transaction};
use serde::{Deserialize, Serialize};

/// Seconds in one day; used to convert `retention_days` to a Unix timestamp cutoff.
const SECONDS_PER_DAY: i64 = 86_400;

/// Controls which old operations are removed from the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PurgeStrategy {
    /// Retain only the most recent `keep_last` operations.
    KeepLast {
        #[serde(rename = "keepLast")]
        keep_last: usize,
    },
    /// Remove operations older than `retention_days`.
    Retention {
        #[serde(rename = "retentionDays")]
        retention_days: u32,
    },
}

impl Default for PurgeStrategy {
    fn default() -> Self {
        Self::KeepLast { keep_last: 1_000 }
    }
}

/// A row of the operation log without its full payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSummary {
    pub operation_id: String,
    pub timestamp: i64,
    pub actor: Option<String>,
    pub operation_type: String,
    pub target_path: String,
}

/// Records structural mutations to the `operations` table and purges stale entries.
pub struct OperationLog {
    strategy: PurgeStrategy,
}

impl OperationLog {
    /// Creates a new `OperationLog` with the given purge strategy.
    pub fn new(strategy: PurgeStrategy) -> Self {
        Self { strategy }
    }

    /// Serialises `op` and appends it to the `operations` table within `tx`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PageTreeError::Database`] if the INSERT fails, or
    /// [`crate::PageTreeError::Json`] if `op` cannot be serialised.
    pub fn log(&self, tx: &Transaction, op: &Operation) -> Result<()> {
        let op_json = serde_json::to_string(op)?;

        tx.execute(
            "INSERT INTO operations (operation_id, timestamp, actor, operation_type, operation_data)
             VALUES (?, ?, ?, ?, ?)",
            rusqlite::params![
                op.operation_id(),
                op.timestamp(),
                op.actor(),
                op.type_name(),
                op_json,
            ],
        )?;

        Ok(())
    }

    /// Deletes old operations from the log according to the purge strategy.
    ///
    /// Call this after every [`log`](Self::log) call to keep the table bounded in size.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PageTreeError::Database`] if the DELETE fails.
    pub fn purge_if_needed(&self, tx: &Transaction) -> Result<()> {
        match self.strategy {
            PurgeStrategy::KeepLast { keep_last } => {
                tx.execute(
                    "DELETE FROM operations WHERE id NOT IN (
                        SELECT id FROM operations ORDER BY id DESC LIMIT ?
                    )",
                    [keep_last as i64],
                )?;
            }
            PurgeStrategy::Retention { retention_days } => {
                let cutoff = chrono::Utc::now().timestamp()
                    - (retention_days as i64 * SECONDS_PER_DAY);
                tx.execute("DELETE FROM operations WHERE timestamp < ?", [cutoff])?;
            }
        }
        Ok(())
    }

    /// Lists logged operations, newest first, optionally filtered by type.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PageTreeError::Database`] or [`crate::PageTreeError::Json`]
    /// if a stored row cannot be read back.
    pub fn list(
        &self,
        conn: &Connection,
        operation_type: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<OperationSummary>> {
        let mut stmt = conn.prepare(
            "SELECT operation_data FROM operations
             WHERE (?1 IS NULL OR operation_type = ?1)
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let payloads = stmt
            .query_map(rusqlite::params![operation_type, limit], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        payloads
            .iter()
            .map(|json| {
                let op: Operation = serde_json::from_str(json)?;
                Ok(OperationSummary {
                    operation_id: op.operation_id().to_string(),
                    timestamp: op.timestamp(),
                    actor: op.actor().map(str::to_string),
                    operation_type: op.type_name().to_string(),
                    target_path: op.target_path().to_string(),
                })
            })
            .collect()
    }

    /// Deletes every logged operation and returns how many were removed.
    pub fn purge_all(&self, conn: &Connection) -> Result<usize> {
        Ok(conn.execute("DELETE FROM operations", [])?)
    }
}
