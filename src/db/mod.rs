use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;

use self::models::{
    InboundMessage, KnowledgeDocument, ProcessedRecord, QueueItem, QueueStatus, RateLimitState,
    RecordStatus, RollingUsage, Tenant,
};

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

pub mod migrations;
pub mod models;
pub mod schema;

const BUSY_TIMEOUT_SECONDS: u64 = 5;

/// Fixed-width UTC timestamp so that TEXT comparison in SQL orders correctly.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|value| value.with_timezone(&Utc))
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_tenants: i64,
    pub active_tenants: i64,
    pub records_by_status: Vec<StatusCount>,
    pub queue_by_status: Vec<StatusCount>,
    pub knowledge_documents: i64,
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.busy_timeout(StdDuration::from_secs(BUSY_TIMEOUT_SECONDS))?;

        let mut db = Self {
            conn,
            path: path.to_path_buf(),
        };
        db.initialize()?;
        Ok(db)
    }

    pub fn initialize(&mut self) -> Result<(), DbError> {
        self.run_migrations()
    }

    fn run_migrations(&mut self) -> Result<(), DbError> {
        migrations::migrate(&self.conn)
            .map_err(|e| DbError::Config(format!("migration failed: {e}")))
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".ars").join("ars.db"))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` inside a `BEGIN IMMEDIATE` transaction. The write lock is taken
    /// up front, so concurrent writers on other connections serialize behind it.
    pub fn immediate<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), DbError> {
        let config_json = tenant
            .config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            r#"
            INSERT INTO tenants (
                tenant_id, mailbox_address, display_name, access_token, refresh_token, active,
                last_checked_at, emails_processed, emails_replied, config
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id) DO UPDATE SET
                mailbox_address = excluded.mailbox_address,
                display_name = excluded.display_name,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                active = excluded.active,
                last_checked_at = excluded.last_checked_at,
                config = excluded.config
            "#,
            params![
                tenant.tenant_id,
                tenant.mailbox_address,
                tenant.display_name,
                tenant.access_token,
                tenant.refresh_token,
                tenant.active,
                tenant.last_checked_at,
                tenant.emails_processed,
                tenant.emails_replied,
                config_json,
            ],
        )?;

        Ok(())
    }

    pub fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT tenant_id, mailbox_address, display_name, access_token, refresh_token, active,
                   last_checked_at, emails_processed, emails_replied, created_at, config
            FROM tenants
            WHERE tenant_id = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([tenant_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Tenant::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_tenants(&self) -> Result<Vec<Tenant>, DbError> {
        self.query_tenants("")
    }

    pub fn list_active_tenants(&self) -> Result<Vec<Tenant>, DbError> {
        self.query_tenants("WHERE active = 1")
    }

    fn query_tenants(&self, clause: &str) -> Result<Vec<Tenant>, DbError> {
        let sql = format!(
            r#"
            SELECT tenant_id, mailbox_address, display_name, access_token, refresh_token, active,
                   last_checked_at, emails_processed, emails_replied, created_at, config
            FROM tenants
            {clause}
            ORDER BY tenant_id ASC
            "#
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let tenants = stmt
            .query_map([], Tenant::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tenants)
    }

    pub fn remove_tenant(&self, tenant_id: &str) -> Result<usize, DbError> {
        let deleted = self
            .conn
            .execute("DELETE FROM tenants WHERE tenant_id = ?", [tenant_id])?;
        Ok(deleted)
    }

    pub fn set_tenant_active(&self, tenant_id: &str, active: bool) -> Result<usize, DbError> {
        let updated = self.conn.execute(
            "UPDATE tenants SET active = ? WHERE tenant_id = ?",
            params![active, tenant_id],
        )?;
        Ok(updated)
    }

    pub fn update_tenant_tokens(
        &self,
        tenant_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), DbError> {
        // A grant without a refresh token (client credentials) keeps the stored one.
        self.conn.execute(
            r#"
            UPDATE tenants
            SET access_token = ?, refresh_token = COALESCE(?, refresh_token)
            WHERE tenant_id = ?
            "#,
            params![access_token, refresh_token, tenant_id],
        )?;
        Ok(())
    }

    /// Moves the watermark forward; an older value never overwrites a newer one.
    pub fn advance_watermark(&self, tenant_id: &str, at: DateTime<Utc>) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            UPDATE tenants
            SET last_checked_at = ?1
            WHERE tenant_id = ?2 AND (last_checked_at IS NULL OR last_checked_at < ?1)
            "#,
            params![timestamp(at), tenant_id],
        )?;
        Ok(())
    }

    pub fn bump_tenant_counters(
        &self,
        tenant_id: &str,
        processed: i64,
        replied: i64,
    ) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            UPDATE tenants
            SET emails_processed = emails_processed + ?,
                emails_replied = emails_replied + ?
            WHERE tenant_id = ?
            "#,
            params![processed, replied, tenant_id],
        )?;
        Ok(())
    }

    pub fn processed_ids(
        &self,
        tenant_id: &str,
        connection_address: &str,
    ) -> Result<HashSet<String>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id FROM processed_messages WHERE tenant_id = ? AND connection_address = ?",
        )?;
        let ids = stmt
            .query_map(params![tenant_id, connection_address], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(ids)
    }

    pub fn get_processed(
        &self,
        tenant_id: &str,
        message_id: &str,
        connection_address: &str,
    ) -> Result<Option<ProcessedRecord>, DbError> {
        let record = self
            .conn
            .query_row(
                r#"
                SELECT tenant_id, message_id, connection_address, status, sender_address, subject,
                       analysis, response_text, error_detail, processed_at
                FROM processed_messages
                WHERE tenant_id = ? AND message_id = ? AND connection_address = ?
                "#,
                params![tenant_id, message_id, connection_address],
                ProcessedRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn upsert_processed(&self, record: &ProcessedRecord) -> Result<(), DbError> {
        let analysis = record
            .analysis
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            r#"
            INSERT INTO processed_messages (
                tenant_id, message_id, connection_address, status, sender_address, subject,
                analysis, response_text, error_detail, processed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id, message_id, connection_address) DO UPDATE SET
                status = excluded.status,
                analysis = COALESCE(excluded.analysis, processed_messages.analysis),
                response_text = COALESCE(excluded.response_text, processed_messages.response_text),
                error_detail = excluded.error_detail,
                processed_at = excluded.processed_at
            "#,
            params![
                record.tenant_id,
                record.message_id,
                record.connection_address,
                record.status.as_str(),
                record.sender_address,
                record.subject,
                analysis,
                record.response_text,
                record.error_detail,
                record.processed_at,
            ],
        )?;
        Ok(())
    }

    pub fn list_processed(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<ProcessedRecord>, DbError> {
        let limit = if limit == 0 { 50 } else { limit };
        let mut stmt = self.conn.prepare(
            r#"
            SELECT tenant_id, message_id, connection_address, status, sender_address, subject,
                   analysis, response_text, error_detail, processed_at
            FROM processed_messages
            WHERE tenant_id = ?
            ORDER BY processed_at DESC
            LIMIT ?
            "#,
        )?;
        let records = stmt
            .query_map(params![tenant_id, limit as i64], ProcessedRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn count_records_with_status(
        &self,
        tenant_id: &str,
        status: RecordStatus,
    ) -> Result<i64, DbError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM processed_messages WHERE tenant_id = ? AND status = ?",
            params![tenant_id, status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn get_rate_limit_state(&self, tenant_id: &str) -> Result<Option<RateLimitState>, DbError> {
        load_rate_limit_state(&self.conn, tenant_id)
    }

    /// Drops the counters and the reservation log for a tenant.
    pub fn reset_rate_limit_state(&self, tenant_id: &str) -> Result<usize, DbError> {
        self.immediate(|conn| {
            let state = conn.execute("DELETE FROM rate_limit_state WHERE tenant_id = ?", [tenant_id])?;
            let reservations =
                conn.execute("DELETE FROM send_reservations WHERE tenant_id = ?", [tenant_id])?;
            Ok(state + reservations)
        })
    }

    pub fn insert_queue_item(
        &self,
        tenant_id: &str,
        message: &InboundMessage,
        priority: i64,
        now: DateTime<Utc>,
        send_after: DateTime<Utc>,
    ) -> Result<i64, DbError> {
        let payload = serde_json::to_string(message)?;
        self.conn.execute(
            r#"
            INSERT INTO queue_items (
                tenant_id, payload, status, priority, created_at, send_after, attempts, updated_at
            ) VALUES (?, ?, 'pending', ?, ?, ?, 0, ?)
            "#,
            params![
                tenant_id,
                payload,
                priority,
                timestamp(now),
                timestamp(send_after),
                timestamp(now),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Flips the most urgent due `pending` item to `processing` in one statement,
    /// so two workers never claim the same item.
    pub fn claim_queue_item(&self, now: DateTime<Utc>) -> Result<Option<QueueItem>, DbError> {
        let now = timestamp(now);
        let item = self
            .conn
            .query_row(
                r#"
                UPDATE queue_items
                SET status = 'processing', attempts = attempts + 1, updated_at = ?1
                WHERE id = (
                    SELECT id FROM queue_items
                    WHERE status = 'pending' AND send_after <= ?1
                    ORDER BY priority DESC, created_at ASC, id ASC
                    LIMIT 1
                )
                RETURNING id, tenant_id, payload, status, priority, created_at, send_after,
                          attempts, last_error
                "#,
                params![now],
                QueueItem::from_row,
            )
            .optional()?;
        Ok(item)
    }

    pub fn set_queue_status(
        &self,
        id: i64,
        status: QueueStatus,
        last_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let updated = self.conn.execute(
            "UPDATE queue_items SET status = ?, last_error = ?, updated_at = ? WHERE id = ?",
            params![status.as_str(), last_error, timestamp(now), id],
        )?;
        Ok(updated)
    }

    /// Returns items stuck in `processing` since before `older_than` to `pending`.
    pub fn requeue_stale_items(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let updated = self.conn.execute(
            r#"
            UPDATE queue_items
            SET status = 'pending', updated_at = ?
            WHERE status = 'processing' AND updated_at < ?
            "#,
            params![timestamp(now), timestamp(older_than)],
        )?;
        Ok(updated)
    }

    /// Puts a claimed item back to `pending` until `send_after`.
    pub fn defer_queue_item(
        &self,
        id: i64,
        send_after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let updated = self.conn.execute(
            r#"
            UPDATE queue_items
            SET status = 'pending', send_after = ?, updated_at = ?
            WHERE id = ?
            "#,
            params![timestamp(send_after), timestamp(now), id],
        )?;
        Ok(updated)
    }

    pub fn count_queue_items_by_status(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<(QueueStatus, i64)>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) AS count FROM queue_items WHERE tenant_id = ? GROUP BY status",
        )?;
        let counts = stmt
            .query_map([tenant_id], |row| {
                Ok((models::enum_from_row(row, "status")?, row.get("count")?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }

    pub fn get_queue_item(&self, id: i64) -> Result<Option<QueueItem>, DbError> {
        let item = self
            .conn
            .query_row(
                r#"
                SELECT id, tenant_id, payload, status, priority, created_at, send_after, attempts,
                       last_error
                FROM queue_items
                WHERE id = ?
                "#,
                [id],
                QueueItem::from_row,
            )
            .optional()?;
        Ok(item)
    }

    pub fn list_queue_items(
        &self,
        tenant_id: &str,
        status: Option<QueueStatus>,
    ) -> Result<Vec<QueueItem>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, tenant_id, payload, status, priority, created_at, send_after, attempts,
                   last_error
            FROM queue_items
            WHERE tenant_id = ?1 AND (?2 IS NULL OR status = ?2)
            ORDER BY id ASC
            "#,
        )?;
        let items = stmt
            .query_map(
                params![tenant_id, status.map(QueueStatus::as_str)],
                QueueItem::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    pub fn upsert_knowledge_document(
        &self,
        tenant_id: &str,
        title: &str,
        content: &str,
    ) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO knowledge_documents (tenant_id, title, content)
            VALUES (?, ?, ?)
            ON CONFLICT(tenant_id, title) DO UPDATE SET content = excluded.content
            "#,
            params![tenant_id, title, content],
        )?;
        Ok(())
    }

    pub fn list_knowledge_documents(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<KnowledgeDocument>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, tenant_id, title, content, created_at
            FROM knowledge_documents
            WHERE tenant_id = ?
            ORDER BY id ASC
            "#,
        )?;
        let documents = stmt
            .query_map([tenant_id], KnowledgeDocument::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(documents)
    }

    pub fn set_custom_prompt(&self, tenant_id: &str, prompt: &str) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO custom_prompts (tenant_id, prompt, updated_at)
            VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            ON CONFLICT(tenant_id) DO UPDATE SET
                prompt = excluded.prompt,
                updated_at = excluded.updated_at
            "#,
            params![tenant_id, prompt],
        )?;
        Ok(())
    }

    pub fn get_custom_prompt(&self, tenant_id: &str) -> Result<Option<String>, DbError> {
        let prompt = self
            .conn
            .query_row(
                "SELECT prompt FROM custom_prompts WHERE tenant_id = ?",
                [tenant_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(prompt.filter(|value| !value.trim().is_empty()))
    }

    pub fn get_stats(&self) -> Result<DatabaseStats, DbError> {
        let total_tenants: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM tenants", [], |row| row.get(0))?;
        let active_tenants: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tenants WHERE active = 1",
            [],
            |row| row.get(0),
        )?;
        let knowledge_documents: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM knowledge_documents", [], |row| {
                    row.get(0)
                })?;

        let records_by_status = self.status_counts("processed_messages")?;
        let queue_by_status = self.status_counts("queue_items")?;

        Ok(DatabaseStats {
            total_tenants,
            active_tenants,
            records_by_status,
            queue_by_status,
            knowledge_documents,
        })
    }

    fn status_counts(&self, table: &str) -> Result<Vec<StatusCount>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT status, COUNT(*) AS count FROM {table} GROUP BY status ORDER BY status ASC"
        ))?;
        let counts = stmt
            .query_map([], |row| {
                Ok(StatusCount {
                    status: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }
}

pub(crate) fn load_rate_limit_state(
    conn: &Connection,
    tenant_id: &str,
) -> Result<Option<RateLimitState>, DbError> {
    let state = conn
        .query_row(
            r#"
            SELECT tenant_id, burst_count, burst_window_start, minute_count, minute_window_start,
                   hourly_count, hour_window_start, daily_count, day_window_start, last_sent_at
            FROM rate_limit_state
            WHERE tenant_id = ?
            "#,
            [tenant_id],
            RateLimitState::from_row,
        )
        .optional()?;
    Ok(state)
}

pub(crate) fn store_rate_limit_state(
    conn: &Connection,
    state: &RateLimitState,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let fmt = |value: Option<DateTime<Utc>>| value.map(timestamp);
    conn.execute(
        r#"
        INSERT INTO rate_limit_state (
            tenant_id, burst_count, burst_window_start, minute_count, minute_window_start,
            hourly_count, hour_window_start, daily_count, day_window_start, last_sent_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(tenant_id) DO UPDATE SET
            burst_count = excluded.burst_count,
            burst_window_start = excluded.burst_window_start,
            minute_count = excluded.minute_count,
            minute_window_start = excluded.minute_window_start,
            hourly_count = excluded.hourly_count,
            hour_window_start = excluded.hour_window_start,
            daily_count = excluded.daily_count,
            day_window_start = excluded.day_window_start,
            last_sent_at = excluded.last_sent_at,
            updated_at = excluded.updated_at
        "#,
        params![
            state.tenant_id,
            state.burst_count,
            fmt(state.burst_window_start),
            state.minute_count,
            fmt(state.minute_window_start),
            state.hourly_count,
            fmt(state.hour_window_start),
            state.daily_count,
            fmt(state.day_window_start),
            fmt(state.last_sent_at),
            timestamp(now),
        ],
    )?;
    Ok(())
}

/// Reply-bound sends for a tenant at or after `since`: `queued` or `sent`
/// records, plus reservations whose message has no record yet (a send still
/// being analysed by this or another process).
pub(crate) fn count_outbound_since(
    conn: &Connection,
    tenant_id: &str,
    since: DateTime<Utc>,
) -> Result<i64, DbError> {
    let count = conn.query_row(
        r#"
        SELECT
            (SELECT COUNT(*) FROM processed_messages
             WHERE tenant_id = ?1 AND status IN ('queued', 'sent') AND processed_at >= ?2)
          + (SELECT COUNT(*) FROM send_reservations r
             WHERE r.tenant_id = ?1 AND r.reserved_at >= ?2 AND r.message_id IS NOT NULL
               AND NOT EXISTS (
                   SELECT 1 FROM processed_messages p
                   WHERE p.tenant_id = r.tenant_id AND p.message_id = r.message_id
               ))
        "#,
        params![tenant_id, timestamp(since)],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Reservations made after `now - 1h` and `now - 1d`. Windows are half-open,
/// so a reservation exactly one hour old has left the hourly window.
pub(crate) fn rolling_usage(
    conn: &Connection,
    tenant_id: &str,
    now: DateTime<Utc>,
) -> Result<RollingUsage, DbError> {
    let window = |span: Duration| -> Result<(i64, Option<DateTime<Utc>>), DbError> {
        let (count, oldest): (i64, Option<String>) = conn.query_row(
            r#"
            SELECT COUNT(*), MIN(reserved_at) FROM send_reservations
            WHERE tenant_id = ? AND reserved_at > ?
            "#,
            params![tenant_id, timestamp(now - span)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((count, oldest.as_deref().and_then(parse_timestamp)))
    };
    let (hour, hour_oldest) = window(Duration::hours(1))?;
    let (day, day_oldest) = window(Duration::days(1))?;
    Ok(RollingUsage {
        hour,
        hour_oldest,
        day,
        day_oldest,
    })
}

pub(crate) fn has_reservation(
    conn: &Connection,
    tenant_id: &str,
    message_id: &str,
) -> Result<bool, DbError> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM send_reservations WHERE tenant_id = ? AND message_id = ?)",
        params![tenant_id, message_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Records one reserved send and forgets reservations older than a day.
pub(crate) fn insert_reservation(
    conn: &Connection,
    tenant_id: &str,
    message_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    conn.execute(
        "DELETE FROM send_reservations WHERE tenant_id = ? AND reserved_at <= ?",
        params![tenant_id, timestamp(now - Duration::days(1))],
    )?;
    conn.execute(
        "INSERT INTO send_reservations (tenant_id, message_id, reserved_at) VALUES (?, ?, ?)",
        params![tenant_id, message_id, timestamp(now)],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    use super::{count_outbound_since, timestamp, Database};
    use crate::db::models::{InboundMessage, ProcessedRecord, QueueStatus, RecordStatus, Tenant};

    fn temp_db_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("ars-test-{}.db", Uuid::new_v4()));
        path
    }

    fn sample_message(id: &str) -> InboundMessage {
        InboundMessage {
            id: id.to_string(),
            subject: Some("Admission requirements".to_string()),
            from_address: Some("student@example.com".to_string()),
            from_name: Some("Student".to_string()),
            body_text: Some("What documents do I need?".to_string()),
            body_preview: None,
            received_at: "2026-02-01T12:00:00Z".to_string(),
            conversation_id: None,
        }
    }

    fn record(message_id: &str, status: RecordStatus, at: chrono::DateTime<Utc>) -> ProcessedRecord {
        ProcessedRecord {
            tenant_id: "t-1".to_string(),
            message_id: message_id.to_string(),
            connection_address: "office@example.edu".to_string(),
            status,
            sender_address: Some("student@example.com".to_string()),
            subject: None,
            analysis: None,
            response_text: Some("Thanks".to_string()),
            error_detail: None,
            processed_at: timestamp(at),
        }
    }

    #[test]
    fn tenant_roundtrip_and_token_update() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        let mut tenant = Tenant::new("t-1", "office@example.edu");
        tenant.refresh_token = Some("refresh-1".to_string());
        db.upsert_tenant(&tenant).expect("insert tenant");

        db.update_tenant_tokens("t-1", "access-2", None)
            .expect("update tokens");
        let loaded = db.get_tenant("t-1").expect("get").expect("exists");
        assert_eq!(loaded.access_token.as_deref(), Some("access-2"));
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh-1"));

        db.set_tenant_active("t-1", false).expect("deactivate");
        assert!(db.list_active_tenants().expect("list").is_empty());
        assert_eq!(db.list_tenants().expect("list").len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        db.upsert_tenant(&Tenant::new("t-1", "office@example.edu"))
            .expect("insert tenant");

        let later = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        db.advance_watermark("t-1", later).expect("advance");
        db.advance_watermark("t-1", later - Duration::hours(1))
            .expect("advance older");

        let tenant = db.get_tenant("t-1").expect("get").expect("exists");
        assert_eq!(tenant.watermark(), Some(later));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn processed_upsert_is_idempotent_per_composite_key() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        db.upsert_tenant(&Tenant::new("t-1", "office@example.edu"))
            .expect("insert tenant");

        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        db.upsert_processed(&record("m-1", RecordStatus::Queued, at))
            .expect("queued");
        let mut sent = record("m-1", RecordStatus::Sent, at);
        sent.response_text = None;
        db.upsert_processed(&sent).expect("sent");

        let loaded = db
            .get_processed("t-1", "m-1", "office@example.edu")
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.status, RecordStatus::Sent);
        assert_eq!(loaded.response_text.as_deref(), Some("Thanks"));
        assert_eq!(
            db.processed_ids("t-1", "office@example.edu")
                .expect("ids")
                .len(),
            1
        );
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn outbound_count_ignores_skipped_and_old_records() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        db.upsert_tenant(&Tenant::new("t-1", "office@example.edu"))
            .expect("insert tenant");

        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        db.upsert_processed(&record("m-1", RecordStatus::Queued, now))
            .expect("insert");
        db.upsert_processed(&record("m-2", RecordStatus::Skipped, now))
            .expect("insert");
        db.upsert_processed(&record("m-3", RecordStatus::Sent, now - Duration::minutes(5)))
            .expect("insert");

        let count = count_outbound_since(db.conn(), "t-1", now - Duration::seconds(30))
            .expect("count");
        assert_eq!(count, 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn queue_claim_respects_priority_and_send_after() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        db.upsert_tenant(&Tenant::new("t-1", "office@example.edu"))
            .expect("insert tenant");

        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let low = db
            .insert_queue_item("t-1", &sample_message("m-low"), 1, now, now)
            .expect("enqueue low");
        let high = db
            .insert_queue_item("t-1", &sample_message("m-high"), 3, now, now)
            .expect("enqueue high");
        db.insert_queue_item(
            "t-1",
            &sample_message("m-later"),
            3,
            now,
            now + Duration::hours(1),
        )
        .expect("enqueue later");

        let first = db.claim_queue_item(now).expect("claim").expect("item");
        assert_eq!(first.id, high);
        assert_eq!(first.status, QueueStatus::Processing);
        assert_eq!(first.attempts, 1);
        assert_eq!(first.payload.id, "m-high");

        let second = db.claim_queue_item(now).expect("claim").expect("item");
        assert_eq!(second.id, low);
        assert!(db.claim_queue_item(now).expect("claim").is_none());

        db.set_queue_status(high, QueueStatus::Done, None, now)
            .expect("done");
        let done = db.get_queue_item(high).expect("get").expect("exists");
        assert_eq!(done.status, QueueStatus::Done);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn stats_count_tenants_records_and_queue() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        db.upsert_tenant(&Tenant::new("t-1", "office@example.edu"))
            .expect("insert tenant");
        let now = Utc::now();
        db.upsert_processed(&record("m-1", RecordStatus::Skipped, now))
            .expect("insert");
        db.insert_queue_item("t-1", &sample_message("m-2"), 2, now, now)
            .expect("enqueue");
        db.upsert_knowledge_document("t-1", "fees", "Tuition is due in May.")
            .expect("knowledge");

        let stats = db.get_stats().expect("stats");
        assert_eq!(stats.total_tenants, 1);
        assert_eq!(stats.active_tenants, 1);
        assert_eq!(stats.knowledge_documents, 1);
        assert_eq!(stats.records_by_status[0].status, "skipped");
        assert_eq!(stats.queue_by_status[0].count, 1);
        let _ = std::fs::remove_file(path);
    }
}
