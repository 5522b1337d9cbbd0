use rusqlite::{Connection, Result};

pub fn create_core_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tenants (
            tenant_id TEXT PRIMARY KEY,
            mailbox_address TEXT NOT NULL,
            display_name TEXT,
            access_token TEXT,
            refresh_token TEXT,
            active BOOLEAN NOT NULL DEFAULT true,
            last_checked_at TEXT,
            emails_processed INTEGER NOT NULL DEFAULT 0,
            emails_replied INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            config TEXT
        );

        CREATE TABLE IF NOT EXISTS processed_messages (
            tenant_id TEXT NOT NULL REFERENCES tenants(tenant_id) ON DELETE CASCADE,
            message_id TEXT NOT NULL,
            connection_address TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('sent', 'failed', 'skipped', 'queued')),
            sender_address TEXT,
            subject TEXT,
            analysis TEXT,
            response_text TEXT,
            error_detail TEXT,
            processed_at TEXT NOT NULL,
            PRIMARY KEY (tenant_id, message_id, connection_address)
        );

        CREATE TABLE IF NOT EXISTS rate_limit_state (
            tenant_id TEXT PRIMARY KEY REFERENCES tenants(tenant_id) ON DELETE CASCADE,
            burst_count INTEGER NOT NULL DEFAULT 0,
            burst_window_start TEXT,
            minute_count INTEGER NOT NULL DEFAULT 0,
            minute_window_start TEXT,
            hourly_count INTEGER NOT NULL DEFAULT 0,
            hour_window_start TEXT,
            daily_count INTEGER NOT NULL DEFAULT 0,
            day_window_start TEXT,
            last_sent_at TEXT,
            updated_at TEXT
        );

        CREATE TABLE IF NOT EXISTS queue_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL REFERENCES tenants(tenant_id) ON DELETE CASCADE,
            payload TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('pending', 'processing', 'done', 'error')),
            priority INTEGER NOT NULL DEFAULT 2,
            created_at TEXT NOT NULL,
            send_after TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS knowledge_documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL REFERENCES tenants(tenant_id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            UNIQUE (tenant_id, title)
        );

        CREATE TABLE IF NOT EXISTS custom_prompts (
            tenant_id TEXT PRIMARY KEY REFERENCES tenants(tenant_id) ON DELETE CASCADE,
            prompt TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_processed_tenant_time
            ON processed_messages(tenant_id, processed_at);
        CREATE INDEX IF NOT EXISTS idx_processed_status ON processed_messages(status);
        CREATE INDEX IF NOT EXISTS idx_queue_due ON queue_items(status, send_after, priority);
        CREATE INDEX IF NOT EXISTS idx_queue_tenant ON queue_items(tenant_id);
        "#,
    )?;

    Ok(())
}

/// One row per reserved send. The hourly and daily tiers count rows in the
/// trailing window; a row tied to a message lets a retried message reuse its
/// reservation.
pub fn create_send_reservations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS send_reservations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL REFERENCES tenants(tenant_id) ON DELETE CASCADE,
            message_id TEXT,
            reserved_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_reservations_tenant_time
            ON send_reservations(tenant_id, reserved_at);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_reservations_message
            ON send_reservations(tenant_id, message_id) WHERE message_id IS NOT NULL;
        "#,
    )
}
