//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_all()` checks the
//! current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_address TEXT NOT NULL,
            flow TEXT NOT NULL,
            level INTEGER NOT NULL,
            message TEXT NOT NULL,
            bad_response_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_address);

        CREATE TABLE IF NOT EXISTS cursors (
            user_address TEXT PRIMARY KEY,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id),
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS history_conversations (
            id TEXT PRIMARY KEY,
            user_address TEXT NOT NULL,
            flow TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'in_progress',
            reason TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_history_user ON history_conversations(user_address);
        CREATE INDEX IF NOT EXISTS idx_history_status ON history_conversations(status);

        CREATE TABLE IF NOT EXISTS document_files (
            id TEXT PRIMARY KEY,
            owner_address TEXT NOT NULL,
            driver_id TEXT,
            media_id TEXT NOT NULL,
            media_url TEXT NOT NULL,
            kind TEXT NOT NULL,
            side TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_documents_owner ON document_files(owner_address);
        CREATE INDEX IF NOT EXISTS idx_documents_driver ON document_files(driver_id);

        CREATE TABLE IF NOT EXISTS drivers (
            id TEXT PRIMARY KEY,
            phone TEXT NOT NULL UNIQUE,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            birth_date TEXT,
            remote_profile_id TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS driver_licenses (
            id TEXT PRIMARY KEY,
            driver_id TEXT NOT NULL REFERENCES drivers(id),
            license_number TEXT NOT NULL,
            issue_date TEXT,
            expiry_date TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_licenses_driver ON driver_licenses(driver_id);

        CREATE TABLE IF NOT EXISTS cars (
            id TEXT PRIMARY KEY,
            plate TEXT NOT NULL,
            make TEXT NOT NULL,
            color TEXT NOT NULL,
            first_registration TEXT,
            remote_vehicle_id TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS driver_car_associations (
            id TEXT PRIMARY KEY,
            driver_id TEXT NOT NULL REFERENCES drivers(id),
            car_id TEXT NOT NULL REFERENCES cars(id),
            start_date TEXT NOT NULL,
            end_date TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_associations_driver
            ON driver_car_associations(driver_id);

        CREATE TABLE IF NOT EXISTS otp_verifications (
            id TEXT PRIMARY KEY,
            phone TEXT NOT NULL,
            code TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            used INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_otp_phone ON otp_verifications(phone);

        CREATE TABLE IF NOT EXISTS inbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL UNIQUE,
            payload TEXT NOT NULL,
            received_at TEXT NOT NULL
        );
    "#,
}];

/// Apply all migrations newer than the recorded schema version.
pub async fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("creating _migrations: {e}")))?;

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("reading version: {e}")))?;
    let current: i64 = match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?
    {
        Some(row) => row
            .get(0)
            .map_err(|e| DatabaseError::Migration(e.to_string()))?,
        None => 0,
    };

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!("migration {} failed: {e}", migration.name))
            })?;
        conn.execute(
            "INSERT INTO _migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            libsql::params![
                migration.version,
                migration.name,
                chrono::Utc::now().to_rfc3339()
            ],
        )
        .await
        .map_err(|e| DatabaseError::Migration(format!("recording {}: {e}", migration.name)))?;
    }

    Ok(())
}
