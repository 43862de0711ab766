//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; `libsql::Connection` is `Send + Sync` and safe
//! for concurrent async use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::catalog::FlowId;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::model::{
    Car, CarAssociation, DocumentFile, DocumentKind, DocumentSide, Driver, DriverLicense,
    HistoryReason, HistoryRow, HistoryStatus, InboxEntry, LedgerRow, OtpRow,
};
use crate::store::traits::Database;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn q(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

/// Parse an RFC 3339 datetime string; falls back to the epoch on garbage.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_date(s: &Option<String>) -> Option<NaiveDate> {
    s.as_ref()
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

fn date_to_str(d: &Option<NaiveDate>) -> Option<String> {
    d.map(|d| d.format("%Y-%m-%d").to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s}: {e}")))
}

fn parse_flow(s: &str) -> Result<FlowId, DatabaseError> {
    FlowId::parse(s).ok_or_else(|| DatabaseError::Serialization(format!("unknown flow {s}")))
}

fn row_to_ledger(row: &libsql::Row) -> Result<LedgerRow, DatabaseError> {
    let flow_str: String = row.get(2).map_err(q)?;
    Ok(LedgerRow {
        id: row.get(0).map_err(q)?,
        user_address: row.get(1).map_err(q)?,
        flow: parse_flow(&flow_str)?,
        level: row.get::<i64>(3).map_err(q)? as u8,
        message: row.get(4).map_err(q)?,
        bad_response_count: row.get::<i64>(5).map_err(q)? as u32,
        created_at: parse_datetime(&row.get::<String>(6).map_err(q)?),
    })
}

const LEDGER_COLUMNS: &str =
    "id, user_address, flow, level, message, bad_response_count, created_at";

fn row_to_history(row: &libsql::Row) -> Result<HistoryRow, DatabaseError> {
    let id: String = row.get(0).map_err(q)?;
    let flow_str: String = row.get(2).map_err(q)?;
    let status_str: String = row.get(3).map_err(q)?;
    let reason_str: Option<String> = row.get(4).ok();
    Ok(HistoryRow {
        id: parse_uuid(&id)?,
        user_address: row.get(1).map_err(q)?,
        flow: parse_flow(&flow_str)?,
        status: HistoryStatus::parse(&status_str).unwrap_or(HistoryStatus::InProgress),
        reason: reason_str.as_deref().and_then(HistoryReason::parse),
        created_at: parse_datetime(&row.get::<String>(5).map_err(q)?),
        updated_at: parse_datetime(&row.get::<String>(6).map_err(q)?),
    })
}

const HISTORY_COLUMNS: &str = "id, user_address, flow, status, reason, created_at, updated_at";

fn row_to_document(row: &libsql::Row) -> Result<DocumentFile, DatabaseError> {
    let id: String = row.get(0).map_err(q)?;
    let driver_id: Option<String> = row.get(2).ok();
    let kind_str: String = row.get(5).map_err(q)?;
    let side_str: String = row.get(6).map_err(q)?;
    Ok(DocumentFile {
        id: parse_uuid(&id)?,
        owner_address: row.get(1).map_err(q)?,
        driver_id: driver_id.as_deref().map(parse_uuid).transpose()?,
        media_id: row.get(3).map_err(q)?,
        media_url: row.get(4).map_err(q)?,
        kind: DocumentKind::parse(&kind_str)
            .ok_or_else(|| DatabaseError::Serialization(format!("unknown kind {kind_str}")))?,
        side: DocumentSide::parse(&side_str)
            .ok_or_else(|| DatabaseError::Serialization(format!("unknown side {side_str}")))?,
        created_at: parse_datetime(&row.get::<String>(7).map_err(q)?),
    })
}

const DOCUMENT_COLUMNS: &str =
    "id, owner_address, driver_id, media_id, media_url, kind, side, created_at";

fn row_to_driver(row: &libsql::Row) -> Result<Driver, DatabaseError> {
    let id: String = row.get(0).map_err(q)?;
    Ok(Driver {
        id: parse_uuid(&id)?,
        phone: row.get(1).map_err(q)?,
        first_name: row.get(2).map_err(q)?,
        last_name: row.get(3).map_err(q)?,
        birth_date: parse_date(&row.get(4).ok()),
        remote_profile_id: row.get(5).ok(),
        created_at: parse_datetime(&row.get::<String>(6).map_err(q)?),
    })
}

fn row_to_car(row: &libsql::Row) -> Result<Car, DatabaseError> {
    let id: String = row.get(0).map_err(q)?;
    Ok(Car {
        id: parse_uuid(&id)?,
        plate: row.get(1).map_err(q)?,
        make: row.get(2).map_err(q)?,
        color: row.get(3).map_err(q)?,
        first_registration: parse_date(&row.get(4).ok()),
        remote_vehicle_id: row.get(5).ok(),
        created_at: parse_datetime(&row.get::<String>(6).map_err(q)?),
    })
}

fn row_to_association(row: &libsql::Row) -> Result<CarAssociation, DatabaseError> {
    let id: String = row.get(0).map_err(q)?;
    let driver_id: String = row.get(1).map_err(q)?;
    let car_id: String = row.get(2).map_err(q)?;
    let end_date: Option<String> = row.get(4).ok();
    Ok(CarAssociation {
        id: parse_uuid(&id)?,
        driver_id: parse_uuid(&driver_id)?,
        car_id: parse_uuid(&car_id)?,
        start_date: parse_datetime(&row.get::<String>(3).map_err(q)?),
        end_date: end_date.map(|s| parse_datetime(&s)),
    })
}

fn row_to_otp(row: &libsql::Row) -> Result<OtpRow, DatabaseError> {
    let id: String = row.get(0).map_err(q)?;
    Ok(OtpRow {
        id: parse_uuid(&id)?,
        phone: row.get(1).map_err(q)?,
        code: row.get(2).map_err(q)?,
        expires_at: parse_datetime(&row.get::<String>(3).map_err(q)?),
        used: row.get::<i64>(4).map_err(q)? != 0,
        created_at: parse_datetime(&row.get::<String>(5).map_err(q)?),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_all(self.conn()).await
    }

    // ── Conversation ledger + cursor ────────────────────────────────

    async fn append_ledger_row(
        &self,
        user: &str,
        flow: FlowId,
        level: u8,
        message: &str,
    ) -> Result<LedgerRow, DatabaseError> {
        let now = Utc::now();
        self.conn()
            .execute(
                "INSERT INTO conversations \
                 (user_address, flow, level, message, bad_response_count, created_at) \
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![
                    user,
                    flow.as_str(),
                    level as i64,
                    message,
                    now.to_rfc3339()
                ],
            )
            .await
            .map_err(q)?;
        let id = self.conn().last_insert_rowid();

        // Cursor moves in the same write path as every append.
        self.conn()
            .execute(
                "INSERT INTO cursors (user_address, conversation_id, updated_at) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(user_address) DO UPDATE SET \
                 conversation_id = excluded.conversation_id, updated_at = excluded.updated_at",
                params![user, id, now.to_rfc3339()],
            )
            .await
            .map_err(q)?;

        Ok(LedgerRow {
            id,
            user_address: user.to_string(),
            flow,
            level,
            message: message.to_string(),
            bad_response_count: 0,
            created_at: now,
        })
    }

    async fn current_row(&self, user: &str) -> Result<Option<LedgerRow>, DatabaseError> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM conversations \
             WHERE id = (SELECT conversation_id FROM cursors WHERE user_address = ?1)"
        );
        let mut rows = self.conn().query(&sql, params![user]).await.map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => Ok(Some(row_to_ledger(&row)?)),
            None => Ok(None),
        }
    }

    async fn ledger_rows(&self, user: &str) -> Result<Vec<LedgerRow>, DatabaseError> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM conversations \
             WHERE user_address = ?1 ORDER BY id DESC"
        );
        let mut rows = self.conn().query(&sql, params![user]).await.map_err(q)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(q)? {
            out.push(row_to_ledger(&row)?);
        }
        Ok(out)
    }

    async fn find_ledger_row(
        &self,
        user: &str,
        flow: FlowId,
        level: u8,
    ) -> Result<Option<LedgerRow>, DatabaseError> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM conversations \
             WHERE user_address = ?1 AND flow = ?2 AND level = ?3 \
             ORDER BY id DESC LIMIT 1"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![user, flow.as_str(), level as i64])
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => Ok(Some(row_to_ledger(&row)?)),
            None => Ok(None),
        }
    }

    async fn increment_bad_response(&self, row_id: i64) -> Result<u32, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE conversations SET bad_response_count = bad_response_count + 1 \
                 WHERE id = ?1",
                params![row_id],
            )
            .await
            .map_err(q)?;
        let mut rows = self
            .conn()
            .query(
                "SELECT bad_response_count FROM conversations WHERE id = ?1",
                params![row_id],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(q)? as u32),
            None => Err(DatabaseError::NotFound {
                entity: "conversation".into(),
                key: row_id.to_string(),
            }),
        }
    }

    async fn pop_current_row(&self, user: &str) -> Result<Option<LedgerRow>, DatabaseError> {
        let Some(current) = self.current_row(user).await? else {
            return Ok(None);
        };

        // The cursor references the row being deleted; repoint it at the
        // newest remaining row (or drop it) before the delete.
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM conversations \
                 WHERE user_address = ?1 AND id != ?2 ORDER BY id DESC LIMIT 1",
                params![user, current.id],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => {
                let prev_id: i64 = row.get(0).map_err(q)?;
                self.conn()
                    .execute(
                        "UPDATE cursors SET conversation_id = ?1, updated_at = ?2 \
                         WHERE user_address = ?3",
                        params![prev_id, Utc::now().to_rfc3339(), user],
                    )
                    .await
                    .map_err(q)?;
            }
            None => {
                self.conn()
                    .execute("DELETE FROM cursors WHERE user_address = ?1", params![user])
                    .await
                    .map_err(q)?;
            }
        }

        self.conn()
            .execute(
                "DELETE FROM conversations WHERE id = ?1",
                params![current.id],
            )
            .await
            .map_err(q)?;
        Ok(Some(current))
    }

    async fn clear_ledger(&self, user: &str) -> Result<(), DatabaseError> {
        // Cursor first: it references a conversation row.
        self.conn()
            .execute("DELETE FROM cursors WHERE user_address = ?1", params![user])
            .await
            .map_err(q)?;
        self.conn()
            .execute(
                "DELETE FROM conversations WHERE user_address = ?1",
                params![user],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn idle_users(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT c.user_address FROM cursors cur \
                 JOIN conversations c ON c.id = cur.conversation_id \
                 WHERE c.created_at < ?1",
                params![cutoff.to_rfc3339()],
            )
            .await
            .map_err(q)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(q)? {
            out.push(row.get::<String>(0).map_err(q)?);
        }
        Ok(out)
    }

    // ── History tracker ─────────────────────────────────────────────

    async fn open_history(&self, user: &str, flow: FlowId) -> Result<HistoryRow, DatabaseError> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM history_conversations \
             WHERE user_address = ?1 AND flow = ?2 AND status = 'in_progress' \
             ORDER BY created_at DESC LIMIT 1"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![user, flow.as_str()])
            .await
            .map_err(q)?;
        if let Some(row) = rows.next().await.map_err(q)? {
            return row_to_history(&row);
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO history_conversations \
                 (id, user_address, flow, status, reason, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, 'in_progress', NULL, ?4, ?4)",
                params![id.to_string(), user, flow.as_str(), now.to_rfc3339()],
            )
            .await
            .map_err(q)?;
        Ok(HistoryRow {
            id,
            user_address: user.to_string(),
            flow,
            status: HistoryStatus::InProgress,
            reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn close_history(
        &self,
        user: &str,
        flow: FlowId,
        status: HistoryStatus,
        reason: HistoryReason,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE history_conversations SET status = ?1, reason = ?2, updated_at = ?3 \
                 WHERE user_address = ?4 AND flow = ?5 AND status = 'in_progress'",
                params![
                    status.as_str(),
                    reason.as_str(),
                    Utc::now().to_rfc3339(),
                    user,
                    flow.as_str()
                ],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn history_rows(&self, user: &str) -> Result<Vec<HistoryRow>, DatabaseError> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM history_conversations \
             WHERE user_address = ?1 ORDER BY created_at DESC"
        );
        let mut rows = self.conn().query(&sql, params![user]).await.map_err(q)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(q)? {
            out.push(row_to_history(&row)?);
        }
        Ok(out)
    }

    // ── Document files ──────────────────────────────────────────────

    async fn insert_document(&self, doc: &DocumentFile) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO document_files \
                 (id, owner_address, driver_id, media_id, media_url, kind, side, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    doc.id.to_string(),
                    doc.owner_address.as_str(),
                    doc.driver_id.map(|id| id.to_string()),
                    doc.media_id.as_str(),
                    doc.media_url.as_str(),
                    doc.kind.as_str(),
                    doc.side.as_str(),
                    doc.created_at.to_rfc3339()
                ],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn documents_for_owner(&self, user: &str) -> Result<Vec<DocumentFile>, DatabaseError> {
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM document_files \
             WHERE owner_address = ?1 ORDER BY created_at ASC"
        );
        let mut rows = self.conn().query(&sql, params![user]).await.map_err(q)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(q)? {
            out.push(row_to_document(&row)?);
        }
        Ok(out)
    }

    async fn assign_documents_to_driver(
        &self,
        user: &str,
        driver_id: Uuid,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE document_files SET driver_id = ?1 WHERE owner_address = ?2",
                params![driver_id.to_string(), user],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn delete_documents_for_owner(&self, user: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM document_files WHERE owner_address = ?1 AND driver_id IS NULL",
                params![user],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    // ── Drivers / licenses ──────────────────────────────────────────

    async fn insert_driver(&self, driver: &Driver) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO drivers \
                 (id, phone, first_name, last_name, birth_date, remote_profile_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    driver.id.to_string(),
                    driver.phone.as_str(),
                    driver.first_name.as_str(),
                    driver.last_name.as_str(),
                    date_to_str(&driver.birth_date),
                    driver.remote_profile_id.as_deref(),
                    driver.created_at.to_rfc3339()
                ],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn find_driver_by_phone(&self, phone: &str) -> Result<Option<Driver>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, phone, first_name, last_name, birth_date, remote_profile_id, \
                 created_at FROM drivers WHERE phone = ?1",
                params![phone],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => Ok(Some(row_to_driver(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_driver_remote_id(
        &self,
        driver_id: Uuid,
        remote_profile_id: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE drivers SET remote_profile_id = ?1 WHERE id = ?2",
                params![remote_profile_id, driver_id.to_string()],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn update_driver_phone(
        &self,
        driver_id: Uuid,
        phone: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE drivers SET phone = ?1 WHERE id = ?2",
                params![phone, driver_id.to_string()],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn delete_driver(&self, driver_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM drivers WHERE id = ?1",
                params![driver_id.to_string()],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn insert_license(&self, license: &DriverLicense) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO driver_licenses \
                 (id, driver_id, license_number, issue_date, expiry_date) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    license.id.to_string(),
                    license.driver_id.to_string(),
                    license.license_number.as_str(),
                    date_to_str(&license.issue_date),
                    date_to_str(&license.expiry_date)
                ],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn find_license_for_driver(
        &self,
        driver_id: Uuid,
    ) -> Result<Option<DriverLicense>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, driver_id, license_number, issue_date, expiry_date \
                 FROM driver_licenses WHERE driver_id = ?1 LIMIT 1",
                params![driver_id.to_string()],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => {
                let id: String = row.get(0).map_err(q)?;
                let drv: String = row.get(1).map_err(q)?;
                Ok(Some(DriverLicense {
                    id: parse_uuid(&id)?,
                    driver_id: parse_uuid(&drv)?,
                    license_number: row.get(2).map_err(q)?,
                    issue_date: parse_date(&row.get(3).ok()),
                    expiry_date: parse_date(&row.get(4).ok()),
                }))
            }
            None => Ok(None),
        }
    }

    async fn delete_licenses_for_driver(&self, driver_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM driver_licenses WHERE driver_id = ?1",
                params![driver_id.to_string()],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    // ── Cars / associations ─────────────────────────────────────────

    async fn insert_car(&self, car: &Car) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO cars \
                 (id, plate, make, color, first_registration, remote_vehicle_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    car.id.to_string(),
                    car.plate.as_str(),
                    car.make.as_str(),
                    car.color.as_str(),
                    date_to_str(&car.first_registration),
                    car.remote_vehicle_id.as_deref(),
                    car.created_at.to_rfc3339()
                ],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn find_car(&self, car_id: Uuid) -> Result<Option<Car>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, plate, make, color, first_registration, remote_vehicle_id, \
                 created_at FROM cars WHERE id = ?1",
                params![car_id.to_string()],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => Ok(Some(row_to_car(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_car_remote_id(
        &self,
        car_id: Uuid,
        remote_vehicle_id: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE cars SET remote_vehicle_id = ?1 WHERE id = ?2",
                params![remote_vehicle_id, car_id.to_string()],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn delete_car(&self, car_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM cars WHERE id = ?1",
                params![car_id.to_string()],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn insert_association(&self, assoc: &CarAssociation) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO driver_car_associations \
                 (id, driver_id, car_id, start_date, end_date) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    assoc.id.to_string(),
                    assoc.driver_id.to_string(),
                    assoc.car_id.to_string(),
                    assoc.start_date.to_rfc3339(),
                    assoc.end_date.map(|d| d.to_rfc3339())
                ],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn active_association(
        &self,
        driver_id: Uuid,
    ) -> Result<Option<CarAssociation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, driver_id, car_id, start_date, end_date \
                 FROM driver_car_associations \
                 WHERE driver_id = ?1 AND end_date IS NULL \
                 ORDER BY start_date DESC LIMIT 1",
                params![driver_id.to_string()],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => Ok(Some(row_to_association(&row)?)),
            None => Ok(None),
        }
    }

    async fn associations_for_driver(
        &self,
        driver_id: Uuid,
    ) -> Result<Vec<CarAssociation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, driver_id, car_id, start_date, end_date \
                 FROM driver_car_associations \
                 WHERE driver_id = ?1 ORDER BY start_date DESC",
                params![driver_id.to_string()],
            )
            .await
            .map_err(q)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(q)? {
            out.push(row_to_association(&row)?);
        }
        Ok(out)
    }

    async fn last_ended_association(
        &self,
        driver_id: Uuid,
    ) -> Result<Option<CarAssociation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, driver_id, car_id, start_date, end_date \
                 FROM driver_car_associations \
                 WHERE driver_id = ?1 AND end_date IS NOT NULL \
                 ORDER BY end_date DESC LIMIT 1",
                params![driver_id.to_string()],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => Ok(Some(row_to_association(&row)?)),
            None => Ok(None),
        }
    }

    async fn end_association(
        &self,
        assoc_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE driver_car_associations SET end_date = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), assoc_id.to_string()],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn reopen_association(&self, assoc_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE driver_car_associations SET end_date = NULL WHERE id = ?1",
                params![assoc_id.to_string()],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn delete_association(&self, assoc_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM driver_car_associations WHERE id = ?1",
                params![assoc_id.to_string()],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    // ── OTP ─────────────────────────────────────────────────────────

    async fn insert_otp(&self, otp: &OtpRow) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO otp_verifications (id, phone, code, expires_at, used, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    otp.id.to_string(),
                    otp.phone.as_str(),
                    otp.code.as_str(),
                    otp.expires_at.to_rfc3339(),
                    otp.used as i64,
                    otp.created_at.to_rfc3339()
                ],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn latest_otp(&self, phone: &str) -> Result<Option<OtpRow>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, phone, code, expires_at, used, created_at \
                 FROM otp_verifications WHERE phone = ?1 \
                 ORDER BY created_at DESC LIMIT 1",
                params![phone],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => Ok(Some(row_to_otp(&row)?)),
            None => Ok(None),
        }
    }

    async fn mark_otp_used(&self, otp_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE otp_verifications SET used = 1 WHERE id = ?1",
                params![otp_id.to_string()],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn delete_otps_for_phone(&self, phone: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM otp_verifications WHERE phone = ?1",
                params![phone],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    // ── Inbox ───────────────────────────────────────────────────────

    async fn enqueue_inbox(
        &self,
        message_id: &str,
        payload: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let payload_str = serde_json::to_string(payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO inbox (message_id, payload, received_at) \
                 VALUES (?1, ?2, ?3)",
                params![message_id, payload_str, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(q)?;
        Ok(inserted > 0)
    }

    async fn next_inbox_entry(&self) -> Result<Option<InboxEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, message_id, payload, received_at FROM inbox \
                 ORDER BY id ASC LIMIT 1",
                (),
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => {
                let payload_str: String = row.get(2).map_err(q)?;
                Ok(Some(InboxEntry {
                    id: row.get(0).map_err(q)?,
                    message_id: row.get(1).map_err(q)?,
                    payload: serde_json::from_str(&payload_str)
                        .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
                    received_at: parse_datetime(&row.get::<String>(3).map_err(q)?),
                }))
            }
            None => Ok(None),
        }
    }

    async fn delete_inbox_entry(&self, entry_id: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute("DELETE FROM inbox WHERE id = ?1", params![entry_id])
            .await
            .map_err(q)?;
        Ok(())
    }
}
