//! Reservation document store
//!
//! Reservations are kept as JSON documents. The SQLite backend stores the
//! document next to a few projection columns used for lookups, filtering and
//! ordering; every overwrite is a compare-and-swap on the document version.

use crate::error::ReservationError;
use crate::reservation::{ConfirmationStatus, Reservation, ReservationStatus};
use chrono::{NaiveDate, SecondsFormat};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Upper bound for a single page of results.
pub const MAX_PAGE_SIZE: u64 = 100;

/// Abstraction over reservation storage backends.
pub trait ReservationStore: Send + Sync {
    fn insert(&self, reservation: &Reservation) -> Result<(), ReservationError>;
    fn get(&self, reservation_id: &str) -> Result<Option<Reservation>, ReservationError>;
    fn get_by_token(&self, token: &str) -> Result<Option<Reservation>, ReservationError>;
    fn list(&self, filter: &ListFilter) -> Result<Vec<Reservation>, ReservationError>;
    /// Overwrite the stored document only if it is still at `expected_version`.
    fn replace(&self, expected_version: u64, reservation: &Reservation)
        -> Result<(), ReservationError>;
    fn delete(&self, reservation_id: &str) -> Result<bool, ReservationError>;
}

/// Listing filter; all criteria are optional and combined with AND.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub confirmation_status: Option<ConfirmationStatus>,
    pub status: Option<ReservationStatus>,
    pub date: Option<NaiveDate>,
    pub page: u64,
    pub limit: Option<u64>,
}

impl ListFilter {
    pub fn pending() -> Self {
        ListFilter {
            confirmation_status: Some(ConfirmationStatus::Pending),
            ..Default::default()
        }
    }

    fn matches(&self, r: &Reservation) -> bool {
        self.confirmation_status
            .map_or(true, |s| r.confirmation_status == s)
            && self.status.map_or(true, |s| r.status == s)
            && self.date.map_or(true, |d| r.date == d)
    }

    /// `(offset, limit)` with the limit capped at [`MAX_PAGE_SIZE`]. The
    /// offset saturates at `i64::MAX`, the largest one SQLite accepts, so a
    /// page past the end is empty on every backend.
    fn window(&self) -> Option<(i64, i64)> {
        self.limit.map(|limit| {
            let limit = limit.clamp(1, MAX_PAGE_SIZE);
            let offset = i64::try_from(self.page.saturating_mul(limit)).unwrap_or(i64::MAX);
            (offset, limit as i64)
        })
    }
}

fn lock_poisoned() -> ReservationError {
    ReservationError::Database("Mutex poisoned".to_string())
}

fn sortable_timestamp(r: &Reservation) -> String {
    r.created_at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, ReservationError> {
        let conn = Connection::open(path)
            .map_err(|e| ReservationError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS reservations (
                reservation_id TEXT PRIMARY KEY,
                confirmation_token TEXT NOT NULL UNIQUE,
                confirmation_status TEXT NOT NULL,
                status TEXT NOT NULL,
                date TEXT NOT NULL,
                created_at TEXT NOT NULL,
                version INTEGER NOT NULL,
                document TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reservations_created_at
                ON reservations (created_at);
            CREATE INDEX IF NOT EXISTS idx_reservations_confirmation_status
                ON reservations (confirmation_status);",
        )
        .map_err(|e| {
            ReservationError::Database(format!("Failed to create reservations table: {}", e))
        })?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    /// In-process database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, ReservationError> {
        Self::open(":memory:")
    }

    fn row_to_reservation(document: String, token: String) -> Result<Reservation, ReservationError> {
        let mut reservation: Reservation = serde_json::from_str(&document)?;
        reservation.confirmation_token = token;
        Ok(reservation)
    }

    fn query_one(
        &self,
        sql: &str,
        key: &str,
    ) -> Result<Option<Reservation>, ReservationError> {
        let conn = self.conn.lock().map_err(|_| lock_poisoned())?;
        let row: Option<(String, String)> = conn
            .query_row(sql, params![key], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()
            .map_err(|e| ReservationError::Database(format!("Failed to load reservation: {}", e)))?;
        row.map(|(document, token)| Self::row_to_reservation(document, token))
            .transpose()
    }
}

impl ReservationStore for Database {
    fn insert(&self, reservation: &Reservation) -> Result<(), ReservationError> {
        let document = serde_json::to_string(reservation)?;
        let conn = self.conn.lock().map_err(|_| lock_poisoned())?;
        conn.execute(
            "INSERT INTO reservations
                (reservation_id, confirmation_token, confirmation_status, status, date, created_at, version, document)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                reservation.reservation_id,
                reservation.confirmation_token,
                reservation.confirmation_status.as_str(),
                reservation.status.as_str(),
                reservation.date.to_string(),
                sortable_timestamp(reservation),
                reservation.version as i64,
                document,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ReservationError::Conflict(format!(
                    "Reservation {} already exists",
                    reservation.reservation_id
                ))
            }
            other => ReservationError::Database(format!("Failed to save reservation: {}", other)),
        })?;
        Ok(())
    }

    fn get(&self, reservation_id: &str) -> Result<Option<Reservation>, ReservationError> {
        self.query_one(
            "SELECT document, confirmation_token FROM reservations WHERE reservation_id = ?1",
            reservation_id,
        )
    }

    fn get_by_token(&self, token: &str) -> Result<Option<Reservation>, ReservationError> {
        self.query_one(
            "SELECT document, confirmation_token FROM reservations WHERE confirmation_token = ?1",
            token,
        )
    }

    fn list(&self, filter: &ListFilter) -> Result<Vec<Reservation>, ReservationError> {
        let mut sql =
            String::from("SELECT document, confirmation_token FROM reservations WHERE 1 = 1");
        let mut values: Vec<Value> = Vec::new();

        if let Some(status) = filter.confirmation_status {
            sql.push_str(" AND confirmation_status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(date) = filter.date {
            sql.push_str(" AND date = ?");
            values.push(Value::Text(date.to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC, reservation_id DESC");
        if let Some((offset, limit)) = filter.window() {
            sql.push_str(" LIMIT ? OFFSET ?");
            values.push(Value::Integer(limit));
            values.push(Value::Integer(offset));
        }

        let conn = self.conn.lock().map_err(|_| lock_poisoned())?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| ReservationError::Database(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| ReservationError::Database(format!("Failed to list reservations: {}", e)))?;

        let mut reservations = Vec::new();
        for row in rows {
            let (document, token) = row
                .map_err(|e| ReservationError::Database(format!("Failed to read row: {}", e)))?;
            reservations.push(Self::row_to_reservation(document, token)?);
        }
        Ok(reservations)
    }

    fn replace(
        &self,
        expected_version: u64,
        reservation: &Reservation,
    ) -> Result<(), ReservationError> {
        let document = serde_json::to_string(reservation)?;
        let conn = self.conn.lock().map_err(|_| lock_poisoned())?;
        let updated = conn
            .execute(
                "UPDATE reservations
                 SET confirmation_status = ?1, status = ?2, date = ?3, version = ?4, document = ?5
                 WHERE reservation_id = ?6 AND version = ?7",
                params![
                    reservation.confirmation_status.as_str(),
                    reservation.status.as_str(),
                    reservation.date.to_string(),
                    reservation.version as i64,
                    document,
                    reservation.reservation_id,
                    expected_version as i64,
                ],
            )
            .map_err(|e| ReservationError::Database(format!("Failed to update reservation: {}", e)))?;

        if updated == 0 {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM reservations WHERE reservation_id = ?1)",
                    params![reservation.reservation_id],
                    |row| row.get(0),
                )
                .map_err(|e| ReservationError::Database(e.to_string()))?;
            return Err(if exists {
                ReservationError::Conflict(format!(
                    "Reservation {} was modified concurrently",
                    reservation.reservation_id
                ))
            } else {
                ReservationError::NotFound(reservation.reservation_id.clone())
            });
        }
        Ok(())
    }

    fn delete(&self, reservation_id: &str) -> Result<bool, ReservationError> {
        let conn = self.conn.lock().map_err(|_| lock_poisoned())?;
        let deleted = conn
            .execute(
                "DELETE FROM reservations WHERE reservation_id = ?1",
                params![reservation_id],
            )
            .map_err(|e| ReservationError::Database(format!("Failed to delete reservation: {}", e)))?;
        Ok(deleted > 0)
    }
}

/// Simple in-memory store useful for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    reservations: Arc<Mutex<HashMap<String, Reservation>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReservationStore for InMemoryStore {
    fn insert(&self, reservation: &Reservation) -> Result<(), ReservationError> {
        let mut map = self.reservations.lock().map_err(|_| lock_poisoned())?;
        let token_taken = map
            .values()
            .any(|r| r.confirmation_token == reservation.confirmation_token);
        if map.contains_key(&reservation.reservation_id) || token_taken {
            return Err(ReservationError::Conflict(format!(
                "Reservation {} already exists",
                reservation.reservation_id
            )));
        }
        map.insert(reservation.reservation_id.clone(), reservation.clone());
        Ok(())
    }

    fn get(&self, reservation_id: &str) -> Result<Option<Reservation>, ReservationError> {
        let map = self.reservations.lock().map_err(|_| lock_poisoned())?;
        Ok(map.get(reservation_id).cloned())
    }

    fn get_by_token(&self, token: &str) -> Result<Option<Reservation>, ReservationError> {
        let map = self.reservations.lock().map_err(|_| lock_poisoned())?;
        Ok(map
            .values()
            .find(|r| r.confirmation_token == token)
            .cloned())
    }

    fn list(&self, filter: &ListFilter) -> Result<Vec<Reservation>, ReservationError> {
        let map = self.reservations.lock().map_err(|_| lock_poisoned())?;
        let mut items: Vec<Reservation> = map.values().filter(|r| filter.matches(r)).cloned().collect();
        items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.reservation_id.cmp(&a.reservation_id))
        });
        Ok(match filter.window() {
            Some((offset, limit)) => items
                .into_iter()
                .skip(usize::try_from(offset).unwrap_or(usize::MAX))
                .take(limit as usize)
                .collect(),
            None => items,
        })
    }

    fn replace(
        &self,
        expected_version: u64,
        reservation: &Reservation,
    ) -> Result<(), ReservationError> {
        let mut map = self.reservations.lock().map_err(|_| lock_poisoned())?;
        let current = map
            .get_mut(&reservation.reservation_id)
            .ok_or_else(|| ReservationError::NotFound(reservation.reservation_id.clone()))?;
        if current.version != expected_version {
            return Err(ReservationError::Conflict(format!(
                "Reservation {} was modified concurrently",
                reservation.reservation_id
            )));
        }
        *current = reservation.clone();
        Ok(())
    }

    fn delete(&self, reservation_id: &str) -> Result<bool, ReservationError> {
        let mut map = self.reservations.lock().map_err(|_| lock_poisoned())?;
        Ok(map.remove(reservation_id).is_some())
    }
}
