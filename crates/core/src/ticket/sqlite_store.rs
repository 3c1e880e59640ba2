//! SQLite-backed ticket store implementation.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{ExistenceChecker, Ticket, TicketError, TicketStore};

const SELECT_COLUMNS: &str =
    "SELECT product_id, version, existence_checker, server_url, creation_date FROM tickets";

/// SQLite-backed ticket store.
pub struct SqliteTicketStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

/// Columns of one row, before validation.
struct StoredTicket {
    product_id: String,
    version: String,
    existence_checker: String,
    server_url: String,
    creation_date: String,
}

impl StoredTicket {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            product_id: row.get(0)?,
            version: row.get(1)?,
            existence_checker: row.get(2)?,
            server_url: row.get(3)?,
            creation_date: row.get(4)?,
        })
    }

    fn into_ticket(self) -> Result<Ticket, String> {
        let existence_checker: ExistenceChecker = serde_json::from_str(&self.existence_checker)
            .map_err(|e| format!("bad existence checker for {}: {}", self.product_id, e))?;
        let creation_date = DateTime::parse_from_rfc3339(&self.creation_date)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| format!("bad creation date for {}: {}", self.product_id, e))?;
        Ticket::with_creation_date(
            self.product_id,
            self.version,
            existence_checker,
            self.server_url,
            creation_date,
        )
        .map_err(|e| e.to_string())
    }
}

impl SqliteTicketStore {
    /// Open the store at `path`, creating the file and tables if needed.
    ///
    /// Fails with [`TicketError::Corrupt`] if the file exists but does not hold
    /// a readable ticket store.
    pub fn new(path: &Path) -> Result<Self, TicketError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                TicketError::Io(format!("creating {}: {}", parent.display(), e))
            })?;
        }

        let corrupt = |reason: String| TicketError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let conn = Connection::open(path).map_err(|e| corrupt(e.to_string()))?;
        Self::initialize_schema(&conn).map_err(|e| corrupt(e.to_string()))?;

        let store = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        let tickets = store.load_all().map_err(|e| match e {
            TicketError::Database(reason) => corrupt(reason),
            other => other,
        })?;
        debug!(path = %path.display(), tickets = tickets.len(), "Opened ticket store");
        Ok(store)
    }

    /// Create an in-memory SQLite ticket store (useful for testing).
    pub fn in_memory() -> Result<Self, TicketError> {
        let conn =
            Connection::open_in_memory().map_err(|e| TicketError::Database(e.to_string()))?;
        Self::initialize_schema(&conn).map_err(|e| TicketError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tickets (
                product_key TEXT PRIMARY KEY,
                product_id TEXT NOT NULL,
                version TEXT NOT NULL,
                existence_checker TEXT NOT NULL,
                server_url TEXT NOT NULL,
                creation_date TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tickets_server_url ON tickets(server_url);
            "#,
        )
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load_all(&self) -> Result<Vec<Ticket>, TicketError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!("{} ORDER BY product_key", SELECT_COLUMNS))
            .map_err(|e| TicketError::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], StoredTicket::from_row)
            .map_err(|e| TicketError::Database(e.to_string()))?;

        let mut tickets = Vec::new();
        for row in rows {
            let stored = row.map_err(|e| TicketError::Database(e.to_string()))?;
            tickets.push(stored.into_ticket().map_err(TicketError::Database)?);
        }
        Ok(tickets)
    }
}

impl TicketStore for SqliteTicketStore {
    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn ticket_count(&self) -> Result<usize, TicketError> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM tickets", [], |row| row.get(0))
            .map_err(|e| TicketError::Database(e.to_string()))?;
        Ok(count as usize)
    }

    fn tickets(&self) -> Result<Vec<Ticket>, TicketError> {
        self.load_all()
    }

    fn ticket_for_product_id(&self, product_id: &str) -> Result<Option<Ticket>, TicketError> {
        let conn = self.lock();
        let stored = conn
            .query_row(
                &format!("{} WHERE product_key = ?", SELECT_COLUMNS),
                params![product_id.to_lowercase()],
                StoredTicket::from_row,
            )
            .optional()
            .map_err(|e| TicketError::Database(e.to_string()))?;

        stored
            .map(|s| s.into_ticket().map_err(TicketError::Database))
            .transpose()
    }

    fn store_ticket(&self, ticket: &Ticket) -> Result<(), TicketError> {
        let checker_json = serde_json::to_string(ticket.existence_checker())
            .map_err(|e| TicketError::Database(e.to_string()))?;

        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO tickets (product_key, product_id, version, existence_checker, server_url, creation_date)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(product_key) DO UPDATE SET
                product_id = excluded.product_id,
                version = excluded.version,
                existence_checker = excluded.existence_checker,
                server_url = excluded.server_url,
                creation_date = excluded.creation_date
            "#,
            params![
                ticket.key(),
                ticket.product_id(),
                ticket.version(),
                checker_json,
                ticket.server_url(),
                ticket
                    .creation_date()
                    .to_rfc3339_opts(SecondsFormat::Nanos, true),
            ],
        )
        .map_err(|e| TicketError::Database(e.to_string()))?;

        debug!(product_id = ticket.product_id(), version = ticket.version(), "Stored ticket");
        Ok(())
    }

    fn delete_ticket_for_product_id(&self, product_id: &str) -> Result<bool, TicketError> {
        let conn = self.lock();
        let deleted = conn
            .execute(
                "DELETE FROM tickets WHERE product_key = ?",
                params![product_id.to_lowercase()],
            )
            .map_err(|e| TicketError::Database(e.to_string()))?;
        Ok(deleted > 0)
    }
}
