//! Ticket storage trait and types.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::ticket::Ticket;

/// File name of the ticket store database.
pub const TICKET_STORE_FILE_NAME: &str = "Keystone.ticketstore";

const SYSTEM_TICKET_STORE_DIR: &str = "/var/lib/keystone/TicketStore";

static DEFAULT_PATH_OVERRIDE: Lazy<RwLock<Option<PathBuf>>> = Lazy::new(|| RwLock::new(None));

/// Error type for ticket operations.
#[derive(Debug)]
pub enum TicketError {
    /// A required ticket field was empty.
    MissingField(&'static str),
    /// A ticket field had an unusable value.
    InvalidField { field: &'static str, reason: String },
    /// The store file exists but is not a ticket store.
    Corrupt { path: PathBuf, reason: String },
    /// Filesystem error around the store file.
    Io(String),
    /// Database error.
    Database(String),
}

impl fmt::Display for TicketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TicketError::MissingField(field) => write!(f, "Ticket is missing {}", field),
            TicketError::InvalidField { field, reason } => {
                write!(f, "Ticket has invalid {}: {}", field, reason)
            }
            TicketError::Corrupt { path, reason } => {
                write!(f, "Ticket store {} is corrupt: {}", path.display(), reason)
            }
            TicketError::Io(msg) => write!(f, "Ticket store I/O error: {}", msg),
            TicketError::Database(msg) => write!(f, "Database error: {}", msg),
        }
    }
}

impl std::error::Error for TicketError {}

/// Persistent set of tickets, keyed by case-insensitive product id.
pub trait TicketStore: Send + Sync {
    /// Location of the backing file, if any.
    fn path(&self) -> Option<&Path>;

    /// Number of stored tickets.
    fn ticket_count(&self) -> Result<usize, TicketError>;

    /// All stored tickets, ordered by product id.
    fn tickets(&self) -> Result<Vec<Ticket>, TicketError>;

    /// Look up the ticket for a product, ignoring case.
    fn ticket_for_product_id(&self, product_id: &str) -> Result<Option<Ticket>, TicketError>;

    /// Store a ticket, replacing any ticket for the same product.
    fn store_ticket(&self, ticket: &Ticket) -> Result<(), TicketError>;

    /// Delete the stored ticket for the same product as `ticket`.
    /// Returns `false` if there was none.
    fn delete_ticket(&self, ticket: &Ticket) -> Result<bool, TicketError> {
        self.delete_ticket_for_product_id(ticket.product_id())
    }

    /// Delete the ticket for a product, ignoring case.
    /// Returns `false` if there was none.
    fn delete_ticket_for_product_id(&self, product_id: &str) -> Result<bool, TicketError>;
}

/// Group tickets by their update server URL.
pub fn tickets_by_server_url(tickets: &[Ticket]) -> BTreeMap<String, Vec<Ticket>> {
    let mut grouped: BTreeMap<String, Vec<Ticket>> = BTreeMap::new();
    for ticket in tickets {
        grouped
            .entry(ticket.server_url().to_string())
            .or_default()
            .push(ticket.clone());
    }
    grouped
}

/// Default location of the ticket store.
///
/// Per-user stores live under the user's data directory, machine-wide stores
/// under `/var/lib`. A path set with [`set_default_ticket_store_path`] takes
/// precedence over both.
pub fn default_ticket_store_path(is_machine: bool) -> PathBuf {
    let override_path = DEFAULT_PATH_OVERRIDE
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    if let Some(path) = override_path {
        return path;
    }

    if is_machine {
        return Path::new(SYSTEM_TICKET_STORE_DIR).join(TICKET_STORE_FILE_NAME);
    }
    match home::home_dir() {
        Some(home) => home
            .join(".local/share/keystone/TicketStore")
            .join(TICKET_STORE_FILE_NAME),
        None => Path::new(SYSTEM_TICKET_STORE_DIR).join(TICKET_STORE_FILE_NAME),
    }
}

/// Override the default ticket store path for this process. `None` restores
/// the built-in defaults.
pub fn set_default_ticket_store_path(path: Option<PathBuf>) {
    *DEFAULT_PATH_OVERRIDE
        .write()
        .unwrap_or_else(|e| e.into_inner()) = path;
}
