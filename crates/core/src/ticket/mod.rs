//! Tickets: persistent records of installed products to keep up to date.

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqliteTicketStore;
pub use store::{
    default_ticket_store_path, set_default_ticket_store_path, tickets_by_server_url, TicketError,
    TicketStore, TICKET_STORE_FILE_NAME,
};
pub use types::{ExistenceChecker, Ticket};
