//! Update server protocol: turning tickets into requests and responses into
//! [`UpdateInfo`]s.

mod json;

pub use json::{JsonServer, JsonServerFactory, PROTOCOL_VERSION};

use thiserror::Error;

use crate::fetch::{FetchRequest, FetchResponse};
use crate::keystone::KeystoneParams;
use crate::ticket::Ticket;
use crate::update::UpdateInfo;

/// Errors from encoding requests or decoding server responses.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Server returned HTTP {status}")]
    Status { status: u16 },

    #[error("Malformed server response: {0}")]
    Malformed(String),

    #[error("Failed to encode request: {0}")]
    Encode(String),
}

/// One update server and its wire protocol.
pub trait UpdateServer: Send + Sync {
    fn url(&self) -> &str;

    /// Requests needed to ask about every ticket.
    fn requests_for_tickets(&self, tickets: &[Ticket]) -> Result<Vec<FetchRequest>, ServerError>;

    /// Decode the updates advertised in a response.
    fn update_infos_for_response(&self, response: &FetchResponse) -> Result<Vec<UpdateInfo>, ServerError>;

    /// Human readable rendering of a response, for debugging.
    fn pretty_print_response(&self, response: &FetchResponse) -> String;
}

/// Builds an [`UpdateServer`] for a server URL.
pub trait ServerFactory: Send + Sync {
    fn create_server(&self, url: &str, params: &KeystoneParams) -> Box<dyn UpdateServer>;
}
