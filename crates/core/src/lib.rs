pub mod action;
pub mod command;
pub mod config;
pub mod fetch;
pub mod keystone;
pub mod server;
pub mod stats;
pub mod testing;
pub mod ticket;
pub mod update;

pub use command::{CommandError, CommandOutput, CommandRunner, TaskCommandRunner};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError,
};
pub use fetch::{FetchError, FetchRequest, FetchResponse, Fetcher, FetcherFactory, HttpFetcherFactory};
pub use keystone::{
    BrokerError, Keystone, KeystoneBroker, KeystoneConfig, KeystoneDelegate, KeystoneError,
    KeystoneParams, KeystoneStatus,
};
pub use server::{JsonServerFactory, ServerError, ServerFactory, UpdateServer};
pub use stats::{KeystoneStats, StatsSnapshot};
pub use ticket::{ExistenceChecker, SqliteTicketStore, Ticket, TicketError, TicketStore};
pub use update::UpdateInfo;
