//! Ticket and existence checker types.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use super::TicketError;

/// Strategy for deciding whether a product is still installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExistenceChecker {
    /// Installed if the path exists.
    Path { path: PathBuf },
    /// Installed if a desktop entry with this id is registered in one of the
    /// XDG application directories.
    DesktopEntry { app_id: String },
    /// Installed if the file search index finds a match for the query.
    SearchIndex { query: String },
    /// Never installed.
    Never,
}

impl ExistenceChecker {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        ExistenceChecker::Path { path: path.into() }
    }

    /// Whether the product appears to be installed.
    ///
    /// `SearchIndex` spawns a short-lived `locate` process.
    pub async fn exists(&self) -> bool {
        match self {
            ExistenceChecker::Path { path } => tokio::fs::try_exists(path).await.unwrap_or(false),
            ExistenceChecker::DesktopEntry { app_id } => desktop_entry_exists(app_id).await,
            ExistenceChecker::SearchIndex { query } => search_index_has_match(query).await,
            ExistenceChecker::Never => false,
        }
    }

    /// Short description for logs and listings.
    pub fn describe(&self) -> String {
        match self {
            ExistenceChecker::Path { path } => format!("path:{}", path.display()),
            ExistenceChecker::DesktopEntry { app_id } => format!("desktop:{}", app_id),
            ExistenceChecker::SearchIndex { query } => format!("locate:{}", query),
            ExistenceChecker::Never => "never".to_string(),
        }
    }
}

fn xdg_data_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    match std::env::var_os("XDG_DATA_HOME") {
        Some(data_home) if !data_home.is_empty() => dirs.push(PathBuf::from(data_home)),
        _ => {
            if let Some(home) = home::home_dir() {
                dirs.push(home.join(".local/share"));
            }
        }
    }
    match std::env::var("XDG_DATA_DIRS") {
        Ok(value) if !value.is_empty() => {
            dirs.extend(value.split(':').filter(|d| !d.is_empty()).map(PathBuf::from))
        }
        _ => {
            dirs.push(PathBuf::from("/usr/local/share"));
            dirs.push(PathBuf::from("/usr/share"));
        }
    }
    dirs
}

async fn desktop_entry_exists(app_id: &str) -> bool {
    let file_name = if app_id.ends_with(".desktop") {
        app_id.to_string()
    } else {
        format!("{}.desktop", app_id)
    };
    for dir in xdg_data_dirs() {
        let entry = dir.join("applications").join(&file_name);
        if let Ok(metadata) = tokio::fs::metadata(&entry).await {
            if metadata.is_file() {
                return true;
            }
        }
    }
    false
}

async fn search_index_has_match(query: &str) -> bool {
    let result = Command::new("locate")
        .args(["-l", "1", "-e", "--", query])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;
    match result {
        Ok(output) => {
            output.status.success() && output.stdout.iter().any(|b| !b.is_ascii_whitespace())
        },
        Err(e) => {
            debug!(query, error = %e, "Search index lookup failed");
            false
        }
    }
}

/// Record that a product is installed and should be kept up to date.
///
/// Immutable once created. The product id is compared case-insensitively by
/// the store but keeps its original casing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ticket {
    product_id: String,
    version: String,
    existence_checker: ExistenceChecker,
    server_url: String,
    creation_date: DateTime<Utc>,
}

impl Ticket {
    /// Create a ticket stamped with the current time.
    pub fn new(
        product_id: impl Into<String>,
        version: impl Into<String>,
        existence_checker: ExistenceChecker,
        server_url: impl Into<String>,
    ) -> Result<Self, TicketError> {
        Self::with_creation_date(product_id, version, existence_checker, server_url, Utc::now())
    }

    /// Create a ticket with an explicit creation date, as when restoring a
    /// persisted ticket.
    pub fn with_creation_date(
        product_id: impl Into<String>,
        version: impl Into<String>,
        existence_checker: ExistenceChecker,
        server_url: impl Into<String>,
        creation_date: DateTime<Utc>,
    ) -> Result<Self, TicketError> {
        let product_id = product_id.into();
        let version = version.into();
        let server_url = server_url.into();

        if product_id.trim().is_empty() {
            return Err(TicketError::MissingField("product_id"));
        }
        if version.trim().is_empty() {
            return Err(TicketError::MissingField("version"));
        }
        if server_url.trim().is_empty() {
            return Err(TicketError::MissingField("server_url"));
        }
        if let ExistenceChecker::Path { path } = &existence_checker {
            if path.as_os_str().is_empty() {
                return Err(TicketError::MissingField("existence_checker"));
            }
        }
        if let Err(e) = reqwest::Url::parse(&server_url) {
            return Err(TicketError::InvalidField {
                field: "server_url",
                reason: e.to_string(),
            });
        }

        Ok(Self {
            product_id,
            version,
            existence_checker,
            server_url,
            creation_date,
        })
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn existence_checker(&self) -> &ExistenceChecker {
        &self.existence_checker
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }

    /// Store key for this ticket.
    pub fn key(&self) -> String {
        self.product_id.to_lowercase()
    }

    /// Whether the ticketed product is still installed.
    pub async fn is_installed(&self) -> bool {
        self.existence_checker.exists().await
    }

    /// The path checked by a `Path` existence checker.
    pub fn installed_path(&self) -> Option<&Path> {
        match &self.existence_checker {
            ExistenceChecker::Path { path } => Some(path),
            _ => None,
        }
    }
}
