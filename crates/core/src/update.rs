//! Description of an available update, as reported by an update server.

use serde::{Deserialize, Serialize};

/// Placeholder in `more_info_url` replaced with a locale code.
pub const LOCALE_PLACEHOLDER: &str = "${hl}";

/// One available update for one product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    /// Product the update applies to.
    pub product_id: String,
    /// Where the installer payload is downloaded from.
    pub codebase_url: String,
    /// Payload size in bytes. Zero means unknown.
    #[serde(default)]
    pub code_size: u64,
    /// Lower-case hex SHA-256 of the payload. Empty means unverified.
    #[serde(default)]
    pub code_hash: String,
    /// Release notes page, possibly containing [`LOCALE_PLACEHOLDER`].
    #[serde(default)]
    pub more_info_url: Option<String>,
    /// The update must be confirmed by the user.
    #[serde(default)]
    pub prompt_user: bool,
    /// The product needs a reboot after installing.
    #[serde(default)]
    pub require_reboot: bool,
    #[serde(default)]
    pub localization_bundle: Option<String>,
    #[serde(default)]
    pub display_version: Option<String>,
}

impl UpdateInfo {
    pub fn new(product_id: impl Into<String>, codebase_url: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            codebase_url: codebase_url.into(),
            code_size: 0,
            code_hash: String::new(),
            more_info_url: None,
            prompt_user: false,
            require_reboot: false,
            localization_bundle: None,
            display_version: None,
        }
    }

    /// The release notes URL with the locale placeholder filled in.
    pub fn more_info_url_for_locale(&self, locale: &str) -> Option<String> {
        self.more_info_url
            .as_ref()
            .map(|url| url.replace(LOCALE_PLACEHOLDER, locale))
    }

    /// Whether this update is for `product_id`, ignoring case.
    pub fn is_for_product(&self, product_id: &str) -> bool {
        self.product_id.eq_ignore_ascii_case(product_id)
    }

    /// Version shown to users, falling back to the product id.
    pub fn display_name(&self) -> String {
        match &self.display_version {
            Some(version) => format!("{} {}", self.product_id, version),
            None => self.product_id.clone(),
        }
    }
}
