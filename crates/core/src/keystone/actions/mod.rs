//! Actions the engine runs for an update pass.
//!
//! A run enqueues three stages on the engine's processor, bonded in order:
//! check, prefetch and silent update. The silent stage may enqueue a fourth,
//! prompted stage for the updates it leaves behind.

mod check;
mod download;
mod install;
mod prefetch;
mod update;

pub use check::{CheckPolicy, UpdateCheckAction, CHECK_ACTION_NAME};
pub use download::{download_payload, payload_path, sha256_hex, DownloadAction, Downloaded};
pub use install::{
    installer_environment, run_installer, InstallAction, INSTALLER_SHELL, INSTALL_PHASES,
    RETURN_CODE_NOT_RUN,
};
pub use prefetch::{PrefetchPolicy, PREFETCH_ACTION_NAME};
pub use update::{
    return_code_from, UpdateAction, UpdateMode, UpdatePolicy, PROMPT_UPDATE_ACTION_NAME,
    SILENT_UPDATE_ACTION_NAME,
};
