//! Payload download with size and hash verification.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::action::{Action, ActionPipes, ActionTask, Completion, PipeContents};
use crate::fetch::{fetch_with, FetchRequest, FetcherFactory};
use crate::keystone::context::KeystoneContext;
use crate::keystone::types::ActionError;
use crate::update::UpdateInfo;

/// Lower-case hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Where the payload for `update` is stored inside `dir`.
pub fn payload_path(dir: &Path, update: &UpdateInfo) -> PathBuf {
    let product: String = update
        .product_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let tag: String = if update.code_hash.is_empty() {
        "unverified".to_string()
    } else {
        update.code_hash.chars().take(16).collect()
    };
    dir.join(format!("{}-{}.payload", product, tag))
}

fn verify(update: &UpdateInfo, body: &[u8]) -> Result<(), ActionError> {
    let actual_size = body.len() as u64;
    if update.code_size > 0 && actual_size != update.code_size {
        return Err(ActionError::SizeMismatch {
            expected: update.code_size,
            actual: actual_size,
        });
    }
    if !update.code_hash.is_empty() {
        let actual = sha256_hex(body);
        if !actual.eq_ignore_ascii_case(&update.code_hash) {
            return Err(ActionError::HashMismatch {
                expected: update.code_hash.clone(),
                actual,
            });
        }
    }
    Ok(())
}

async fn is_cached(path: &Path, update: &UpdateInfo) -> bool {
    if update.code_hash.is_empty() {
        return false;
    }
    match tokio::fs::read(path).await {
        Ok(bytes) => verify(update, &bytes).is_ok(),
        Err(_) => false,
    }
}

/// Temporary download file, removed on drop unless moved into place.
struct PartialFile {
    path: PathBuf,
    persisted: bool,
}

impl PartialFile {
    fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(format!(".{}.part", Uuid::new_v4())),
            persisted: false,
        }
    }

    async fn persist(mut self, destination: &Path) -> std::io::Result<()> {
        tokio::fs::rename(&self.path, destination).await?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.persisted {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Outcome of [`download_payload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Downloaded {
    Fetched(PathBuf),
    Cached(PathBuf),
}

impl Downloaded {
    pub fn path(&self) -> &Path {
        match self {
            Downloaded::Fetched(path) | Downloaded::Cached(path) => path,
        }
    }
}

/// Fetch the payload for `update` into `dir`, reusing a verified copy if one
/// is already there.
pub async fn download_payload(
    update: &UpdateInfo,
    fetchers: &dyn FetcherFactory,
    dir: &Path,
) -> Result<Downloaded, ActionError> {
    let destination = payload_path(dir, update);
    if is_cached(&destination, update).await {
        debug!(product_id = %update.product_id, path = %destination.display(), "Using cached payload");
        return Ok(Downloaded::Cached(destination));
    }

    let response = fetch_with(fetchers, FetchRequest::get(&update.codebase_url)).await?;
    if !response.is_success() {
        return Err(ActionError::DownloadStatus(response.status));
    }
    verify(update, &response.body)?;

    tokio::fs::create_dir_all(dir).await?;
    let partial = PartialFile::new(dir);
    tokio::fs::write(&partial.path, &response.body).await?;
    partial.persist(&destination).await?;

    Ok(Downloaded::Fetched(destination))
}

/// Downloads one update payload. Outputs `Path` on success.
pub struct DownloadAction {
    name: String,
    pipes: ActionPipes,
    update: UpdateInfo,
    fetchers: Arc<dyn FetcherFactory>,
    dir: PathBuf,
    ctx: KeystoneContext,
    task: ActionTask,
}

impl DownloadAction {
    pub fn new(
        update: UpdateInfo,
        fetchers: Arc<dyn FetcherFactory>,
        dir: PathBuf,
        ctx: KeystoneContext,
    ) -> Self {
        Self {
            name: format!("download:{}", update.product_id),
            pipes: ActionPipes::default(),
            update,
            fetchers,
            dir,
            ctx,
            task: ActionTask::new(),
        }
    }
}

impl Action for DownloadAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn pipes(&self) -> &ActionPipes {
        &self.pipes
    }

    fn pipes_mut(&mut self) -> &mut ActionPipes {
        &mut self.pipes
    }

    fn perform(&mut self, completion: Completion) {
        let update = self.update.clone();
        let fetchers = Arc::clone(&self.fetchers);
        let dir = self.dir.clone();
        let output = self.pipes.output.clone();
        let stats = self.ctx.stats();

        self.task.spawn(completion, self.ctx.span(), async move {
            match download_payload(&update, fetchers.as_ref(), &dir).await {
                Ok(downloaded) => {
                    if let Some(stats) = &stats {
                        match downloaded {
                            Downloaded::Cached(_) => stats.inc_download_cache_hits(),
                            Downloaded::Fetched(_) => stats.inc_downloads(),
                        }
                    }
                    info!(product_id = %update.product_id, path = %downloaded.path().display(), "Payload ready");
                    if let Some(output) = output {
                        output.set_contents(PipeContents::Path(downloaded.path().to_path_buf()));
                    }
                    true
                }
                Err(e) => {
                    if let Some(stats) = &stats {
                        stats.inc_failed_downloads();
                    }
                    warn!(product_id = %update.product_id, error = %e, "Download failed");
                    false
                }
            }
        });
    }

    fn terminate(&mut self) {
        self.task.abort();
    }
}
