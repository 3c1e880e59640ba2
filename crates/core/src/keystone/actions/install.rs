//! Running a downloaded installer payload.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn, Span};

use crate::action::{Action, ActionPipes, ActionTask, Completion, PipeContents};
use crate::command::CommandRunner;
use crate::update::UpdateInfo;

/// Interpreter used to run payloads.
pub const INSTALLER_SHELL: &str = "/bin/sh";

/// Phases passed to the payload, in order.
pub const INSTALL_PHASES: [&str; 3] = ["preinstall", "install", "postinstall"];

/// Return code reported when the installer could not be run at all.
pub const RETURN_CODE_NOT_RUN: i32 = -1;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Environment handed to every installer phase.
pub fn installer_environment(
    update: &UpdateInfo,
    payload: &Path,
    user_initiated: bool,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("KS_PRODUCT_ID".to_string(), update.product_id.clone());
    env.insert("KS_CODEBASE_URL".to_string(), update.codebase_url.clone());
    env.insert(
        "KS_DISPLAY_VERSION".to_string(),
        update.display_version.clone().unwrap_or_default(),
    );
    env.insert(
        "KS_USER_INITIATED".to_string(),
        if user_initiated { "1" } else { "0" }.to_string(),
    );
    env.insert("KS_PAYLOAD".to_string(), payload.display().to_string());
    env.insert("PATH".to_string(), DEFAULT_PATH.to_string());
    env
}

/// Run every install phase, stopping at the first non-zero exit.
/// Returns the last exit code.
pub async fn run_installer(
    runner: &dyn CommandRunner,
    update: &UpdateInfo,
    payload: &Path,
    user_initiated: bool,
) -> i32 {
    let env = installer_environment(update, payload, user_initiated);
    let shell = Path::new(INSTALLER_SHELL);

    for phase in INSTALL_PHASES {
        let args = vec![payload.display().to_string(), phase.to_string()];
        match runner.run_command(shell, &args, &env).await {
            Ok(output) if output.success() => {
                debug!(product_id = %update.product_id, phase, "Install phase succeeded");
            }
            Ok(output) => {
                warn!(
                    product_id = %update.product_id,
                    phase,
                    exit_code = output.exit_code,
                    output = %output.output.trim(),
                    "Install phase failed"
                );
                return output.exit_code;
            }
            Err(e) => {
                warn!(product_id = %update.product_id, phase, error = %e, "Install phase could not run");
                return RETURN_CODE_NOT_RUN;
            }
        }
    }
    0
}

/// Installs a payload whose path arrives on the input pipe. Outputs the
/// installer's `ReturnCode`; succeeds iff it is zero.
pub struct InstallAction {
    name: String,
    pipes: ActionPipes,
    update: UpdateInfo,
    runner: Arc<dyn CommandRunner>,
    user_initiated: bool,
    span: Span,
    task: ActionTask,
}

impl InstallAction {
    pub fn new(
        update: UpdateInfo,
        runner: Arc<dyn CommandRunner>,
        user_initiated: bool,
        span: Span,
    ) -> Self {
        Self {
            name: format!("install:{}", update.product_id),
            pipes: ActionPipes::default(),
            update,
            runner,
            user_initiated,
            span,
            task: ActionTask::new(),
        }
    }
}

impl Action for InstallAction {
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
        let payload: Option<PathBuf> = match self.in_pipe().and_then(|pipe| pipe.contents()) {
            Some(PipeContents::Path(path)) => Some(path),
            _ => None,
        };
        let output = self.pipes.output.clone();
        let Some(payload) = payload else {
            warn!(product_id = %self.update.product_id, "No payload to install");
            if let Some(output) = output {
                output.set_contents(PipeContents::ReturnCode(RETURN_CODE_NOT_RUN));
            }
            completion.finish(false);
            return;
        };

        let update = self.update.clone();
        let runner = Arc::clone(&self.runner);
        let user_initiated = self.user_initiated;

        self.task.spawn(completion, self.span.clone(), async move {
            info!(product_id = %update.product_id, payload = %payload.display(), "Installing update");
            let code = run_installer(runner.as_ref(), &update, &payload, user_initiated).await;
            if let Some(output) = output {
                output.set_contents(PipeContents::ReturnCode(code));
            }
            code == 0
        });
    }

    fn terminate(&mut self) {
        self.task.abort();
    }
}
