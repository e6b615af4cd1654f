use std::sync::Arc;

use anyhow::{Context, Result};

use super::Shell;

/// UiDriver performs user-facing actions on the device.
pub trait UiDriver: Send + Sync {
    /// Launch `app` from the home screen, optionally at a specific entry point.
    fn launch_app(
        &self,
        app: &str,
        entry_point: Option<&str>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Ask the platform to minimize memory usage.
    fn trigger_gc(&self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Drives the UI by running configured shell command templates.
///
/// Templates may reference `{app}` and `{entry_point}`.
pub struct ShellUiDriver<S> {
    shell: Arc<S>,
    launch_command: String,
    gc_command: String,
}

impl<S: Shell> ShellUiDriver<S> {
    pub fn new(shell: Arc<S>, launch_command: String, gc_command: String) -> Self {
        Self {
            shell,
            launch_command,
            gc_command,
        }
    }
}

impl<S: Shell> UiDriver for ShellUiDriver<S> {
    async fn launch_app(&self, app: &str, entry_point: Option<&str>) -> Result<()> {
        let command = render_template(&self.launch_command, app, entry_point);
        tracing::debug!(%command, "launching app");

        self.shell
            .exec(&command)
            .await
            .with_context(|| format!("launching {app}"))?;

        Ok(())
    }

    async fn trigger_gc(&self) -> Result<()> {
        if self.gc_command.is_empty() {
            return Ok(());
        }

        self.shell
            .exec(&self.gc_command)
            .await
            .context("triggering memory minimization")?;

        Ok(())
    }
}

fn render_template(template: &str, app: &str, entry_point: Option<&str>) -> String {
    template
        .replace("{app}", app)
        .replace("{entry_point}", entry_point.unwrap_or(""))
}
