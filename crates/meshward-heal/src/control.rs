//! Local overlay service and application control.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{HealError, HealResult};

/// Start/stop primitives for the local overlay stack.
///
/// Each call should be bounded by the OS; the remediation sequence also
/// wraps every call in its own timeout.
#[async_trait]
pub trait OverlayControl: Send + Sync {
    async fn stop_app(&self) -> HealResult<()>;
    async fn stop_service(&self) -> HealResult<()>;
    async fn start_service(&self) -> HealResult<()>;
    async fn start_app(&self) -> HealResult<()>;
}

/// Controls the overlay through the host's service manager: `sc` on
/// Windows, `systemctl` elsewhere.
#[derive(Debug, Clone)]
pub struct SystemOverlayControl {
    service_names: Vec<String>,
    app_paths: Vec<PathBuf>,
}

impl SystemOverlayControl {
    pub fn new(service_names: Vec<String>, app_paths: Vec<PathBuf>) -> Self {
        Self {
            service_names,
            app_paths,
        }
    }

    /// Run `action` against each candidate service until one accepts it.
    async fn service(&self, action: &str) -> HealResult<()> {
        let mut last_error = HealError::Command {
            command: format!("service {action}"),
            message: "no service names configured".to_string(),
        };
        for name in &self.service_names {
            let result = if cfg!(windows) {
                run("sc", &[action, name]).await
            } else {
                run("systemctl", &[action, name]).await
            };
            match result {
                Ok(()) => {
                    info!(service = %name, %action, "overlay service command succeeded");
                    return Ok(());
                }
                Err(e) => {
                    debug!(service = %name, %action, error = %e, "service candidate rejected command");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

#[async_trait]
impl OverlayControl for SystemOverlayControl {
    async fn stop_app(&self) -> HealResult<()> {
        let mut stopped = 0;
        for path in &self.app_paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let result = if cfg!(windows) {
                run("taskkill", &["/IM", name, "/F"]).await
            } else {
                run("pkill", &["-x", name]).await
            };
            match result {
                Ok(()) => stopped += 1,
                // Exit status 1 from pkill/taskkill means nothing matched.
                Err(e) => debug!(app = %name, error = %e, "app was not running"),
            }
        }
        if stopped == 0 {
            debug!("no overlay application stopped");
        }
        Ok(())
    }

    async fn stop_service(&self) -> HealResult<()> {
        self.service("stop").await
    }

    async fn start_service(&self) -> HealResult<()> {
        self.service("start").await
    }

    async fn start_app(&self) -> HealResult<()> {
        if self.app_paths.is_empty() {
            debug!("no overlay application configured");
            return Ok(());
        }
        let Some(path) = self.app_paths.iter().find(|p| p.exists()) else {
            return Err(HealError::Command {
                command: "start app".to_string(),
                message: format!("none of {:?} exists", self.app_paths),
            });
        };

        // The application keeps running after we return.
        Command::new(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| HealError::Command {
                command: path.display().to_string(),
                message: e.to_string(),
            })?;
        info!(app = %path.display(), "overlay application started");
        Ok(())
    }
}

async fn run(program: &str, args: &[&str]) -> HealResult<()> {
    let command = format!("{program} {}", args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| HealError::Command {
            command: command.clone(),
            message: e.to_string(),
        })?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    warn!(%command, code = ?output.status.code(), %stderr, "command failed");
    Err(HealError::Command {
        command,
        message: if stderr.is_empty() {
            format!("exit status {:?}", output.status.code())
        } else {
            stderr
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_services_configured_is_an_error() {
        let control = SystemOverlayControl::new(Vec::new(), Vec::new());
        let err = control.stop_service().await.unwrap_err();
        assert!(err.to_string().contains("no service names configured"));
    }

    #[tokio::test]
    async fn apps_are_optional() {
        let control = SystemOverlayControl::new(Vec::new(), Vec::new());
        control.stop_app().await.unwrap();
        control.start_app().await.unwrap();
    }

    #[tokio::test]
    async fn missing_app_path_fails_start() {
        let control = SystemOverlayControl::new(
            Vec::new(),
            vec![PathBuf::from("/nonexistent/meshward-overlay-ui")],
        );
        assert!(control.start_app().await.is_err());
    }

    #[tokio::test]
    async fn run_reports_missing_program() {
        let err = run("meshward-definitely-not-a-program", &["x"]).await.unwrap_err();
        assert!(matches!(err, HealError::Command { .. }));
    }
}
