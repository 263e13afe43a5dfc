//! Command-backed [`HostOps`]
//!
//! The agent runs in a privileged container with the host's PID namespace.
//! Host programs are started through `nsenter --target 1` so they see the
//! host's mounts. The install flow runs directly on the host and skips it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use lca_common::{Error, Result};

use crate::client::{to_args, HostOps};

/// Upper bound for a single host command; extracting a var archive can take minutes
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How host programs are started
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostMode {
    /// Enter the mount, IPC, PID and cgroup namespaces of PID 1
    Nsenter,
    /// Run directly, the process already lives on the host
    Direct,
}

/// [`HostOps`] implemented with `tokio::process`
#[derive(Clone, Debug)]
pub struct CommandHostOps {
    mode: HostMode,
    timeout: Duration,
}

impl CommandHostOps {
    /// Ops entering the host namespaces through nsenter
    pub fn nsenter() -> Self {
        Self {
            mode: HostMode::Nsenter,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Ops running programs directly
    pub fn direct() -> Self {
        Self {
            mode: HostMode::Direct,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Override the per-command timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Program and arguments actually executed for `program args` in `mode`
pub fn host_command(mode: HostMode, program: &str, args: &[String]) -> (String, Vec<String>) {
    match mode {
        HostMode::Direct => (program.to_string(), args.to_vec()),
        HostMode::Nsenter => {
            let mut full = to_args(&[
                "--target", "1", "--cgroup", "--mount", "--ipc", "--pid", "--", program,
            ]);
            full.extend_from_slice(args);
            ("nsenter".to_string(), full)
        }
    }
}

async fn run_command(program: &str, args: &[String], timeout: Duration) -> Result<String> {
    debug!(program, ?args, "Executing host command");
    let mut cmd = Command::new(program);
    cmd.args(args);
    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| Error::command(program, format!("timed out after {timeout:?}")))?
        .map_err(|e| Error::command(program, format!("failed to execute: {e}")))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!(program, ?args, status = %output.status, stderr = %stderr, "Host command failed");
        Err(Error::command(program, format!("{}: {stderr}", output.status)))
    }
}

#[async_trait]
impl HostOps for CommandHostOps {
    async fn run_in_host_namespace(&self, program: &str, args: &[String]) -> Result<String> {
        let (exe, full) = host_command(self.mode, program, args);
        run_command(&exe, &full, self.timeout)
            .await
            .map_err(|e| match e {
                // report the wrapped program rather than nsenter
                Error::Command { message, .. } => Error::command(program, message),
                other => other,
            })
    }

    async fn run_bash_in_host_namespace(&self, script: &str) -> Result<String> {
        self.run_in_host_namespace("bash", &to_args(&["-c", script]))
            .await
    }

    async fn remount_and_remove(&self, path: &str) -> Result<()> {
        let script = format!("mount -o remount,rw /sysroot && rm -rf {path}");
        self.run_in_host_namespace("unshare", &to_args(&["-m", "/bin/sh", "-c", script.as_str()]))
            .await
            .map(drop)
    }

    async fn remount_sysroot(&self) -> Result<()> {
        self.run_in_host_namespace("mount", &to_args(&["/sysroot", "-o", "remount,rw"]))
            .await
            .map(drop)
    }

    async fn mount_image(&self, image: &str) -> Result<String> {
        self.run_in_host_namespace("podman", &to_args(&["image", "mount", image]))
            .await
    }

    async fn unmount_and_remove_image(&self, image: &str) -> Result<()> {
        let unmounted = self
            .run_in_host_namespace("podman", &to_args(&["image", "unmount", image]))
            .await;
        if let Err(e) = &unmounted {
            warn!(image, error = %e, "Failed to unmount image");
        }
        self.run_in_host_namespace("podman", &to_args(&["rmi", image]))
            .await?;
        unmounted.map(drop)
    }

    async fn extract_tar_with_selinux(&self, archive: &str, dest: &str) -> Result<()> {
        self.run_in_host_namespace(
            "tar",
            &to_args(&["xzf", archive, "-C", dest, "--selinux"]),
        )
        .await
        .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nsenter_mode_wraps_program() {
        let (exe, args) = host_command(HostMode::Nsenter, "ostree", &to_args(&["admin", "status"]));
        assert_eq!(exe, "nsenter");
        assert_eq!(
            args,
            to_args(&[
                "--target", "1", "--cgroup", "--mount", "--ipc", "--pid", "--", "ostree", "admin",
                "status"
            ])
        );
    }

    #[test]
    fn direct_mode_runs_program_as_is() {
        let (exe, args) = host_command(HostMode::Direct, "podman", &to_args(&["images"]));
        assert_eq!(exe, "podman");
        assert_eq!(args, to_args(&["images"]));
    }

    #[tokio::test]
    async fn direct_ops_capture_trimmed_stdout() {
        let ops = CommandHostOps::direct();
        let out = ops
            .run_bash_in_host_namespace("echo '  hello  '")
            .await
            .expect("bash should run");
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn failing_command_reports_program_and_stderr() {
        let ops = CommandHostOps::direct();
        let err = ops
            .run_bash_in_host_namespace("echo boom >&2; exit 3")
            .await
            .expect_err("command should fail");
        match err {
            Error::Command { program, message } => {
                assert_eq!(program, "bash");
                assert!(message.contains("boom"), "{message}");
            }
            other => panic!("expected Command error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_a_command_error() {
        let ops = CommandHostOps::direct();
        let err = ops
            .run_in_host_namespace("lca-definitely-not-installed", &[])
            .await
            .expect_err("spawn should fail");
        assert!(matches!(err, Error::Command { .. }));
    }
}
