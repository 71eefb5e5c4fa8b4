//! Running service-manager commands, optionally through `sudo -n`.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use log::debug;

use crate::error::ServiceError;

/// Captured result of one manager command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout and stderr together, for matching manager messages that
    /// land on either stream.
    pub fn text(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Executes manager commands. With `elevate` set and the process not root,
/// commands go through `sudo -n`, reusing credentials cached by a prior
/// `sudo -v`.
#[derive(Debug, Clone, Copy)]
pub struct Runner {
    elevate: bool,
}

impl Runner {
    pub fn new(elevate: bool) -> Self {
        Self { elevate }
    }

    /// True when commands will be wrapped in `sudo -n`.
    pub fn elevates(&self) -> bool {
        self.elevate && !is_root()
    }

    fn locate(program: &str) -> Result<PathBuf, ServiceError> {
        which::which(program)
            .map_err(|e| ServiceError::ManagerUnavailable(format!("{program} not found: {e}")))
    }

    /// Run `program args...`. `Err` only when the command could not be
    /// launched; a non-zero exit is reported in the output.
    pub fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ServiceError> {
        let exe = Self::locate(program)?;
        let mut cmd = if self.elevates() {
            let sudo = Self::locate("sudo")?;
            let mut c = Command::new(sudo);
            c.arg("-n").arg(&exe);
            c
        } else {
            Command::new(&exe)
        };
        cmd.args(args).stdin(Stdio::null());

        debug!("exec {program} {}", args.join(" "));
        let output = cmd.output().map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                ServiceError::PermissionDenied(format!("cannot execute {program}: {e}"))
            }
            _ => ServiceError::ManagerUnavailable(format!("failed to execute {program}: {e}")),
        })?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Map a failed manager command onto the adapter error taxonomy.
pub fn classify_failure(what: &str, out: &CommandOutput) -> ServiceError {
    let text = out.text();
    let lower = text.to_lowercase();
    let detail = if out.stderr.is_empty() {
        format!("{what} exited with {:?}: {}", out.code, out.stdout)
    } else {
        format!("{what} exited with {:?}: {}", out.code, out.stderr)
    };

    const DENIED: [&str; 6] = [
        "permission denied",
        "operation not permitted",
        "access denied",
        "interactive authentication required",
        "a password is required",
        "not privileged",
    ];
    if DENIED.iter().any(|needle| lower.contains(needle)) {
        return ServiceError::PermissionDenied(detail);
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return ServiceError::Timeout(detail);
    }
    ServiceError::ManagerUnavailable(detail)
}

/// Effective uid is root
#[inline]
pub(crate) fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            success: false,
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[rstest]
    #[case("Failed to start foo.service: Access denied")]
    #[case("Bootstrap failed: 1: Operation not permitted")]
    #[case("sudo: a password is required")]
    #[case("Failed to enable unit: Interactive authentication required.")]
    fn permission_failures(#[case] stderr: &str) {
        assert!(matches!(
            classify_failure("cmd", &failed(stderr)),
            ServiceError::PermissionDenied(_)
        ));
    }

    #[test]
    fn timeouts_and_everything_else() {
        assert!(matches!(
            classify_failure("cmd", &failed("Job for foo.service timed out.")),
            ServiceError::Timeout(_)
        ));
        let err = classify_failure("systemctl start", &failed("Unit foo.service not found."));
        assert_eq!(
            err,
            ServiceError::ManagerUnavailable(
                "systemctl start exited with Some(1): Unit foo.service not found.".into()
            )
        );
    }

    #[test]
    fn missing_program_is_manager_unavailable() {
        let err = Runner::new(false)
            .run("definitely-not-a-service-manager-binary", &[])
            .unwrap_err();
        assert!(matches!(err, ServiceError::ManagerUnavailable(_)));
    }

    #[cfg(unix)]
    #[test]
    fn captures_exit_status_and_output() {
        let out = Runner::new(false).run("sh", &["-c", "echo out; echo err >&2; exit 3"]).unwrap();
        assert!(!out.success);
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout, "out");
        assert_eq!(out.stderr, "err");
    }
}
