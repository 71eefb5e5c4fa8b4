//! Process-table scan for the daemon's command-line signature.

use std::process::{Command, Stdio};

use log::{debug, warn};

use crate::descriptor::{ServiceDescriptor, SignaturePattern};
use crate::error::InspectError;

/// Answers "is the daemon running right now?".
pub trait ProcessInspector: Send + Sync {
    /// Scan the process table. `Err` means the table could not be read.
    fn probe(&self, descriptor: &ServiceDescriptor) -> Result<bool, InspectError>;

    /// `probe` with an unreadable table reported as "not running".
    fn is_running(&self, descriptor: &ServiceDescriptor) -> bool {
        match self.probe(descriptor) {
            Ok(running) => running,
            Err(e) => {
                warn!(
                    "process table unreadable, reporting {} as stopped: {e}",
                    descriptor.name()
                );
                false
            }
        }
    }
}

/// Inspector backed by `ps axww -o pid=,command=`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PsInspector;

impl ProcessInspector for PsInspector {
    fn probe(&self, descriptor: &ServiceDescriptor) -> Result<bool, InspectError> {
        let child = Command::new("ps")
            .args(["axww", "-o", "pid=,command="])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let ps_pid = child.id();
        let output = child.wait_with_output()?;

        if !output.status.success() {
            return Err(InspectError::Exit {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let table = String::from_utf8_lossy(&output.stdout);
        let found = scan_process_table(
            &table,
            descriptor.signature(),
            &[std::process::id(), ps_pid],
        );
        debug!("ps scan for {}: running={found}", descriptor.signature());
        Ok(found)
    }
}

/// Look for `signature` in `pid command...` lines, ignoring `exclude` pids.
pub fn scan_process_table(table: &str, signature: &SignaturePattern, exclude: &[u32]) -> bool {
    table.lines().any(|line| {
        let line = line.trim_start();
        let Some((pid, command)) = line.split_once(char::is_whitespace) else {
            return false;
        };
        let Ok(pid) = pid.parse::<u32>() else {
            return false;
        };
        !exclude.contains(&pid) && signature.matches(command)
    })
}
