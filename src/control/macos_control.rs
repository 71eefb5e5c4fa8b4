//! launchd adapter (launchctl)

use log::{debug, info};

use super::command::{CommandOutput, Runner, classify_failure};
use super::registration::{read_run_at_load, write_run_at_load};
use super::{AutoStartFlag, ServiceAdapter};
use crate::descriptor::ServiceDescriptor;
use crate::error::ServiceError;

const LAUNCHCTL: &str = "launchctl";

/// Drives a LaunchDaemon in the `system` domain. The registration path of
/// the descriptor is the job's plist; auto-start is its `RunAtLoad` key.
#[derive(Debug, Clone)]
pub struct LaunchdAdapter {
    runner: Runner,
    domain: String,
}

impl LaunchdAdapter {
    pub fn new(runner: Runner) -> Self {
        Self {
            runner,
            domain: "system".to_string(),
        }
    }

    /// Target another launchd domain, e.g. `gui/501` for a LaunchAgent.
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    fn service_target(&self, d: &ServiceDescriptor) -> String {
        format!("{}/{}", self.domain, d.handle())
    }

    fn plist_path(d: &ServiceDescriptor) -> Result<&str, ServiceError> {
        d.registration().to_str().ok_or_else(|| {
            ServiceError::Corrupt(format!(
                "plist path is not valid UTF-8: {}",
                d.registration().display()
            ))
        })
    }

    fn launchctl(&self, args: &[&str]) -> Result<CommandOutput, ServiceError> {
        self.runner.run(LAUNCHCTL, args)
    }
}

/// launchctl reports "already loaded" for bootstrap/load of a live job.
fn already_loaded(out: &CommandOutput) -> bool {
    let text = out.text().to_lowercase();
    text.contains("already loaded")
        || text.contains("already bootstrapped")
        || text.contains("service is already")
}

/// launchctl reports the job as absent for bootout/unload of a dead job.
fn not_loaded(out: &CommandOutput) -> bool {
    let text = out.text().to_lowercase();
    text.contains("no such process")
        || text.contains("could not find specified service")
        || text.contains("could not find service")
        || text.contains("not loaded")
        || out.code == Some(113)
}

impl ServiceAdapter for LaunchdAdapter {
    /// Bootstrap the plist (tolerating "already loaded"), then kickstart;
    /// falls back to legacy `launchctl load`.
    fn start(&self, d: &ServiceDescriptor) -> Result<(), ServiceError> {
        let plist = Self::plist_path(d)?;
        let target = self.service_target(d);

        let boot = self.launchctl(&["bootstrap", &self.domain, plist])?;
        if !boot.success {
            debug!("launchctl bootstrap {target}: {}", boot.stderr);
        }

        let kick = self.launchctl(&["kickstart", &target])?;
        if kick.success {
            info!("launchd kickstarted {target}");
            return Ok(());
        }

        let load = self.launchctl(&["load", plist])?;
        if load.success || already_loaded(&load) {
            info!("launchd loaded {plist}");
            return Ok(());
        }
        // report the modern command's reason when both fail the same way
        Err(classify_failure("launchctl kickstart", &kick))
    }

    /// Boot the job out (launchd sends SIGTERM); falls back to legacy
    /// `launchctl unload`. An absent job counts as stopped.
    fn stop(&self, d: &ServiceDescriptor) -> Result<(), ServiceError> {
        let target = self.service_target(d);

        let out = self.launchctl(&["bootout", &target])?;
        if out.success || not_loaded(&out) {
            info!("launchd booted out {target}");
            return Ok(());
        }

        let plist = Self::plist_path(d)?;
        let unload = self.launchctl(&["unload", plist])?;
        if unload.success || not_loaded(&unload) {
            info!("launchd unloaded {plist}");
            return Ok(());
        }
        Err(classify_failure("launchctl bootout", &out))
    }

    fn set_auto_start(&self, d: &ServiceDescriptor, enabled: bool) -> Result<(), ServiceError> {
        write_run_at_load(d.registration(), enabled, &self.runner)
    }

    fn auto_start(&self, d: &ServiceDescriptor) -> AutoStartFlag {
        read_run_at_load(d.registration())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::SignaturePattern;

    fn out(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            success: code == 0,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn absent_job_messages_count_as_stopped() {
        assert!(not_loaded(&out(3, "Boot-out failed: 3: No such process")));
        assert!(not_loaded(&out(113, "")));
        assert!(not_loaded(&out(
            1,
            "Could not find specified service"
        )));
        assert!(!not_loaded(&out(1, "Operation not permitted")));
    }

    #[test]
    fn already_loaded_messages() {
        assert!(already_loaded(&out(
            1,
            "/Library/LaunchDaemons/x.plist: service already loaded"
        )));
        assert!(!already_loaded(&out(1, "Load failed: 5: Input/output error")));
    }

    #[test]
    fn targets_are_domain_qualified() {
        let d = ServiceDescriptor::new(
            "Crossfire",
            SignaturePattern::literal("crossfire/lib/startup.jar"),
            "net.emiva.crossfire",
            "/Library/LaunchDaemons/net.emiva.crossfire.plist",
        );
        let system = LaunchdAdapter::new(Runner::new(false));
        assert_eq!(system.service_target(&d), "system/net.emiva.crossfire");
        let gui = LaunchdAdapter::new(Runner::new(false)).domain("gui/501");
        assert_eq!(gui.service_target(&d), "gui/501/net.emiva.crossfire");
        assert_eq!(
            LaunchdAdapter::plist_path(&d).unwrap(),
            "/Library/LaunchDaemons/net.emiva.crossfire.plist"
        );
    }

    #[test]
    fn auto_start_goes_through_the_plist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.plist");
        let mut dict = plist::Dictionary::new();
        dict.insert("Label".into(), plist::Value::String("job".into()));
        plist::Value::Dictionary(dict).to_file_xml(&path).unwrap();

        let d = ServiceDescriptor::new("job", SignaturePattern::literal("job"), "job", &path);
        let adapter = LaunchdAdapter::new(Runner::new(false));
        assert_eq!(adapter.auto_start(&d), AutoStartFlag::Disabled);
        adapter.set_auto_start(&d, true).unwrap();
        assert_eq!(adapter.auto_start(&d), AutoStartFlag::Enabled);
    }
}
