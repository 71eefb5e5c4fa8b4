//! systemd adapter (systemctl)

use log::info;

use super::command::{CommandOutput, Runner, classify_failure, is_root};
use super::{AutoStartFlag, ServiceAdapter};
use crate::descriptor::ServiceDescriptor;
use crate::error::ServiceError;

const SYSTEMCTL: &str = "systemctl";

/// Drives a systemd unit. The descriptor handle names the unit; boot
/// registration is `systemctl enable`/`disable`, which systemd applies as a
/// symlink swap.
#[derive(Debug, Clone)]
pub struct SystemdAdapter {
    runner: Runner,
    user: bool,
}

impl SystemdAdapter {
    /// System units when root or elevating, the user manager otherwise.
    pub fn new(runner: Runner) -> Self {
        let user = !is_root() && !runner.elevates();
        Self { runner, user }
    }

    /// Force the user (`--user`) or system manager.
    pub fn user_manager(mut self, user: bool) -> Self {
        self.user = user;
        self
    }

    fn systemctl(&self, verb: &str, unit: &str) -> Result<CommandOutput, ServiceError> {
        let mut args = Vec::with_capacity(3);
        if self.user {
            args.push("--user");
        }
        args.push(verb);
        args.push(unit);
        self.runner.run(SYSTEMCTL, &args)
    }

    fn expect_success(&self, verb: &str, unit: &str) -> Result<(), ServiceError> {
        let out = self.systemctl(verb, unit)?;
        if out.success {
            info!("systemctl {verb} {unit}");
            Ok(())
        } else {
            Err(classify_failure(&format!("systemctl {verb} {unit}"), &out))
        }
    }
}

/// `name` or `name.service`; other unit suffixes are kept.
pub(crate) fn unit_name(handle: &str) -> String {
    if handle.contains('.') {
        handle.to_string()
    } else {
        format!("{handle}.service")
    }
}

/// Interpret `systemctl is-enabled` output.
pub(crate) fn parse_is_enabled(out: &CommandOutput) -> AutoStartFlag {
    match out.stdout.lines().next().map(str::trim) {
        Some("enabled" | "enabled-runtime" | "alias" | "indirect" | "generated") => {
            AutoStartFlag::Enabled
        }
        Some("disabled" | "masked" | "masked-runtime" | "static" | "linked" | "linked-runtime") => {
            AutoStartFlag::Disabled
        }
        Some(other) if !other.is_empty() => {
            AutoStartFlag::Unknown(format!("unrecognised is-enabled state `{other}`"))
        }
        _ => AutoStartFlag::Unknown(if out.stderr.is_empty() {
            format!("systemctl is-enabled exited with {:?}", out.code)
        } else {
            out.stderr.clone()
        }),
    }
}

impl ServiceAdapter for SystemdAdapter {
    fn start(&self, d: &ServiceDescriptor) -> Result<(), ServiceError> {
        // starting an active unit is a no-op for systemd
        self.expect_success("start", &unit_name(d.handle()))
    }

    fn stop(&self, d: &ServiceDescriptor) -> Result<(), ServiceError> {
        let unit = unit_name(d.handle());
        let out = self.systemctl("stop", &unit)?;
        if out.success || out.stderr.contains("not loaded") {
            info!("systemctl stop {unit}");
            return Ok(());
        }
        Err(classify_failure(&format!("systemctl stop {unit}"), &out))
    }

    fn set_auto_start(&self, d: &ServiceDescriptor, enabled: bool) -> Result<(), ServiceError> {
        let verb = if enabled { "enable" } else { "disable" };
        self.expect_success(verb, &unit_name(d.handle()))
    }

    fn auto_start(&self, d: &ServiceDescriptor) -> AutoStartFlag {
        match self.systemctl("is-enabled", &unit_name(d.handle())) {
            Ok(out) => parse_is_enabled(&out),
            Err(e) => AutoStartFlag::Unknown(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn out(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            success: code == 0,
            code: Some(code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[rstest]
    #[case("crossfire", "crossfire.service")]
    #[case("crossfire.service", "crossfire.service")]
    #[case("crossfire.socket", "crossfire.socket")]
    fn unit_names(#[case] handle: &str, #[case] unit: &str) {
        assert_eq!(unit_name(handle), unit);
    }

    #[rstest]
    #[case(out(0, "enabled", ""), AutoStartFlag::Enabled)]
    #[case(out(0, "enabled-runtime", ""), AutoStartFlag::Enabled)]
    #[case(out(1, "disabled", ""), AutoStartFlag::Disabled)]
    #[case(out(1, "masked", ""), AutoStartFlag::Disabled)]
    #[case(out(0, "static", ""), AutoStartFlag::Disabled)]
    fn is_enabled_states(#[case] output: CommandOutput, #[case] expected: AutoStartFlag) {
        assert_eq!(parse_is_enabled(&output), expected);
    }

    #[test]
    fn unreadable_is_enabled_is_unknown() {
        let flag = parse_is_enabled(&out(
            1,
            "",
            "Failed to get unit file state for foo.service: No such file or directory",
        ));
        assert_eq!(
            flag,
            AutoStartFlag::Unknown(
                "Failed to get unit file state for foo.service: No such file or directory".into()
            )
        );
        assert!(!parse_is_enabled(&out(0, "bad-setting", "")).is_known());
    }

    #[test]
    fn user_manager_override() {
        let a = SystemdAdapter::new(Runner::new(false)).user_manager(true);
        assert!(a.user);
        let a = a.user_manager(false);
        assert!(!a.user);
    }
}
