//! Service-manager adapters - delegate to OS-native daemon managers
//!
//! - launchd (launchctl + plist `RunAtLoad`)
//! - systemd (systemctl, `--user` when not root)
//!
//! Both adapters build on every Unix; [`ManagerKind::platform_default`]
//! picks the native one.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::descriptor::ServiceDescriptor;
use crate::error::ServiceError;

mod command;
mod linux_control;
mod macos_control;
mod registration;

pub(crate) use command::is_root;
pub use command::Runner;
pub use linux_control::SystemdAdapter;
pub use macos_control::LaunchdAdapter;
pub use registration::{read_run_at_load, write_run_at_load};

/// Persisted "start at boot" registration as last read from the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "autostart", content = "reason")]
pub enum AutoStartFlag {
    Enabled,
    Disabled,
    /// The registration could not be read; not the same as `Disabled`.
    Unknown(String),
}

impl AutoStartFlag {
    /// `Unknown` reads as `false`.
    pub fn enabled(&self) -> bool {
        *self == AutoStartFlag::Enabled
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, AutoStartFlag::Unknown(_))
    }
}

impl From<bool> for AutoStartFlag {
    fn from(enabled: bool) -> Self {
        if enabled {
            AutoStartFlag::Enabled
        } else {
            AutoStartFlag::Disabled
        }
    }
}

impl fmt::Display for AutoStartFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutoStartFlag::Enabled => f.write_str("enabled"),
            AutoStartFlag::Disabled => f.write_str("disabled"),
            AutoStartFlag::Unknown(reason) => write!(f, "unknown ({reason})"),
        }
    }
}

/// Start/stop directives and boot registration for one service manager.
///
/// Implementations never retry; start and stop are idempotent.
pub trait ServiceAdapter: Send + Sync {
    fn start(&self, descriptor: &ServiceDescriptor) -> Result<(), ServiceError>;

    fn stop(&self, descriptor: &ServiceDescriptor) -> Result<(), ServiceError>;

    /// Write or remove the boot registration. On error the previous
    /// registration is left as it was.
    fn set_auto_start(
        &self,
        descriptor: &ServiceDescriptor,
        enabled: bool,
    ) -> Result<(), ServiceError>;

    fn auto_start(&self, descriptor: &ServiceDescriptor) -> AutoStartFlag;
}

/// Which service manager drives the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerKind {
    Launchd,
    Systemd,
    Unsupported,
}

impl ManagerKind {
    pub fn platform_default() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "macos")] {
                ManagerKind::Launchd
            } else if #[cfg(target_os = "linux")] {
                ManagerKind::Systemd
            } else {
                ManagerKind::Unsupported
            }
        }
    }

    /// Build the adapter. `elevate` runs manager commands through `sudo -n`
    /// when not already root.
    pub fn adapter(self, elevate: bool) -> Arc<dyn ServiceAdapter> {
        let runner = Runner::new(elevate);
        match self {
            ManagerKind::Launchd => Arc::new(LaunchdAdapter::new(runner)),
            ManagerKind::Systemd => Arc::new(SystemdAdapter::new(runner)),
            ManagerKind::Unsupported => Arc::new(UnsupportedAdapter),
        }
    }
}

/// Adapter for platforms with no supported service manager.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedAdapter;

impl UnsupportedAdapter {
    fn unavailable() -> ServiceError {
        ServiceError::ManagerUnavailable("no supported service manager on this platform".into())
    }
}

impl ServiceAdapter for UnsupportedAdapter {
    fn start(&self, _: &ServiceDescriptor) -> Result<(), ServiceError> {
        Err(Self::unavailable())
    }

    fn stop(&self, _: &ServiceDescriptor) -> Result<(), ServiceError> {
        Err(Self::unavailable())
    }

    fn set_auto_start(&self, _: &ServiceDescriptor, _: bool) -> Result<(), ServiceError> {
        Err(Self::unavailable())
    }

    fn auto_start(&self, _: &ServiceDescriptor) -> AutoStartFlag {
        AutoStartFlag::Unknown(Self::unavailable().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::SignaturePattern;

    #[test]
    fn unknown_flag_reads_false_but_is_distinct() {
        let unknown = AutoStartFlag::Unknown("unreadable".into());
        assert!(!unknown.enabled());
        assert!(!unknown.is_known());
        assert_ne!(unknown, AutoStartFlag::Disabled);
        assert!(AutoStartFlag::from(true).enabled());
        assert!(AutoStartFlag::Disabled.is_known());
    }

    #[test]
    fn unsupported_adapter_reports_manager_unavailable() {
        let d = ServiceDescriptor::new("x", SignaturePattern::literal("x"), "x", "/tmp/x");
        let adapter = ManagerKind::Unsupported.adapter(false);
        assert!(matches!(
            adapter.start(&d),
            Err(ServiceError::ManagerUnavailable(_))
        ));
        assert!(!adapter.auto_start(&d).is_known());
    }

    #[test]
    fn manager_kind_parses_from_config_text() {
        #[derive(Deserialize)]
        struct Wrap {
            manager: ManagerKind,
        }
        let w: Wrap = toml::from_str(r#"manager = "systemd""#).unwrap();
        assert_eq!(w.manager, ManagerKind::Systemd);
    }
}
