use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::info;
use serde::{Deserialize, Serialize};

use crate::auth::{AuthorizationGate, ProviderKind};
use crate::clock::SystemClock;
use crate::control::ManagerKind;
use crate::descriptor::{ServiceDescriptor, SignaturePattern};
use crate::lifecycle::{LifecycleController, Timing};

/// System-wide configuration file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/daemonctl/daemonctl.toml";

/// Top‑level controller configuration. Defaults target a Crossfire server
/// registered with the platform service manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub service: ServiceSection,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Identity of the managed daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    pub name: String,
    /// Command-line signature looked for in the process table
    pub signature: String,
    #[serde(default)]
    pub signature_kind: SignatureKind,
    #[serde(default = "ManagerKind::platform_default")]
    pub manager: ManagerKind,
    /// launchd label or systemd unit
    pub handle: String,
    /// launchd plist path; informational for systemd
    pub registration: String,
    pub admin_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureKind {
    #[default]
    Literal,
    Regex,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_settle_timeout() -> u64 {
    15
}

fn default_settle_poll() -> u64 {
    500
}

fn default_command_timeout() -> u64 {
    20
}

fn default_auth_session() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_settle_timeout")]
    pub settle_timeout_secs: u64,
    #[serde(default = "default_settle_poll")]
    pub settle_poll_millis: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_auth_session")]
    pub auth_session_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            settle_timeout_secs: default_settle_timeout(),
            settle_poll_millis: default_settle_poll(),
            command_timeout_secs: default_command_timeout(),
            auth_session_secs: default_auth_session(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_provider() -> ProviderKind {
    ProviderKind::Sudo
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
    /// Run manager commands through `sudo -n` when not root
    #[serde(default = "default_true")]
    pub elevate: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            elevate: true,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let manager = ManagerKind::platform_default();
        let (handle, registration) = match manager {
            ManagerKind::Systemd => ("crossfire", "/etc/systemd/system/crossfire.service"),
            _ => (
                "net.emiva.crossfire",
                "/Library/LaunchDaemons/net.emiva.crossfire.plist",
            ),
        };
        Self {
            service: ServiceSection {
                name: "Crossfire".into(),
                signature: "crossfire/lib/startup.jar".into(),
                signature_kind: SignatureKind::Literal,
                manager,
                handle: handle.into(),
                registration: registration.into(),
                admin_url: Some("http://127.0.0.1:9090".into()),
            },
            timing: TimingConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

/// Pick the config file: explicit path, then the system file, then the
/// per-user config directory.
pub fn resolve_config_path(explicit: Option<PathBuf>, system: bool) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    if system {
        return Ok(PathBuf::from(SYSTEM_CONFIG_PATH));
    }
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join("daemonctl");
    Ok(config_dir.join("daemonctl.toml"))
}

impl ControllerConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let cfg: ControllerConfig = toml::from_str(text).context("Failed to parse config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Load `path`, writing the defaults there first if it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(
                "Config not found at {}, creating default configuration",
                path.display()
            );
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
            let default_toml = toml::to_string_pretty(&ControllerConfig::default())
                .context("Failed to serialize default config")?;
            fs::write(path, default_toml).context("Failed to write config file")?;
        }
        let cfg = Self::load(path)?;
        info!("Using config from: {}", path.display());
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.service;
        if s.name.trim().is_empty() {
            bail!("service.name must not be empty");
        }
        if s.signature.trim().is_empty() {
            bail!("service.signature must not be empty");
        }
        if s.handle.trim().is_empty() {
            bail!("service.handle must not be empty");
        }
        if s.manager == ManagerKind::Launchd && s.registration.trim().is_empty() {
            bail!("service.registration must name the launchd plist");
        }
        self.signature()?;

        // the osascript dialog grants nothing to later `sudo -n` commands
        if self.auth.provider == ProviderKind::Osascript && self.auth.elevate {
            bail!("auth.provider = \"osascript\" requires auth.elevate = false");
        }

        let t = &self.timing;
        if t.poll_interval_secs == 0 {
            bail!("timing.poll_interval_secs must be at least 1");
        }
        if t.settle_timeout_secs == 0 || t.command_timeout_secs == 0 {
            bail!("timing.settle_timeout_secs and timing.command_timeout_secs must be at least 1");
        }
        if t.settle_poll_millis == 0 {
            bail!("timing.settle_poll_millis must be at least 1");
        }
        Ok(())
    }

    fn signature(&self) -> Result<SignaturePattern> {
        let s = &self.service;
        match s.signature_kind {
            SignatureKind::Literal => Ok(SignaturePattern::literal(&s.signature)),
            SignatureKind::Regex => SignaturePattern::regex(&s.signature).with_context(|| {
                format!("service.signature is not a valid regex: {}", s.signature)
            }),
        }
    }

    pub fn descriptor(&self) -> Result<ServiceDescriptor> {
        let s = &self.service;
        let d = ServiceDescriptor::new(
            &s.name,
            self.signature()?,
            &s.handle,
            PathBuf::from(&s.registration),
        );
        Ok(match &s.admin_url {
            Some(url) => d.admin_url(url),
            None => d,
        })
    }

    pub fn timing(&self) -> Timing {
        Timing {
            command_timeout: Duration::from_secs(self.timing.command_timeout_secs),
            settle_timeout: Duration::from_secs(self.timing.settle_timeout_secs),
            settle_poll: Duration::from_millis(self.timing.settle_poll_millis),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.timing.poll_interval_secs)
    }

    /// Wire descriptor, adapter, gate and timing into a controller.
    pub fn controller(&self) -> Result<LifecycleController> {
        let descriptor = self.descriptor()?;
        let adapter = self.service.manager.adapter(self.auth.elevate);
        let gate = AuthorizationGate::new(
            self.auth.provider.provider(),
            Arc::new(SystemClock),
            Duration::from_secs(self.timing.auth_session_secs),
        );
        Ok(LifecycleController::new(descriptor, adapter, gate).timing(self.timing()))
    }
}
