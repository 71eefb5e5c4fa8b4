//! Immutable identity of the managed daemon.

use std::fmt;
use std::path::{Path, PathBuf};

use regex::Regex;

/// How a process command line is recognised as the daemon.
#[derive(Debug, Clone)]
pub enum SignaturePattern {
    /// Plain substring match, the way `fgrep` matches.
    Literal(String),
    Regex(Regex),
}

impl SignaturePattern {
    pub fn literal(s: impl Into<String>) -> Self {
        SignaturePattern::Literal(s.into())
    }

    pub fn regex(s: &str) -> Result<Self, regex::Error> {
        Ok(SignaturePattern::Regex(Regex::new(s)?))
    }

    /// True if `command_line` belongs to the daemon.
    pub fn matches(&self, command_line: &str) -> bool {
        match self {
            SignaturePattern::Literal(needle) => {
                !needle.is_empty() && command_line.contains(needle.as_str())
            }
            SignaturePattern::Regex(re) => re.is_match(command_line),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SignaturePattern::Literal(s) => s,
            SignaturePattern::Regex(re) => re.as_str(),
        }
    }
}

impl fmt::Display for SignaturePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignaturePattern::Literal(s) => write!(f, "{s}"),
            SignaturePattern::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

/// Identity of the daemon under control. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    name: String,
    signature: SignaturePattern,
    handle: String,
    registration: PathBuf,
    admin_url: Option<String>,
}

impl ServiceDescriptor {
    /// `handle` is the launchd label or systemd unit name; `registration` is
    /// where the boot-time registration lives (plist path or unit name).
    pub fn new(
        name: impl Into<String>,
        signature: SignaturePattern,
        handle: impl Into<String>,
        registration: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            signature,
            handle: handle.into(),
            registration: registration.into(),
            admin_url: None,
        }
    }

    /// Set the admin console URL
    pub fn admin_url(mut self, url: impl Into<String>) -> Self {
        self.admin_url = Some(url.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &SignaturePattern {
        &self.signature
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn registration(&self) -> &Path {
        &self.registration
    }

    pub fn admin_console(&self) -> Option<&str> {
        self.admin_url.as_deref()
    }
}
