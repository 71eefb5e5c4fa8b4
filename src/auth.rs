//! Authorization gate for mutating operations.
//!
//! The gate asks a [`CredentialProvider`] for permission and caches a
//! session-scoped grant until it expires or is revoked. Acquisition holds the
//! gate's lock, so concurrent callers never trigger two prompts.

use std::fmt;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::control::is_root;
use crate::error::AuthError;

/// Operation that needs privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutatingAction {
    Start,
    Stop,
    SetAutoStart,
}

impl fmt::Display for MutatingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MutatingAction::Start => "start the service",
            MutatingAction::Stop => "stop the service",
            MutatingAction::SetAutoStart => "change auto-start",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketScope {
    /// Valid for the operation it was requested for only.
    Once,
    /// Reused by later operations until it expires.
    Session,
}

/// Proof that privilege was granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationTicket {
    id: u64,
    action: MutatingAction,
    scope: TicketScope,
    issued_at: Instant,
    expires_at: Instant,
}

impl AuthorizationTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Action the ticket was first granted for.
    pub fn action(&self) -> MutatingAction {
        self.action
    }

    pub fn scope(&self) -> TicketScope {
        self.scope
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// External credential source: a sudo prompt, an admin dialog, a uid check.
pub trait CredentialProvider: Send + Sync {
    /// Grant (with the scope of the grant), deny, or report cancellation.
    fn request(&self, action: MutatingAction) -> Result<TicketScope, AuthError>;
}

pub struct AuthorizationGate {
    provider: Box<dyn CredentialProvider>,
    clock: Arc<dyn Clock>,
    session_ttl: Duration,
    session: Mutex<Option<AuthorizationTicket>>,
    next_id: AtomicU64,
}

impl AuthorizationGate {
    pub fn new(
        provider: Box<dyn CredentialProvider>,
        clock: Arc<dyn Clock>,
        session_ttl: Duration,
    ) -> Self {
        Self {
            provider,
            clock,
            session_ttl,
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Return the cached session ticket, or prompt the provider for a new
    /// one. Denial and cancellation leave no trace.
    pub fn authorize(&self, action: MutatingAction) -> Result<AuthorizationTicket, AuthError> {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();

        if let Some(ticket) = session.as_ref() {
            if ticket.is_valid_at(now) {
                return Ok(ticket.clone());
            }
            info!("authorization session {} expired", ticket.id);
            *session = None;
        }

        let scope = self.provider.request(action).map_err(|e| {
            warn!("authorization to {action} refused: {e}");
            e
        })?;

        let ticket = AuthorizationTicket {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            action,
            scope,
            issued_at: now,
            expires_at: now + self.session_ttl,
        };
        info!("authorized to {action} (ticket {}, {scope:?})", ticket.id);
        if scope == TicketScope::Session {
            *session = Some(ticket.clone());
        }
        Ok(ticket)
    }

    /// Drop the cached session; the next mutation prompts again.
    pub fn revoke(&self) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ticket) = session.take() {
            info!("authorization session {} revoked", ticket.id);
        }
    }

    pub fn has_session(&self) -> bool {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session
            .as_ref()
            .is_some_and(|t| t.is_valid_at(self.clock.now()))
    }
}

/// Grants only when the process already runs as root.
#[derive(Debug, Default, Clone, Copy)]
pub struct RootProvider;

impl CredentialProvider for RootProvider {
    fn request(&self, _: MutatingAction) -> Result<TicketScope, AuthError> {
        if is_root() {
            Ok(TicketScope::Session)
        } else {
            Err(AuthError::Denied)
        }
    }
}

/// Always grants. For daemons the invoking user owns (user agents, user
/// systemd units).
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowProvider;

impl CredentialProvider for AllowProvider {
    fn request(&self, _: MutatingAction) -> Result<TicketScope, AuthError> {
        Ok(TicketScope::Session)
    }
}

/// Prompts on the terminal with `sudo -v`. A successful prompt refreshes
/// sudo's credential cache, which elevated manager commands (`sudo -n`) then
/// use.
#[derive(Debug, Default, Clone, Copy)]
pub struct SudoProvider;

impl CredentialProvider for SudoProvider {
    fn request(&self, action: MutatingAction) -> Result<TicketScope, AuthError> {
        if is_root() {
            return Ok(TicketScope::Session);
        }
        let sudo = which::which("sudo")
            .map_err(|e| AuthError::ProviderUnavailable(format!("sudo not found: {e}")))?;

        let status = Command::new(sudo)
            .arg("-v")
            .arg("-p")
            .arg(format!("[daemonctl] password for %u to {action}: "))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| AuthError::ProviderUnavailable(format!("failed to run sudo: {e}")))?;

        if status.success() {
            Ok(TicketScope::Session)
        } else {
            Err(AuthError::Denied)
        }
    }
}

/// Shows the macOS administrator dialog through `osascript`. Confirms an
/// administrator is present; manager commands still run with this
/// process's own privileges, so configuration pairs it with
/// `elevate = false` (a root process or a user-domain job).
#[derive(Debug, Default, Clone, Copy)]
pub struct OsascriptProvider;

impl OsascriptProvider {
    fn interpret(stdout: &str, stderr: &str) -> AuthError {
        if stderr.contains("User canceled")
            || stderr.contains("-128")
            || stdout.contains("User canceled")
        {
            AuthError::Cancelled
        } else {
            AuthError::Denied
        }
    }
}

impl CredentialProvider for OsascriptProvider {
    fn request(&self, action: MutatingAction) -> Result<TicketScope, AuthError> {
        let osascript = which::which("osascript")
            .map_err(|e| AuthError::ProviderUnavailable(format!("osascript not found: {e}")))?;

        let prompt = format!("daemonctl wants to {action}.").replace('"', "\\\"");
        let applescript = format!(
            r#"do shell script "/usr/bin/true" with prompt "{prompt}" with administrator privileges"#
        );
        let output = Command::new(osascript)
            .arg("-e")
            .arg(&applescript)
            .output()
            .map_err(|e| AuthError::ProviderUnavailable(format!("failed to run osascript: {e}")))?;

        if output.status.success() {
            Ok(TicketScope::Session)
        } else {
            Err(Self::interpret(
                &String::from_utf8_lossy(&output.stdout),
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }
}

/// Credential provider selected in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Root,
    Sudo,
    Osascript,
    Allow,
}

impl ProviderKind {
    pub fn provider(self) -> Box<dyn CredentialProvider> {
        match self {
            ProviderKind::Root => Box::new(RootProvider),
            ProviderKind::Sudo => Box::new(SudoProvider),
            ProviderKind::Osascript => Box::new(OsascriptProvider),
            ProviderKind::Allow => Box::new(AllowProvider),
        }
    }
}
