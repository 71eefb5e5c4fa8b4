//! launchd plist boot registration (`RunAtLoad`), rewritten atomically.
//!
//! The new plist is written to a temporary file in the same directory,
//! synced, then renamed over the original, so a failed write leaves the old
//! registration untouched. When the directory is not writable and the runner
//! elevates, the finished file is staged beside the target with `sudo -n cp`
//! and renamed into place with `sudo -n mv`.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use log::{info, warn};
use plist::{Dictionary, Value};
use tempfile::NamedTempFile;

use super::AutoStartFlag;
use super::command::{Runner, classify_failure};
use crate::error::ServiceError;

const RUN_AT_LOAD: &str = "RunAtLoad";

fn load_dictionary(path: &Path) -> Result<Dictionary, ServiceError> {
    let value = Value::from_file(path).map_err(|e| {
        let missing = e
            .as_io()
            .is_some_and(|io| io.kind() == io::ErrorKind::NotFound);
        let denied = e
            .as_io()
            .is_some_and(|io| io.kind() == io::ErrorKind::PermissionDenied);
        if missing {
            ServiceError::ManagerUnavailable(format!("no registration at {}", path.display()))
        } else if denied {
            ServiceError::PermissionDenied(format!("cannot read {}: {e}", path.display()))
        } else {
            ServiceError::Corrupt(format!("{}: {e}", path.display()))
        }
    })?;

    value.into_dictionary().ok_or_else(|| {
        ServiceError::Corrupt(format!("{} is not a plist dictionary", path.display()))
    })
}

fn run_at_load(dict: &Dictionary, path: &Path) -> Result<bool, ServiceError> {
    match dict.get(RUN_AT_LOAD) {
        None => Ok(false),
        Some(Value::Boolean(b)) => Ok(*b),
        Some(other) => Err(ServiceError::Corrupt(format!(
            "{}: {RUN_AT_LOAD} is {other:?}, expected a boolean",
            path.display()
        ))),
    }
}

/// Read `RunAtLoad` from the plist at `path`. Anything unreadable is
/// `Unknown`, never `Disabled`.
pub fn read_run_at_load(path: &Path) -> AutoStartFlag {
    match load_dictionary(path).and_then(|dict| run_at_load(&dict, path)) {
        Ok(enabled) => enabled.into(),
        Err(e) => {
            warn!("auto-start flag unreadable: {e}");
            AutoStartFlag::Unknown(e.to_string())
        }
    }
}

/// Set `RunAtLoad` in the plist at `path`, keeping every other key.
pub fn write_run_at_load(path: &Path, enabled: bool, runner: &Runner) -> Result<(), ServiceError> {
    let mut dict = load_dictionary(path)?;
    if run_at_load(&dict, path).ok() == Some(enabled) && dict.contains_key(RUN_AT_LOAD) {
        return Ok(());
    }
    dict.insert(RUN_AT_LOAD.to_string(), Value::Boolean(enabled));
    let value = Value::Dictionary(dict);

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    match NamedTempFile::new_in(dir) {
        Ok(tmp) => {
            persist_plist(tmp, &value, path)?;
        }
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied && runner.elevates() => {
            persist_elevated(&value, path, runner)?;
        }
        Err(e) => return Err(io_error(path, e)),
    }

    info!("{RUN_AT_LOAD}={enabled} written to {}", path.display());
    Ok(())
}

fn write_plist(tmp: &mut NamedTempFile, value: &Value) -> io::Result<()> {
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        plist::to_writer_xml(&mut writer, value).map_err(io::Error::other)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()
}

fn persist_plist(mut tmp: NamedTempFile, value: &Value, path: &Path) -> Result<(), ServiceError> {
    write_plist(&mut tmp, value).map_err(|e| io_error(path, e))?;

    // NamedTempFile is created 0600; keep the mode launchd expects
    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(tmp.path(), meta.permissions()).map_err(|e| io_error(path, e))?;
    }

    tmp.persist(path).map_err(|e| io_error(path, e.error))?;
    Ok(())
}

fn persist_elevated(value: &Value, path: &Path, runner: &Runner) -> Result<(), ServiceError> {
    let mut tmp = NamedTempFile::new().map_err(|e| io_error(path, e))?;
    write_plist(&mut tmp, value).map_err(|e| io_error(path, e))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ServiceError::Corrupt(format!("invalid plist path {}", path.display())))?;
    let staged = path.with_file_name(format!(".{file_name}.daemonctl-tmp"));
    let (src, staged_str, target) = match (tmp.path().to_str(), staged.to_str(), path.to_str()) {
        (Some(a), Some(b), Some(c)) => (a, b, c),
        _ => {
            return Err(ServiceError::Corrupt(format!(
                "non UTF-8 path for {}",
                path.display()
            )));
        }
    };

    let cp = runner.run("cp", &[src, staged_str])?;
    if !cp.success {
        return Err(classify_failure("cp", &cp));
    }
    let chmod = runner.run("chmod", &["644", staged_str])?;
    let mv = if chmod.success {
        runner.run("mv", &["-f", staged_str, target])?
    } else {
        chmod
    };
    if !mv.success {
        // the original registration was never touched
        discard_staged(runner, staged_str);
        return Err(classify_failure("mv", &mv));
    }
    Ok(())
}

/// Remove a staged copy left by a failed move. A leftover is logged, not
/// returned: the move failure is the error worth reporting.
fn discard_staged(runner: &Runner, staged: &str) -> bool {
    match runner.run("rm", &["-f", staged]) {
        Ok(out) if out.success => true,
        Ok(out) => {
            warn!("stale staged plist left at {staged}: {}", out.text().trim());
            false
        }
        Err(e) => {
            warn!("stale staged plist left at {staged}: {e}");
            false
        }
    }
}

fn io_error(path: &Path, e: io::Error) -> ServiceError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => {
            ServiceError::PermissionDenied(format!("cannot write {}: {e}", path.display()))
        }
        io::ErrorKind::NotFound => {
            ServiceError::ManagerUnavailable(format!("no registration at {}", path.display()))
        }
        _ => ServiceError::Corrupt(format!("failed to write {}: {e}", path.display())),
    }
}
