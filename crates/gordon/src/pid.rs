//! PID file management for the `reload` subcommand: `start` writes its PID
//! to the first writable location, `reload` reads it back from the same
//! search order and signals SIGUSR1.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

fn candidate_paths() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(tmpdir) = std::env::var_os("TMPDIR") {
        candidates.push(PathBuf::from(tmpdir).join("gordon.pid"));
    }
    candidates.push(PathBuf::from("/tmp/gordon.pid"));
    if let Some(home) = std::env::var_os("HOME") {
        candidates.push(PathBuf::from(home).join(".gordon.pid"));
    }

    candidates
}

/// Write the current process PID to the first location whose parent
/// directory is writable, deleting it again on drop via the returned guard.
pub fn write_pid_file() -> Result<PidFileGuard> {
    let pid = std::process::id();

    for path in candidate_paths() {
        if std::fs::write(&path, pid.to_string()).is_ok() {
            tracing::info!(path = %path.display(), pid, "wrote pid file");
            return Ok(PidFileGuard { path });
        }
    }

    bail!("no writable location for the pid file (tried $TMPDIR, /tmp, $HOME)")
}

pub struct PidFileGuard {
    path: PathBuf,
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Read the PID from whichever of the standard locations exists and send it
/// SIGUSR1, per `reload`'s contract.
pub fn signal_reload() -> Result<()> {
    let path = candidate_paths()
        .into_iter()
        .find(|p| p.exists())
        .context("no gordon.pid file found in $TMPDIR, /tmp, or $HOME; is gordon running?")?;

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read pid file: {}", path.display()))?;
    let pid: i32 = content
        .trim()
        .parse()
        .with_context(|| format!("malformed pid in {}", path.display()))?;

    #[cfg(unix)]
    {
        // SAFETY: kill(2) with a validated pid and a standard signal number,
        // no pointers involved.
        let result = unsafe { libc::kill(pid, libc::SIGUSR1) };
        if result != 0 {
            bail!(
                "failed to signal pid {pid} from {}: {}",
                path.display(),
                std::io::Error::last_os_error()
            );
        }
    }
    #[cfg(not(unix))]
    {
        bail!("reload is only supported on unix platforms");
    }

    tracing::info!(pid, path = %path.display(), "sent reload signal");
    Ok(())
}
