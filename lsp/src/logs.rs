use std::io;
use std::path::Path;
use std::path::PathBuf;

use sysinfo::Pid;
use sysinfo::System;
use tracing::debug;

pub const LOGS_DIR: &str = "lsp_logs";

/// `lsp_logs/<kind>_<language>_<pid>.log` under `conf_dir`, creating the
/// directory on first use.
pub fn log_file(conf_dir: &Path, kind: &str, language: &str, pid: u32) -> io::Result<PathBuf> {
    let dir = conf_dir.join(LOGS_DIR);
    std::fs::create_dir_all(&dir)?;
    Ok(dir.join(format!("{kind}_{language}_{pid}.log")))
}

fn log_pid(path: &Path) -> Option<u32> {
    if path.extension()? != "log" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (_, pid) = stem.rsplit_once('_')?;
    pid.parse().ok()
}

/// Removes log files left behind by processes that are gone. Returns how
/// many were deleted.
pub fn cleanup_stale_logs(conf_dir: &Path) -> io::Result<usize> {
    let dir = conf_dir.join(LOGS_DIR);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };

    let mut system = System::new();
    system.refresh_processes();
    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        let Some(pid) = log_pid(&path) else {
            continue;
        };
        if system.process(Pid::from_u32(pid)).is_some() {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) => debug!("could not remove {}: {err}", path.display()),
        }
    }
    Ok(removed)
}
