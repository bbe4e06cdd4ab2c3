//! Copying files written inside a VM back to the host.
//!
//! Files under the working directory that are newer than a marker touched
//! before the run are listed in the VM, read as base64 and written to the
//! identical host path.

use super::backend::{VmCommand, VmHandle};
use crate::error::{SandboxError, SandboxResult};
use crate::shell_quote;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Directories never copied back.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "__pycache__"];

/// Result of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub copied: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Path of a fresh sync marker inside the VM.
pub fn marker_path() -> String {
    format!("/tmp/.agentbox-sync-{}", uuid::Uuid::new_v4().simple())
}

/// Touch `marker` in the VM. Files newer than it are synced later.
pub async fn touch_marker(handle: &dyn VmHandle, marker: &str) -> SandboxResult<()> {
    let mut command = VmCommand::new(format!("touch {}", shell_quote(marker)));
    command.timeout = Some(SYNC_TIMEOUT);
    let result = handle.exec(command).await;
    if !result.success() {
        return Err(SandboxError::exec_failed(format!(
            "failed to create sync marker: {}",
            result.stderr.trim()
        )));
    }
    Ok(())
}

fn list_command(work_dir: &Path, marker: &str) -> String {
    let mut line = format!(
        "find {} -type f -newer {}",
        shell_quote(&work_dir.to_string_lossy()),
        shell_quote(marker)
    );
    for dir in SKIPPED_DIRS {
        line.push_str(&format!(" -not -path {}", shell_quote(&format!("*/{}/*", dir))));
    }
    line
}

/// Copy every file under `work_dir` modified after `marker` to the host.
///
/// Per-file failures are logged and recorded in the report. The marker is
/// removed afterwards.
pub async fn sync_back(handle: &dyn VmHandle, work_dir: &Path, marker: &str) -> SyncReport {
    let mut report = SyncReport::default();

    let mut list = VmCommand::new(list_command(work_dir, marker));
    list.timeout = Some(SYNC_TIMEOUT);
    let listed = handle.exec(list).await;
    if !listed.success() {
        warn!(
            vm = handle.id(),
            error = %listed.stderr.trim(),
            "Failed to list modified files"
        );
    } else {
        for line in listed.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let path = PathBuf::from(line);
            match copy_file(handle, work_dir, &path).await {
                Ok(()) => report.copied.push(path),
                Err(e) => {
                    warn!(vm = handle.id(), error = %e, "Skipping file sync");
                    report.failed.push(path);
                }
            }
        }
    }

    let mut cleanup = VmCommand::new(format!("rm -f {}", shell_quote(marker)));
    cleanup.timeout = Some(SYNC_TIMEOUT);
    let removed = handle.exec(cleanup).await;
    if !removed.success() {
        debug!(vm = handle.id(), marker, "Failed to remove sync marker");
    }

    if !report.copied.is_empty() || !report.failed.is_empty() {
        info!(
            vm = handle.id(),
            copied = report.copied.len(),
            failed = report.failed.len(),
            "Synced files back to host"
        );
    }
    report
}

async fn copy_file(handle: &dyn VmHandle, work_dir: &Path, path: &Path) -> SandboxResult<()> {
    let sync_error = |message: String| SandboxError::SyncFailed {
        path: path.to_path_buf(),
        message,
    };

    if !path.is_absolute() || !path.starts_with(work_dir) {
        return Err(sync_error("outside the working directory".to_string()));
    }
    if path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(sync_error("path contains '..'".to_string()));
    }

    let mut read = VmCommand::new(format!("base64 {}", shell_quote(&path.to_string_lossy())));
    read.timeout = Some(SYNC_TIMEOUT);
    let output = handle.exec(read).await;
    if !output.success() {
        return Err(sync_error(output.stderr.trim().to_string()));
    }

    let encoded: String = output.stdout.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| sync_error(format!("invalid base64: {}", e)))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| sync_error(e.to_string()))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| sync_error(e.to_string()))?;
    debug!(path = %path.display(), "Synced file");
    Ok(())
}
