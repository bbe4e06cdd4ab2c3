//! Locating host binaries that providers shell out to.

use std::path::{Path, PathBuf};

/// Search `PATH` for an executable named `name`.
pub fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// Resolve a binary in this order: `PATH`, each of `extra_dirs`, then the
/// path named by the environment variable `env_var`.
///
/// Returns the first candidate that exists and is executable.
pub fn find_binary(name: &str, extra_dirs: &[PathBuf], env_var: Option<&str>) -> Option<PathBuf> {
    if let Some(found) = find_on_path(name) {
        return Some(found);
    }

    if let Some(found) = extra_dirs
        .iter()
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
    {
        return Some(found);
    }

    env_var
        .and_then(std::env::var_os)
        .map(PathBuf::from)
        .filter(|candidate| is_executable(candidate))
}

/// Well-known install directories for user-level tooling.
pub fn well_known_dirs() -> Vec<PathBuf> {
    let mut dirs_out = vec![
        PathBuf::from("/usr/local/bin"),
        PathBuf::from("/opt/homebrew/bin"),
    ];
    if let Some(home) = dirs::home_dir() {
        dirs_out.push(home.join(".local").join("bin"));
        dirs_out.push(home.join(".npm-global").join("bin"));
        dirs_out.push(home.join(".cargo").join("bin"));
    }
    dirs_out
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
