//! Path utilities for shared regions.

use std::path::{Path, PathBuf};

/// Default region filename.
pub const REGION_FILENAME: &str = "shmtask.region";

/// Environment variable that overrides the default region path.
pub const REGION_ENV: &str = "SHMTASK_REGION";

/// Directory backed by tmpfs on Linux; files there never touch disk.
const SHM_DIR: &str = "/dev/shm";

/// Get the default region path.
///
/// Checked in order:
/// - `$SHMTASK_REGION`
/// - `/dev/shm/shmtask.region` when `/dev/shm` exists
/// - the user runtime directory (`$XDG_RUNTIME_DIR` on Linux)
/// - the system temp directory
pub fn default_region_path() -> PathBuf {
    if let Some(path) = std::env::var_os(REGION_ENV).filter(|p| !p.is_empty()) {
        return expand_tilde(PathBuf::from(path));
    }
    region_path_in(&region_dir())
}

fn region_dir() -> PathBuf {
    let shm = Path::new(SHM_DIR);
    if shm.is_dir() {
        return shm.to_path_buf();
    }
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

/// The region file inside `dir`.
pub fn region_path_in<P: AsRef<Path>>(dir: P) -> PathBuf {
    dir.as_ref().join(REGION_FILENAME)
}

/// A region path unique to this process, for short-lived private queues.
pub fn private_region_path() -> PathBuf {
    region_dir().join(format!("shmtask-{}.region", std::process::id()))
}

/// Expands a leading `~` in a path to the user's home directory.
///
/// This handles the common case where shell tilde expansion doesn't occur,
/// such as when using `--region=~/q.region` syntax instead of `--region ~/q.region`.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use shmtask::paths::expand_tilde;
///
/// let path = PathBuf::from("/tmp/foo");
/// assert_eq!(expand_tilde(&path), path);
/// ```
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if let Ok(stripped) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_region_path_file_name() {
        if std::env::var_os(REGION_ENV).is_some() {
            return;
        }
        let path = default_region_path();
        assert_eq!(path.file_name().unwrap(), REGION_FILENAME);
    }

    #[test]
    fn test_region_path_in_dir() {
        assert_eq!(
            region_path_in("/run/user/1000"),
            PathBuf::from("/run/user/1000/shmtask.region")
        );
    }

    #[test]
    fn test_private_region_path_is_per_process() {
        let path = private_region_path();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.contains(&std::process::id().to_string()));
        assert_ne!(path, default_region_path());
    }

    #[test]
    fn test_expand_tilde_with_home() {
        let path = PathBuf::from("~/queues/test.region");
        let expanded = expand_tilde(&path);
        assert!(!expanded.to_str().unwrap().starts_with("~"));
        assert!(expanded.to_str().unwrap().ends_with("queues/test.region"));
    }

    #[test]
    fn test_expand_tilde_absolute_path_unchanged() {
        let path = PathBuf::from("/dev/shm/q.region");
        assert_eq!(expand_tilde(&path), path);
    }

    #[test]
    fn test_expand_tilde_relative_path_unchanged() {
        let path = PathBuf::from("./relative/q.region");
        assert_eq!(expand_tilde(&path), path);
    }
}
