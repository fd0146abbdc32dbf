//! Bootstrap env loading.
//!
//! File: `~/.registry-provisioner/.env` (standard dotenvy format)

use std::path::PathBuf;

use crate::settings::Settings;

/// Path to the provisioner-specific `.env` file.
pub fn provisioner_env_path() -> PathBuf {
    Settings::home_dir().join(".env")
}

/// Load env vars from `~/.registry-provisioner/.env`.
///
/// Call this **after** `dotenvy::dotenv()` so that `./.env` takes priority.
/// dotenvy never overwrites existing env vars, so the effective priority is:
///
///   explicit env vars > `./.env` > `~/.registry-provisioner/.env`
pub fn load_provisioner_env() {
    load_env_file(&provisioner_env_path());
}

fn load_env_file(path: &std::path::Path) {
    if path.exists()
        && let Err(e) = dotenvy::from_path(path)
    {
        tracing::warn!("Failed to load {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ENV_MUTEX;
    use tempfile::tempdir;

    #[test]
    fn env_path_is_under_provisioner_home() {
        let path = provisioner_env_path();
        assert!(path.to_string_lossy().contains(".registry-provisioner"));
        assert!(path.to_string_lossy().ends_with(".env"));
    }

    #[test]
    fn env_file_never_overrides_explicit_vars() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        std::fs::write(
            &env_path,
            "PROVISIONER_BOOTSTRAP_A=\"from-file#1\"\nPROVISIONER_BOOTSTRAP_B=file\n",
        )
        .unwrap();
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::remove_var("PROVISIONER_BOOTSTRAP_A");
            std::env::set_var("PROVISIONER_BOOTSTRAP_B", "explicit");
        }

        load_env_file(&env_path);

        assert_eq!(
            std::env::var("PROVISIONER_BOOTSTRAP_A").unwrap(),
            "from-file#1"
        );
        assert_eq!(std::env::var("PROVISIONER_BOOTSTRAP_B").unwrap(), "explicit");
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::remove_var("PROVISIONER_BOOTSTRAP_A");
            std::env::remove_var("PROVISIONER_BOOTSTRAP_B");
        }
    }

    #[test]
    fn missing_env_file_is_ignored() {
        let dir = tempdir().unwrap();
        load_env_file(&dir.path().join("absent.env"));
    }
}
