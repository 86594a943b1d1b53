use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Names the file [`load_env_file`] reads instead of `.env`.
pub const ENV_FILE_VAR: &str = "DEBUG_TRACE_ENV_FILE";

/// Loads trace settings from an env file into the process environment and
/// returns the file that was read.
///
/// Variables that are already set win over the file. A missing `.env` is
/// silently skipped; a missing file named by [`ENV_FILE_VAR`] is reported.
pub fn load_env_file() -> Option<PathBuf> {
    let explicit = std::env::var_os(ENV_FILE_VAR).map(PathBuf::from);
    load_from(explicit.as_deref())
}

fn load_from(explicit: Option<&Path>) -> Option<PathBuf> {
    let loaded = match explicit {
        Some(path) => dotenvy::from_path(path).map(|()| path.to_path_buf()),
        None => dotenvy::dotenv(),
    };
    match loaded {
        Ok(path) => {
            debug!(path = %path.display(), "loaded trace settings from env file");
            Some(path)
        }
        Err(e) if explicit.is_none() && e.not_found() => None,
        Err(e) => {
            warn!("unable to load env file: {e}");
            None
        }
    }
}
