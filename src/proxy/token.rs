//! Persistent proxy security token.
//!
//! The token is generated once per install and stored with owner-only
//! permissions. Clients must present it in the `Winscope-Token` header.

use std::fs::{self, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use rand::RngCore;
use tracing::{debug, error};

/// Number of random bytes in a freshly generated token
pub(crate) const TOKEN_BYTES: usize = 32;

/// Return the saved proxy security token, creating and saving a new one if
/// none can be read.
///
/// Failing to persist a new token is logged but not fatal: the proxy keeps
/// running with the in-memory token until the next restart.
pub fn load_or_create_token(path: &Path) -> String {
    match read_token(path) {
        Ok(token) => {
            debug!("Loaded token {} from {}", token, path.display());
            token
        }
        Err(_) => {
            let token = generate_token();
            match save_token(path, &token) {
                Ok(()) => debug!("Created and saved token {} to {}", token, path.display()),
                Err(e) => error!(
                    "Unable to save persistent token {} to {}: {}",
                    token,
                    path.display(),
                    e
                ),
            }
            token
        }
    }
}

fn read_token(path: &Path) -> std::io::Result<String> {
    let contents = fs::read_to_string(path)?;
    let token = contents.lines().next().unwrap_or_default().trim_end();
    if token.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "empty token file",
        ));
    }
    Ok(token.to_string())
}

/// Generate a new hex encoded token from [`TOKEN_BYTES`] random bytes.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn save_token(path: &Path, token: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut options = OpenOptions::new();
    options.truncate(true).write(true).create(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(token.as_bytes())?;
    file.flush()?;

    // mode() only applies on creation, tighten a pre-existing file as well
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_token_is_hex_of_expected_length() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generated_tokens_differ() {
        assert_ne!(generate_token(), generate_token());
    }

    #[test]
    fn test_creates_token_and_reloads_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(".token");

        let created = load_or_create_token(&path);
        assert!(path.exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), created);

        let reloaded = load_or_create_token(&path);
        assert_eq!(created, reloaded);
    }

    #[cfg(unix)]
    #[test]
    fn test_token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".token");
        load_or_create_token(&path);

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_reads_first_line_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".token");
        fs::write(&path, "abc123\nignored\n").unwrap();

        assert_eq!(load_or_create_token(&path), "abc123");
    }

    #[test]
    fn test_empty_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".token");
        fs::write(&path, "").unwrap();

        let token = load_or_create_token(&path);
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert_eq!(fs::read_to_string(&path).unwrap(), token);
    }
}
