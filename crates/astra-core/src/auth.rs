// Session-token auth: a single salted sha256 hash in the store, mirrored by a
// plaintext token file under the data dir so local clients can bootstrap.

use std::path::{Path, PathBuf};

use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{AstraError, Result};
use crate::storage::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapStatus {
    Created,
    Updated,
    Ok,
}

impl BootstrapStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Ok => "ok",
        }
    }
}

pub fn hash_token(token: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn new_salt() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn new_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn token_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join("auth.token")
}

fn read_token_file(data_dir: &Path) -> Option<String> {
    let path = token_file_path(data_dir);
    let token = std::fs::read_to_string(path).ok()?;
    let token = token.trim().to_string();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

fn write_token_file(data_dir: &Path, token: &str) -> Result<()> {
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(token_file_path(data_dir), token)?;
    Ok(())
}

/// Make sure a session token exists on disk and its hash is in the store.
/// Returns the plaintext token for local display.
pub async fn ensure_session_token(store: &SqliteStore, data_dir: &Path) -> Result<String> {
    let token = match read_token_file(data_dir) {
        Some(token) => token,
        None => {
            let token = new_token();
            write_token_file(data_dir, &token)?;
            token
        }
    };

    match store.get_session_token_hash().await? {
        Some(stored) => {
            let expected = hash_token(&token, &stored.salt);
            if expected != stored.token_hash {
                let salt = new_salt();
                store.set_session_token_hash(&hash_token(&token, &salt), &salt).await?;
            }
        }
        None => {
            let salt = new_salt();
            store.set_session_token_hash(&hash_token(&token, &salt), &salt).await?;
        }
    }
    Ok(token)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    TokenNotInitialized,
    BadScheme,
    MissingAuthorization,
    InvalidToken,
}

impl AuthFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TokenNotInitialized => "token_not_initialized",
            Self::BadScheme => "bad_scheme",
            Self::MissingAuthorization => "missing_authorization",
            Self::InvalidToken => "invalid_token",
        }
    }
}

/// Validate a presented bearer token against the stored hash.
pub async fn verify_token(
    store: &SqliteStore,
    token: Option<&str>,
    bad_scheme: bool,
) -> std::result::Result<(), AuthFailure> {
    let stored = match store.get_session_token_hash().await {
        Ok(Some(stored)) => stored,
        Ok(None) => return Err(AuthFailure::TokenNotInitialized),
        Err(_) => return Err(AuthFailure::TokenNotInitialized),
    };
    let Some(token) = token else {
        return Err(if bad_scheme {
            AuthFailure::BadScheme
        } else {
            AuthFailure::MissingAuthorization
        });
    };
    if hash_token(token, &stored.salt) != stored.token_hash {
        return Err(AuthFailure::InvalidToken);
    }
    Ok(())
}

/// Bootstrap the session token. Conflicts with an existing, different on-disk
/// token; otherwise idempotent.
pub async fn bootstrap_token(
    store: &SqliteStore,
    data_dir: &Path,
    token: &str,
) -> Result<BootstrapStatus> {
    let file_token = read_token_file(data_dir);
    if let Some(existing) = &file_token {
        if existing != token {
            return Err(AstraError::Conflict("token already installed".to_string()));
        }
    }

    match store.get_session_token_hash().await? {
        Some(stored) => {
            if hash_token(token, &stored.salt) == stored.token_hash {
                if file_token.is_none() {
                    write_token_file(data_dir, token)?;
                }
                Ok(BootstrapStatus::Ok)
            } else {
                let salt = new_salt();
                store.set_session_token_hash(&hash_token(token, &salt), &salt).await?;
                write_token_file(data_dir, token)?;
                Ok(BootstrapStatus::Updated)
            }
        }
        None => {
            let salt = new_salt();
            store.set_session_token_hash(&hash_token(token, &salt), &salt).await?;
            write_token_file(data_dir, token)?;
            Ok(BootstrapStatus::Created)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn bootstrap_same_token_twice_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open_in_memory(4000).unwrap();

        let first = bootstrap_token(&store, dir.path(), "secret-token").await.unwrap();
        assert_eq!(first, BootstrapStatus::Created);

        let hash_before = store.get_session_token_hash().await.unwrap().unwrap();
        let second = bootstrap_token(&store, dir.path(), "secret-token").await.unwrap();
        assert_eq!(second, BootstrapStatus::Ok);
        let hash_after = store.get_session_token_hash().await.unwrap().unwrap();
        assert_eq!(hash_before.token_hash, hash_after.token_hash);
    }

    #[tokio::test]
    async fn bootstrap_conflicting_token_is_rejected() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open_in_memory(4000).unwrap();
        bootstrap_token(&store, dir.path(), "first").await.unwrap();

        let err = bootstrap_token(&store, dir.path(), "second").await.unwrap_err();
        assert!(matches!(err, AstraError::Conflict(_)));
    }

    #[tokio::test]
    async fn verify_rejects_bad_and_missing_tokens() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open_in_memory(4000).unwrap();

        assert_eq!(
            verify_token(&store, Some("any"), false).await.unwrap_err(),
            AuthFailure::TokenNotInitialized
        );

        let token = ensure_session_token(&store, dir.path()).await.unwrap();
        assert!(verify_token(&store, Some(&token), false).await.is_ok());
        assert_eq!(
            verify_token(&store, Some("wrong"), false).await.unwrap_err(),
            AuthFailure::InvalidToken
        );
        assert_eq!(
            verify_token(&store, None, true).await.unwrap_err(),
            AuthFailure::BadScheme
        );
        assert_eq!(
            verify_token(&store, None, false).await.unwrap_err(),
            AuthFailure::MissingAuthorization
        );
    }

    #[tokio::test]
    async fn ensure_session_token_heals_hash_mismatch() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open_in_memory(4000).unwrap();
        let token = ensure_session_token(&store, dir.path()).await.unwrap();

        // Corrupt the stored hash; a restart should re-derive it from the file.
        store.set_session_token_hash("bogus", "bogus-salt").await.unwrap();
        let token_again = ensure_session_token(&store, dir.path()).await.unwrap();
        assert_eq!(token, token_again);
        assert!(verify_token(&store, Some(&token), false).await.is_ok());
    }
}
