// Astra Vault - passphrase-based encryption for the secret map
//
// Layout of vault.bin:
// 1. On first write, derive an encryption key from the passphrase via Argon2id
// 2. The plaintext is a JSON map of named secrets
// 3. Store: version + salt + nonce + ciphertext, serialized as JSON
// 4. Every write re-encrypts the whole map with a fresh nonce

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{password_hash::SaltString, Argon2, PasswordHasher};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{AstraError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultFile {
    pub version: u8,
    /// Argon2 salt (b64 string form)
    pub salt: String,
    /// AES-GCM nonce (12 bytes, base64)
    pub nonce: String,
    /// Encrypted JSON secret map (base64)
    pub ciphertext: String,
}

fn derive_key(passphrase: &str, salt: &SaltString) -> Result<[u8; 32]> {
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(passphrase.as_bytes(), salt)
        .map_err(|e| AstraError::Vault(format!("failed to hash passphrase: {}", e)))?;
    let hash_output = password_hash
        .hash
        .ok_or_else(|| AstraError::Vault("no hash output".to_string()))?;
    hash_output
        .as_bytes()
        .try_into()
        .map_err(|_| AstraError::Vault("invalid key length".to_string()))
}

fn encrypt_map(passphrase: &str, secrets: &BTreeMap<String, String>) -> Result<VaultFile> {
    use base64::Engine;

    let salt = SaltString::generate(&mut OsRng);
    let key = derive_key(passphrase, &salt)?;

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| AstraError::Vault(format!("failed to create cipher: {}", e)))?;
    let plaintext = serde_json::to_vec(secrets)?;
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_slice())
        .map_err(|e| AstraError::Vault(format!("failed to encrypt secrets: {}", e)))?;

    Ok(VaultFile {
        version: 1,
        salt: salt.to_string(),
        nonce: base64::engine::general_purpose::STANDARD.encode(nonce_bytes),
        ciphertext: base64::engine::general_purpose::STANDARD.encode(ciphertext),
    })
}

fn decrypt_map(file: &VaultFile, passphrase: &str) -> Result<BTreeMap<String, String>> {
    use base64::Engine;

    let salt = SaltString::from_b64(&file.salt)
        .map_err(|e| AstraError::Vault(format!("invalid salt: {}", e)))?;
    let key = derive_key(passphrase, &salt)?;

    let nonce_bytes = base64::engine::general_purpose::STANDARD
        .decode(&file.nonce)
        .map_err(|e| AstraError::Vault(format!("invalid nonce: {}", e)))?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = base64::engine::general_purpose::STANDARD
        .decode(&file.ciphertext)
        .map_err(|e| AstraError::Vault(format!("invalid ciphertext: {}", e)))?;

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| AstraError::Vault(format!("failed to create cipher: {}", e)))?;
    let plaintext = cipher
        .decrypt(nonce, ciphertext.as_slice())
        .map_err(|_| AstraError::Vault("invalid passphrase".to_string()))?;

    serde_json::from_slice(&plaintext).map_err(Into::into)
}

fn load_file(path: &Path) -> Result<Option<VaultFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let file = serde_json::from_str(&raw)
        .map_err(|e| AstraError::Vault(format!("failed to parse vault file: {}", e)))?;
    Ok(Some(file))
}

fn save_file(path: &Path, file: &VaultFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(file)?)?;
    Ok(())
}

/// Store a named secret, creating the vault on first use.
pub fn set_secret(path: &Path, passphrase: &str, key: &str, value: &str) -> Result<()> {
    let mut secrets = match load_file(path)? {
        Some(file) => decrypt_map(&file, passphrase)?,
        None => BTreeMap::new(),
    };
    secrets.insert(key.to_string(), value.to_string());
    save_file(path, &encrypt_map(passphrase, &secrets)?)
}

pub fn get_secret(path: &Path, passphrase: &str, key: &str) -> Result<Option<String>> {
    match load_file(path)? {
        Some(file) => Ok(decrypt_map(&file, passphrase)?.get(key).cloned()),
        None => Ok(None),
    }
}

/// Env var of the same name wins over the vault (temporary overrides).
pub fn resolve_secret(path: &Path, passphrase: Option<&str>, key: &str) -> Option<String> {
    if let Ok(value) = std::env::var(key) {
        if !value.trim().is_empty() {
            return Some(value);
        }
    }
    let passphrase = passphrase?;
    get_secret(path, passphrase, key).ok().flatten()
}

pub fn vault_exists(path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn secret_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.bin");

        set_secret(&path, "correct horse", "OPENAI_API_KEY", "sk-unit-test").unwrap();
        let value = get_secret(&path, "correct horse", "OPENAI_API_KEY").unwrap();
        assert_eq!(value.as_deref(), Some("sk-unit-test"));

        assert_eq!(get_secret(&path, "correct horse", "MISSING").unwrap(), None);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.bin");
        set_secret(&path, "correct horse", "KEY", "value").unwrap();
        assert!(get_secret(&path, "battery staple", "KEY").is_err());
    }

    #[test]
    fn multiple_secrets_survive_rewrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.bin");
        set_secret(&path, "p", "A", "1").unwrap();
        set_secret(&path, "p", "B", "2").unwrap();
        assert_eq!(get_secret(&path, "p", "A").unwrap().as_deref(), Some("1"));
        assert_eq!(get_secret(&path, "p", "B").unwrap().as_deref(), Some("2"));
    }
}
