//! Encrypted configuration store.
//!
//! Values are AES-256-GCM encrypted with a key derived from the process
//! master secret via scrypt over a fixed salt. Records persist as
//! `iv:tag:ciphertext` in colon-delimited hex inside `config.json`.

use crate::state::JsonState;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use overseer_core::{Error, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::warn;

const FIXED_SALT: &[u8] = b"overseer-config-kdf-v1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    /// `iv:tag:ciphertext`, each part hex.
    pub value: String,
    pub category: String,
    pub description: String,
    pub masked: bool,
    pub updated_at: DateTime<Utc>,
}

/// Listing view: value replaced by a masked preview.
#[derive(Clone, Debug, Serialize)]
pub struct MaskedEntry {
    pub key: String,
    pub category: String,
    pub description: String,
    pub masked: bool,
    pub updated_at: DateTime<Utc>,
    pub preview: String,
}

pub struct ConfigStore {
    state: JsonState,
    cipher: Aes256Gcm,
    entries: RwLock<Vec<ConfigEntry>>,
}

fn derive_key(master: &str) -> Result<[u8; 32]> {
    // scrypt N=2^14, r=8, p=1 — interactive-latency parameters.
    let params = scrypt::Params::new(14, 8, 1, 32)
        .map_err(|e| Error::Fatal(format!("invalid scrypt params: {}", e)))?;
    let mut key = [0u8; 32];
    scrypt::scrypt(master.as_bytes(), FIXED_SALT, &params, &mut key)
        .map_err(|e| Error::Fatal(format!("key derivation failed: {}", e)))?;
    Ok(key)
}

fn mask(plaintext: &str) -> String {
    if plaintext.len() <= 4 {
        return "****".to_string();
    }
    let head: String = plaintext.chars().take(2).collect();
    let tail: String = plaintext
        .chars()
        .rev()
        .take(2)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{}****{}", head, tail)
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>, master_secret: &str) -> Result<Self> {
        let key = derive_key(master_secret)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| Error::Fatal(format!("cipher init failed: {}", e)))?;
        let state = JsonState::new(path);
        let entries: Vec<ConfigEntry> = state.load_or_default();
        Ok(Self {
            state,
            cipher,
            entries: RwLock::new(entries),
        })
    }

    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut iv = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| Error::Fatal("encryption failed".into()))?;
        // aes-gcm appends the tag to the ciphertext; the record keeps it separate.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(ciphertext)
        ))
    }

    fn decrypt(&self, stored: &str) -> Result<String> {
        let parts: Vec<&str> = stored.split(':').collect();
        if parts.len() != 3 {
            return Err(Error::Fatal("malformed encrypted record".into()));
        }
        let iv = hex::decode(parts[0]).map_err(|_| Error::Fatal("bad iv hex".into()))?;
        let tag = hex::decode(parts[1]).map_err(|_| Error::Fatal("bad tag hex".into()))?;
        let ciphertext = hex::decode(parts[2]).map_err(|_| Error::Fatal("bad ciphertext hex".into()))?;
        if iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(Error::Fatal("malformed encrypted record".into()));
        }

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_ref())
            .map_err(|_| Error::unauthorized("decryption failed: wrong master secret or tampered record"))?;
        String::from_utf8(plain).map_err(|_| Error::Fatal("decrypted value not utf-8".into()))
    }

    pub async fn set(
        &self,
        key: &str,
        plaintext: &str,
        category: &str,
        description: &str,
        masked: bool,
    ) -> Result<()> {
        let value = self.encrypt(plaintext)?;
        let mut entries = self.entries.write().await;
        let entry = ConfigEntry {
            key: key.to_string(),
            value,
            category: category.to_string(),
            description: description.to_string(),
            masked,
            updated_at: Utc::now(),
        };
        match entries.iter_mut().find(|e| e.key == key) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        if let Err(e) = self.state.save(&entries.to_vec()) {
            warn!(error = %e, "failed to persist config");
        }
        Ok(())
    }

    /// Decrypted value, for internal consumers only.
    pub async fn get(&self, key: &str) -> Result<String> {
        let entries = self.entries.read().await;
        let entry = entries
            .iter()
            .find(|e| e.key == key)
            .ok_or_else(|| Error::not_found("config entry", key))?;
        self.decrypt(&entry.value)
    }

    /// Listing with masked previews; plaintext never leaves for masked keys.
    pub async fn list(&self) -> Vec<MaskedEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|e| {
                let preview = match self.decrypt(&e.value) {
                    Ok(plain) if e.masked => mask(&plain),
                    Ok(plain) => plain,
                    Err(_) => "<undecryptable>".to_string(),
                };
                MaskedEntry {
                    key: e.key.clone(),
                    category: e.category.clone(),
                    description: e.description.clone(),
                    masked: e.masked,
                    updated_at: e.updated_at,
                    preview,
                }
            })
            .collect()
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let idx = entries
            .iter()
            .position(|e| e.key == key)
            .ok_or_else(|| Error::not_found("config entry", key))?;
        entries.remove(idx);
        if let Err(e) = self.state.save(&entries.to_vec()) {
            warn!(error = %e, "failed to persist config");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir, secret: &str) -> ConfigStore {
        ConfigStore::open(dir.path().join("config.json"), secret).unwrap()
    }

    #[tokio::test]
    async fn set_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, "master");
        store
            .set("api_key", "sk-12345-secret", "providers", "LLM key", true)
            .await
            .unwrap();
        assert_eq!(store.get("api_key").await.unwrap(), "sk-12345-secret");
    }

    #[tokio::test]
    async fn persisted_value_is_not_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, "master");
        store
            .set("api_key", "very-secret-value", "providers", "", true)
            .await
            .unwrap();
        let raw = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
        assert!(!raw.contains("very-secret-value"));
        // iv:tag:ciphertext shape
        let entries: Vec<ConfigEntry> = serde_json::from_str(&raw).unwrap();
        assert_eq!(entries[0].value.split(':').count(), 3);
    }

    #[tokio::test]
    async fn survives_reopen_with_same_secret() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(&dir, "master");
            store.set("k", "v-123", "c", "", false).await.unwrap();
        }
        let store = open(&dir, "master");
        assert_eq!(store.get("k").await.unwrap(), "v-123");
    }

    #[tokio::test]
    async fn wrong_secret_fails_decryption() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(&dir, "master");
            store.set("k", "v", "c", "", false).await.unwrap();
        }
        let store = open(&dir, "other-secret");
        let err = store.get("k").await.unwrap_err();
        assert_eq!(err.kind(), overseer_core::ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn masked_listing_shows_preview_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, "master");
        store
            .set("token", "abcdefgh", "auth", "service token", true)
            .await
            .unwrap();
        let list = store.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].preview, "ab****gh");
    }

    #[tokio::test]
    async fn short_values_fully_masked() {
        assert_eq!(mask("abc"), "****");
        assert_eq!(mask("abcde"), "ab****de");
    }

    #[tokio::test]
    async fn set_overwrites_existing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, "master");
        store.set("k", "first", "c", "", false).await.unwrap();
        store.set("k", "second", "c", "", false).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), "second");
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, "master");
        store.set("k", "v", "c", "", false).await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.is_err());
    }
}
