//! Client signing key
//!
//! The key lives at a fixed per-user location (`~/.portr/keys/id_rsa`
//! unless the config overrides it). A missing or unreadable key means the
//! local setup is incomplete, which is fatal for the session.

use std::path::Path;

use russh_keys::key::KeyPair;

use crate::error::CredentialError;

/// Load and parse the private key used to authenticate with the tunnel server
pub fn load_signing_identity(path: &Path) -> Result<KeyPair, CredentialError> {
    if !path.exists() {
        tracing::debug!("Private key missing at {:?}, local setup is incomplete", path);
        return Err(CredentialError::NotFound {
            path: path.to_path_buf(),
        });
    }

    let key = russh_keys::load_secret_key(path, None).map_err(|source| {
        tracing::debug!("Failed to parse private key at {:?}: {}", path, source);
        CredentialError::Unparseable {
            path: path.to_path_buf(),
            source,
        }
    })?;

    tracing::debug!("Loaded signing key from {:?}", path);
    Ok(key)
}
