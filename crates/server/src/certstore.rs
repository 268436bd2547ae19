//! Typed access to the gateway's TLS material.
//!
//! Certificates and keys live behind a [`Keyring`] scoped to the device's
//! protected store; entries are PEM blobs under fixed labels, plus the raw
//! P12 bundles needed to regenerate onboarding packages. Imports replace
//! prior entries with the same label; a custom server identity takes
//! precedence over the bundled one.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Password embedded for the bundled onboarding certificates.
pub const BUNDLE_PASSWORD: &str = "meshtastic";

const LABEL_SERVER_IDENTITY_BUNDLED: &str = "server-identity-bundled";
const LABEL_SERVER_IDENTITY_CUSTOM: &str = "server-identity-custom";
const LABEL_CLIENT_CA: &str = "client-ca";
const LABEL_SERVER_P12: &str = "server-p12";
const LABEL_CLIENT_P12: &str = "client-p12";

#[derive(Debug, Error)]
pub enum CertStoreError {
    #[error("certificate import failed: {0}")]
    ImportFailed(String),

    #[error("bundle contains no identity (certificate plus private key)")]
    NoIdentityInBundle,

    #[error("invalid certificate")]
    InvalidCertificate,

    #[error("invalid PEM")]
    InvalidPem,

    #[error("keyring error: {0}")]
    Keyring(String),
}

/// Minimal surface of the device keyring. Real deployments back this with
/// the platform keystore (available after first unlock); tests and the demo
/// gateway use [`MemoryKeyring`].
pub trait Keyring: Send + Sync {
    fn get(&self, label: &str) -> Result<Option<Vec<u8>>, CertStoreError>;
    fn put(&self, label: &str, value: &[u8]) -> Result<(), CertStoreError>;
    fn delete(&self, label: &str) -> Result<(), CertStoreError>;
}

#[derive(Default)]
pub struct MemoryKeyring {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl Keyring for MemoryKeyring {
    fn get(&self, label: &str) -> Result<Option<Vec<u8>>, CertStoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| CertStoreError::Keyring(e.to_string()))?;
        Ok(entries.get(label).cloned())
    }

    fn put(&self, label: &str, value: &[u8]) -> Result<(), CertStoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| CertStoreError::Keyring(e.to_string()))?;
        entries.insert(label.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, label: &str) -> Result<(), CertStoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| CertStoreError::Keyring(e.to_string()))?;
        entries.remove(label);
        Ok(())
    }
}

/// A server identity ready for the TLS stack.
pub struct Identity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

pub struct CertStore<K: Keyring> {
    keyring: K,
}

impl<K: Keyring> CertStore<K> {
    pub fn new(keyring: K) -> Self {
        Self { keyring }
    }

    /// Import a PEM bundle (certificate chain plus private key) as the
    /// custom server identity.
    pub fn import_server_identity(&self, pem: &[u8]) -> Result<(), CertStoreError> {
        parse_identity(pem)?;
        self.keyring
            .put(LABEL_SERVER_IDENTITY_CUSTOM, pem)
            .map_err(import_failed)
    }

    /// Install the identity that ships with the app; used when no custom
    /// identity has been imported.
    pub fn install_bundled_identity(&self, pem: &[u8]) -> Result<(), CertStoreError> {
        parse_identity(pem)?;
        self.keyring
            .put(LABEL_SERVER_IDENTITY_BUNDLED, pem)
            .map_err(import_failed)
    }

    pub fn remove_custom_identity(&self) -> Result<(), CertStoreError> {
        self.keyring.delete(LABEL_SERVER_IDENTITY_CUSTOM)
    }

    /// Import the CA certificates client connections must chain to.
    pub fn import_client_ca(&self, pem: &[u8]) -> Result<usize, CertStoreError> {
        let count = parse_certs(pem)?.len();
        if count == 0 {
            return Err(CertStoreError::InvalidCertificate);
        }
        self.keyring
            .put(LABEL_CLIENT_CA, pem)
            .map_err(import_failed)?;
        Ok(count)
    }

    pub fn store_server_p12(&self, der: &[u8]) -> Result<(), CertStoreError> {
        self.keyring.put(LABEL_SERVER_P12, der)
    }

    pub fn store_client_p12(&self, der: &[u8]) -> Result<(), CertStoreError> {
        self.keyring.put(LABEL_CLIENT_P12, der)
    }

    /// Custom identity if imported, else the bundled one.
    pub fn active_server_identity(&self) -> Result<Identity, CertStoreError> {
        let pem = self
            .keyring
            .get(LABEL_SERVER_IDENTITY_CUSTOM)?
            .or(self.keyring.get(LABEL_SERVER_IDENTITY_BUNDLED)?)
            .ok_or(CertStoreError::NoIdentityInBundle)?;
        parse_identity(&pem)
    }

    pub fn client_ca_anchors(&self) -> Result<Vec<CertificateDer<'static>>, CertStoreError> {
        match self.keyring.get(LABEL_CLIENT_CA)? {
            Some(pem) => parse_certs(&pem),
            None => Ok(Vec::new()),
        }
    }

    pub fn active_server_p12(&self) -> Result<(Vec<u8>, String), CertStoreError> {
        let der = self
            .keyring
            .get(LABEL_SERVER_P12)?
            .ok_or(CertStoreError::NoIdentityInBundle)?;
        Ok((der, BUNDLE_PASSWORD.to_string()))
    }

    pub fn active_client_p12(&self) -> Result<(Vec<u8>, String), CertStoreError> {
        let der = self
            .keyring
            .get(LABEL_CLIENT_P12)?
            .ok_or(CertStoreError::NoIdentityInBundle)?;
        Ok((der, BUNDLE_PASSWORD.to_string()))
    }
}

/// A parse-clean bundle that still cannot be written is an import failure,
/// not a keyring read problem.
fn import_failed(e: CertStoreError) -> CertStoreError {
    CertStoreError::ImportFailed(e.to_string())
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, CertStoreError> {
    let mut reader = std::io::BufReader::new(pem);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| CertStoreError::InvalidPem)
}

fn parse_identity(pem: &[u8]) -> Result<Identity, CertStoreError> {
    let cert_chain = parse_certs(pem)?;
    if cert_chain.is_empty() {
        return Err(CertStoreError::NoIdentityInBundle);
    }
    let mut reader = std::io::BufReader::new(pem);
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|_| CertStoreError::InvalidPem)?
        .ok_or(CertStoreError::NoIdentityInBundle)?;
    Ok(Identity { cert_chain, key })
}
