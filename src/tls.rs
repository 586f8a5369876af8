use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read cert file '{path}': {source}")]
    CertFileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to read key file '{path}': {source}")]
    KeyFileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("no valid certificates found in '{0}'")]
    NoCerts(String),
    #[error("no valid private key found in '{0}'")]
    NoKey(String),
    #[error("failed to build TLS config: {0}")]
    RustlsConfig(#[from] rustls::Error),
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Reads a PEM certificate chain and private key into a signing-ready pair.
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, TlsError> {
    let cert_data = fs::read(cert_path).map_err(|e| TlsError::CertFileRead {
        path: path_str(cert_path),
        source: e,
    })?;
    let key_data = fs::read(key_path).map_err(|e| TlsError::KeyFileRead {
        path: path_str(key_path),
        source: e,
    })?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_data.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertFileRead {
            path: path_str(cert_path),
            source: e,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCerts(path_str(cert_path)));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_data.as_slice()))
        .map_err(|e| TlsError::KeyFileRead {
            path: path_str(key_path),
            source: e,
        })?
        .ok_or_else(|| TlsError::NoKey(path_str(key_path)))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
    Ok(CertifiedKey::new(certs, signing_key))
}

#[derive(Debug)]
struct Loaded {
    key: Arc<CertifiedKey>,
    cert_modified: Option<SystemTime>,
    key_modified: Option<SystemTime>,
}

/// Serves the current certificate and re-reads the files on handshake when
/// their modification time changed. A failed reload keeps the previous pair.
#[derive(Debug)]
pub struct ReloadingCertResolver {
    cert_path: PathBuf,
    key_path: PathBuf,
    current: RwLock<Loaded>,
}

impl ReloadingCertResolver {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Result<Self, TlsError> {
        let cert_path = cert_path.into();
        let key_path = key_path.into();
        let key = load_certified_key(&cert_path, &key_path)?;
        let current = Loaded {
            key: Arc::new(key),
            cert_modified: modified(&cert_path),
            key_modified: modified(&key_path),
        };
        Ok(Self {
            cert_path,
            key_path,
            current: RwLock::new(current),
        })
    }

    fn is_stale(&self) -> Option<(Option<SystemTime>, Option<SystemTime>)> {
        let cert_modified = modified(&self.cert_path);
        let key_modified = modified(&self.key_path);
        let current = self.current.read().ok()?;
        if current.cert_modified == cert_modified && current.key_modified == key_modified {
            None
        } else {
            Some((cert_modified, key_modified))
        }
    }

    fn refresh(&self) {
        let Some((cert_modified, key_modified)) = self.is_stale() else {
            return;
        };

        match load_certified_key(&self.cert_path, &self.key_path) {
            Ok(key) => {
                if let Ok(mut current) = self.current.write() {
                    *current = Loaded {
                        key: Arc::new(key),
                        cert_modified,
                        key_modified,
                    };
                    info!(cert = %self.cert_path.display(), "reloaded TLS certificate");
                }
            }
            Err(e) => warn!("failed to reload TLS certificate, keeping previous one: {e}"),
        }
    }
}

impl ResolvesServerCert for ReloadingCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.refresh();
        self.current.read().ok().map(|current| current.key.clone())
    }
}

pub fn load_tls_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>, TlsError> {
    let resolver = ReloadingCertResolver::new(cert_path, key_path)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cert_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_certified_key(&dir.path().join("tls.crt"), &dir.path().join("tls.key")).unwrap_err();
        assert!(matches!(err, TlsError::CertFileRead { .. }));
    }

    #[test]
    fn test_missing_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("tls.crt");
        fs::write(&cert, "").unwrap();
        let err = load_certified_key(&cert, &dir.path().join("tls.key")).unwrap_err();
        assert!(matches!(err, TlsError::KeyFileRead { .. }));
    }

    #[test]
    fn test_empty_pem_files() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("tls.crt");
        let key = dir.path().join("tls.key");
        fs::write(&cert, "not a pem\n").unwrap();
        fs::write(&key, "").unwrap();
        let err = load_certified_key(&cert, &key).unwrap_err();
        assert!(matches!(err, TlsError::NoCerts(_)));
    }

    #[test]
    fn test_resolver_requires_initial_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let result = ReloadingCertResolver::new(dir.path().join("tls.crt"), dir.path().join("tls.key"));
        assert!(result.is_err());
    }
}
