//! Local certificate authority
//!
//! CodeGate keeps a CA certificate and key plus a server certificate for its
//! own listener in the certificate directory. When a client tunnels to a
//! host through the proxy, a leaf certificate for that host is issued on the
//! fly and signed by the CA, so clients that trust the CA accept it.

use chrono::{Datelike, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info};

const CA_COMMON_NAME: &str = "CodeGate CA";
const CA_ORGANIZATION: &str = "CodeGate";
const CA_VALIDITY_YEARS: i32 = 10;
const LEAF_VALIDITY_YEARS: i32 = 1;
const SERVER_NAMES: [&str; 2] = ["localhost", "127.0.0.1"];
/// Per-host TLS configurations kept before the oldest is evicted
const MAX_DOMAIN_CONFIGS: usize = 256;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("certificate I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("invalid PEM in {path}: {message}")]
    Pem { path: PathBuf, message: String },

    #[error("TLS configuration failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate authority is not loaded")]
    NotLoaded,
}

/// Location of the certificate files
#[derive(Debug, Clone)]
pub struct CertPaths {
    pub dir: PathBuf,
    pub ca_cert: String,
    pub ca_key: String,
    pub server_cert: String,
    pub server_key: String,
}

impl CertPaths {
    pub fn ca_cert_path(&self) -> PathBuf {
        self.dir.join(&self.ca_cert)
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.dir.join(&self.ca_key)
    }

    pub fn server_cert_path(&self) -> PathBuf {
        self.dir.join(&self.server_cert)
    }

    pub fn server_key_path(&self) -> PathBuf {
        self.dir.join(&self.server_key)
    }

    fn all(&self) -> [PathBuf; 4] {
        [
            self.ca_cert_path(),
            self.ca_key_path(),
            self.server_cert_path(),
            self.server_key_path(),
        ]
    }
}

/// CA material used to sign leaf certificates
struct Issuer {
    /// Re-signed copy of the CA used only as the signing issuer
    cert: Certificate,
    key: KeyPair,
    /// The CA certificate exactly as clients have it on disk
    der: CertificateDer<'static>,
}

/// Issued host configurations, evicted in insertion order
#[derive(Default)]
struct DomainCache {
    configs: HashMap<String, Arc<ServerConfig>>,
    order: VecDeque<String>,
}

impl DomainCache {
    fn get(&self, host: &str) -> Option<Arc<ServerConfig>> {
        self.configs.get(host).cloned()
    }

    fn insert(&mut self, host: String, config: Arc<ServerConfig>) {
        if self.configs.insert(host.clone(), config).is_some() {
            return;
        }
        self.order.push_back(host);
        while self.order.len() > MAX_DOMAIN_CONFIGS {
            if let Some(oldest) = self.order.pop_front() {
                self.configs.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.configs.len()
    }

    fn clear(&mut self) {
        self.configs.clear();
        self.order.clear();
    }
}

pub struct CertificateAuthority {
    paths: CertPaths,
    issuer: RwLock<Option<Arc<Issuer>>>,
    domain_configs: Mutex<DomainCache>,
}

impl CertificateAuthority {
    pub fn new(paths: CertPaths) -> Self {
        Self {
            paths,
            issuer: RwLock::new(None),
            domain_configs: Mutex::new(DomainCache::default()),
        }
    }

    pub fn paths(&self) -> &CertPaths {
        &self.paths
    }

    /// Make sure the CA and server certificates exist and are loaded
    ///
    /// Returns `true` when usable certificates were already present and
    /// `false` when a new set had to be generated.
    pub fn check_and_ensure_certificates(&self) -> Result<bool, CertificateError> {
        let all_present = self.paths.all().iter().all(|p| p.is_file());

        if all_present {
            match self.load_issuer() {
                Ok(issuer) => {
                    self.set_issuer(issuer);
                    debug!(dir = %self.paths.dir.display(), "Loaded existing certificates");
                    return Ok(true);
                }
                Err(e) => {
                    info!(error = %e, "Existing CA could not be loaded, regenerating");
                }
            }
        }

        self.generate_all()?;
        Ok(false)
    }

    /// Delete all certificate files that exist
    pub fn remove_certificates(&self) -> Result<(), CertificateError> {
        for path in self.paths.all() {
            if path.exists() {
                fs::remove_file(&path).map_err(|source| CertificateError::Io {
                    path: path.clone(),
                    source,
                })?;
                debug!(path = %path.display(), "Removed certificate file");
            }
        }
        if let Ok(mut issuer) = self.issuer.write() {
            *issuer = None;
        }
        if let Ok(mut configs) = self.domain_configs.lock() {
            configs.clear();
        }
        Ok(())
    }

    /// TLS configuration for CodeGate's own listener
    pub fn server_tls_config(&self) -> Result<Arc<ServerConfig>, CertificateError> {
        let cert_path = self.paths.server_cert_path();
        let key_path = self.paths.server_key_path();

        let cert = CertificateDer::from_pem_file(&cert_path).map_err(|e| CertificateError::Pem {
            path: cert_path.clone(),
            message: e.to_string(),
        })?;
        let key = PrivateKeyDer::from_pem_file(&key_path).map_err(|e| CertificateError::Pem {
            path: key_path.clone(),
            message: e.to_string(),
        })?;

        let chain = vec![cert, self.issuer()?.der.clone()];
        build_tls_config(chain, key)
    }

    /// TLS configuration presenting a CA-signed certificate for `host`
    ///
    /// Configurations are cached per host; the oldest are dropped once
    /// `MAX_DOMAIN_CONFIGS` hosts have been seen.
    pub fn domain_certificate(&self, host: &str) -> Result<Arc<ServerConfig>, CertificateError> {
        let host = host.to_lowercase();
        if let Some(config) = self
            .domain_configs
            .lock()
            .ok()
            .and_then(|configs| configs.get(&host))
        {
            return Ok(config);
        }

        let issuer = self.issuer()?;
        let (cert, key) = issue_leaf(&issuer, &host, vec![host.clone()])?;
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let config = build_tls_config(vec![cert.der().clone(), issuer.der.clone()], key_der)?;

        debug!(%host, "Issued domain certificate");
        if let Ok(mut configs) = self.domain_configs.lock() {
            configs.insert(host, config.clone());
            debug!(cached = configs.len(), "Cached domain certificate");
        }
        Ok(config)
    }

    fn issuer(&self) -> Result<Arc<Issuer>, CertificateError> {
        self.issuer
            .read()
            .ok()
            .and_then(|issuer| issuer.clone())
            .ok_or(CertificateError::NotLoaded)
    }

    fn set_issuer(&self, issuer: Issuer) {
        if let Ok(mut slot) = self.issuer.write() {
            *slot = Some(Arc::new(issuer));
        }
    }

    fn load_issuer(&self) -> Result<Issuer, CertificateError> {
        let cert_path = self.paths.ca_cert_path();
        let key_path = self.paths.ca_key_path();

        let cert_pem = read_file(&cert_path)?;
        let key_pem = read_file(&key_path)?;

        let key = KeyPair::from_pem(&key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
        let der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|e| {
            CertificateError::Pem {
                path: cert_path.clone(),
                message: e.to_string(),
            }
        })?;
        let cert = params.self_signed(&key)?;

        Ok(Issuer { cert, key, der })
    }

    fn generate_all(&self) -> Result<(), CertificateError> {
        fs::create_dir_all(&self.paths.dir).map_err(|source| CertificateError::Io {
            path: self.paths.dir.clone(),
            source,
        })?;

        let ca_key = KeyPair::generate()?;
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(CA_COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, CA_VALIDITY_YEARS);
        let ca_cert = params.self_signed(&ca_key)?;

        write_file(&self.paths.ca_cert_path(), ca_cert.pem().as_bytes(), false)?;
        write_file(&self.paths.ca_key_path(), ca_key.serialize_pem().as_bytes(), true)?;

        let issuer = Issuer {
            der: ca_cert.der().clone(),
            cert: ca_cert,
            key: ca_key,
        };

        let names = SERVER_NAMES.iter().map(|s| s.to_string()).collect();
        let (server_cert, server_key) = issue_leaf(&issuer, SERVER_NAMES[0], names)?;
        write_file(&self.paths.server_cert_path(), server_cert.pem().as_bytes(), false)?;
        write_file(
            &self.paths.server_key_path(),
            server_key.serialize_pem().as_bytes(),
            true,
        )?;

        info!(dir = %self.paths.dir.display(), "Generated new CA and server certificates");
        self.set_issuer(issuer);
        Ok(())
    }
}

fn issue_leaf(
    issuer: &Issuer,
    common_name: &str,
    names: Vec<String>,
) -> Result<(Certificate, KeyPair), CertificateError> {
    let mut params = CertificateParams::new(names)?;
    params.distinguished_name = distinguished_name(common_name);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;
    set_validity(&mut params, LEAF_VALIDITY_YEARS);

    let key = KeyPair::generate()?;
    let cert = params.signed_by(&key, &issuer.cert, &issuer.key)?;
    Ok((cert, key))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, CA_ORGANIZATION);
    dn
}

/// Valid from the start of today (UTC) for `years` years
fn set_validity(params: &mut CertificateParams, years: i32) {
    let today = Utc::now().date_naive();
    // Day capped at 28 so the end date exists in every year
    let day = today.day().min(28) as u8;
    let month = today.month() as u8;
    params.not_before = rcgen::date_time_ymd(today.year(), month, day);
    params.not_after = rcgen::date_time_ymd(today.year() + years, month, day);
}

fn build_tls_config(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, CertificateError> {
    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

fn read_file(path: &Path) -> Result<String, CertificateError> {
    fs::read_to_string(path).map_err(|source| CertificateError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_file(path: &Path, contents: &[u8], private: bool) -> Result<(), CertificateError> {
    fs::write(path, contents).map_err(|source| CertificateError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|source| {
            CertificateError::Io {
                path: path.to_path_buf(),
                source,
            }
        })?;
    }
    #[cfg(not(unix))]
    let _ = private;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_paths(dir: &Path) -> CertPaths {
        CertPaths {
            dir: dir.join("certs"),
            ca_cert: "ca.crt".to_string(),
            ca_key: "ca.key".to_string(),
            server_cert: "server.crt".to_string(),
            server_key: "server.key".to_string(),
        }
    }

    #[test]
    fn test_generates_then_reuses() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(test_paths(dir.path()));

        assert!(!ca.check_and_ensure_certificates().unwrap());
        for path in ca.paths().all() {
            assert!(path.is_file(), "missing {}", path.display());
        }
        let first_ca = fs::read_to_string(ca.paths().ca_cert_path()).unwrap();
        assert!(first_ca.starts_with("-----BEGIN CERTIFICATE-----"));

        let reloaded = CertificateAuthority::new(test_paths(dir.path()));
        assert!(reloaded.check_and_ensure_certificates().unwrap());
        let second_ca = fs::read_to_string(ca.paths().ca_cert_path()).unwrap();
        assert_eq!(first_ca, second_ca);
    }

    #[test]
    fn test_remove_and_regenerate() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(test_paths(dir.path()));
        ca.check_and_ensure_certificates().unwrap();
        let before = fs::read_to_string(ca.paths().ca_cert_path()).unwrap();

        ca.remove_certificates().unwrap();
        assert!(!ca.paths().ca_cert_path().exists());
        assert!(matches!(
            ca.domain_certificate("example.com"),
            Err(CertificateError::NotLoaded)
        ));

        assert!(!ca.check_and_ensure_certificates().unwrap());
        let after = fs::read_to_string(ca.paths().ca_cert_path()).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_missing_file_triggers_generation() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(test_paths(dir.path()));
        ca.check_and_ensure_certificates().unwrap();
        fs::remove_file(ca.paths().server_key_path()).unwrap();

        let ca = CertificateAuthority::new(test_paths(dir.path()));
        assert!(!ca.check_and_ensure_certificates().unwrap());
        assert!(ca.paths().server_key_path().is_file());
    }

    #[test]
    fn test_tls_configs() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(test_paths(dir.path()));
        ca.check_and_ensure_certificates().unwrap();

        ca.server_tls_config().unwrap();
        let first = ca.domain_certificate("API.GitHub.com").unwrap();
        let second = ca.domain_certificate("api.github.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_domain_cache_is_bounded() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(test_paths(dir.path()));
        ca.check_and_ensure_certificates().unwrap();

        let first = ca.domain_certificate("host-0.example.com").unwrap();
        for i in 1..=MAX_DOMAIN_CONFIGS {
            ca.domain_certificate(&format!("host-{}.example.com", i)).unwrap();
        }
        assert_eq!(ca.domain_configs.lock().unwrap().len(), MAX_DOMAIN_CONFIGS);

        // The first host was evicted, so it gets a fresh configuration
        let again = ca.domain_certificate("host-0.example.com").unwrap();
        assert!(!Arc::ptr_eq(&first, &again));
        assert_eq!(ca.domain_configs.lock().unwrap().len(), MAX_DOMAIN_CONFIGS);
    }

    #[test]
    fn test_domain_certs_from_reloaded_ca() {
        let dir = TempDir::new().unwrap();
        CertificateAuthority::new(test_paths(dir.path()))
            .check_and_ensure_certificates()
            .unwrap();

        let ca = CertificateAuthority::new(test_paths(dir.path()));
        assert!(ca.check_and_ensure_certificates().unwrap());
        assert!(ca.domain_certificate("copilot-proxy.githubusercontent.com").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(test_paths(dir.path()));
        ca.check_and_ensure_certificates().unwrap();
        let mode = fs::metadata(ca.paths().ca_key_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
