//! Per-endpoint TLS material
//!
//! An endpoint without a client certificate is plaintext and gets
//! [`SecurityContext::plaintext`]. Otherwise the CA bundle, client identity,
//! verification toggle and expected server name are assembled into a rustls
//! [`ClientConfig`]. What happens when a credential file cannot be loaded is
//! decided by [`CertificatePolicy`].

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WantsClientCert;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ConfigBuilder, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::{Endpoint, SecurityContextError};

/// What to do when a CA bundle or client identity cannot be loaded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificatePolicy {
    /// Keep going with whatever loaded; failures are recorded on the context
    #[default]
    Lenient,
    /// Fail the endpoint on the first credential error
    Strict,
}

/// A credential that failed to load under [`CertificatePolicy::Lenient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialIssue {
    CaBundle { path: Option<PathBuf>, reason: String },
    ClientIdentity { reason: String },
}

impl fmt::Display for CredentialIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CaBundle {
                path: Some(path),
                reason,
            } => write!(f, "CA bundle {}: {}", path.display(), reason),
            Self::CaBundle { path: None, reason } => write!(f, "CA bundle: {}", reason),
            Self::ClientIdentity { reason } => write!(f, "client identity: {}", reason),
        }
    }
}

/// Transport security derived from one endpoint
#[derive(Clone, Default)]
pub struct SecurityContext {
    tls: Option<TlsMaterial>,
}

#[derive(Clone)]
struct TlsMaterial {
    client_config: Arc<ClientConfig>,
    trust_roots: usize,
    client_identity: bool,
    verify_server: bool,
    server_name: String,
    issues: Vec<CredentialIssue>,
}

impl SecurityContext {
    /// Context for endpoints that do not use TLS
    pub fn plaintext() -> Self {
        Self::default()
    }

    /// Build the context for `endpoint`
    ///
    /// Returns the plaintext context, without error, when the endpoint has no
    /// client certificate path.
    pub fn build(
        endpoint: &Endpoint,
        policy: CertificatePolicy,
    ) -> Result<Self, SecurityContextError> {
        let Some(cert_path) = endpoint.client_cert_path.as_deref() else {
            return Ok(Self::plaintext());
        };

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut issues = Vec::new();

        let verify_server = !endpoint.ssl_skip_verify;
        let server_name = endpoint.expected_server_name().to_string();

        let mut roots = RootCertStore::empty();
        match load_ca_bundle(endpoint.ca_cert_path.as_deref(), &mut roots) {
            Ok(added) => debug!("Loaded {} trust roots for {}", added, endpoint.label()),
            Err(err) => match policy {
                CertificatePolicy::Strict => return Err(err),
                CertificatePolicy::Lenient => issues.push(CredentialIssue::CaBundle {
                    path: endpoint.ca_cert_path.clone(),
                    reason: err.to_string(),
                }),
            },
        }
        let trust_roots = roots.len();

        let key_path = endpoint.client_key_path.as_deref();
        let identity = match load_client_identity(cert_path, key_path) {
            Ok(identity) => Some(identity),
            Err(err) => match policy {
                CertificatePolicy::Strict => return Err(err),
                CertificatePolicy::Lenient => {
                    issues.push(CredentialIssue::ClientIdentity {
                        reason: err.to_string(),
                    });
                    None
                }
            },
        };

        let (client_config, client_identity) = match identity {
            Some((chain, key)) => {
                match verifier_stage(&provider, verify_server, roots.clone())?
                    .with_client_auth_cert(chain, key)
                {
                    Ok(config) => (config, true),
                    Err(e) => {
                        let err = SecurityContextError::Tls(e.to_string());
                        if policy == CertificatePolicy::Strict {
                            return Err(err);
                        }
                        issues.push(CredentialIssue::ClientIdentity {
                            reason: err.to_string(),
                        });
                        let config = verifier_stage(&provider, verify_server, roots)?
                            .with_no_client_auth();
                        (config, false)
                    }
                }
            }
            None => (
                verifier_stage(&provider, verify_server, roots)?.with_no_client_auth(),
                false,
            ),
        };

        for issue in &issues {
            warn!(
                "SSL credentials for {} only partially loaded: {}",
                endpoint.label(),
                issue
            );
        }

        Ok(Self {
            tls: Some(TlsMaterial {
                client_config: Arc::new(client_config),
                trust_roots,
                client_identity,
                verify_server,
                server_name,
                issues,
            }),
        })
    }

    /// Whether a TLS connection will be attempted
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// rustls configuration, `None` for plaintext
    pub fn client_config(&self) -> Option<Arc<ClientConfig>> {
        self.tls.as_ref().map(|tls| Arc::clone(&tls.client_config))
    }

    /// Number of certificates in the trust-root set
    pub fn trust_root_count(&self) -> usize {
        self.tls.as_ref().map_or(0, |tls| tls.trust_roots)
    }

    pub fn has_client_identity(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| tls.client_identity)
    }

    /// Whether the broker certificate and hostname are verified
    pub fn verifies_server(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| tls.verify_server)
    }

    /// Server name expected in the broker certificate
    pub fn server_name(&self) -> Option<&str> {
        self.tls.as_ref().map(|tls| tls.server_name.as_str())
    }

    /// Credential failures tolerated while building the context
    pub fn issues(&self) -> &[CredentialIssue] {
        match &self.tls {
            Some(tls) => &tls.issues,
            None => &[],
        }
    }

    /// TLS was requested but some credential did not load
    pub fn is_degraded(&self) -> bool {
        !self.issues().is_empty()
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tls {
            None => f.write_str("SecurityContext::Plaintext"),
            Some(tls) => f
                .debug_struct("SecurityContext")
                .field("trust_roots", &tls.trust_roots)
                .field("client_identity", &tls.client_identity)
                .field("verify_server", &tls.verify_server)
                .field("server_name", &tls.server_name)
                .field("issues", &tls.issues)
                .finish(),
        }
    }
}

/// Protocol versions plus server verification, ready for the client identity
fn verifier_stage(
    provider: &Arc<CryptoProvider>,
    verify_server: bool,
    roots: RootCertStore,
) -> Result<ConfigBuilder<ClientConfig, WantsClientCert>, SecurityContextError> {
    let builder = ClientConfig::builder_with_provider(Arc::clone(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| SecurityContextError::Tls(e.to_string()))?;

    Ok(if verify_server {
        builder.with_root_certificates(roots)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification {
                provider: Arc::clone(provider),
            }))
    })
}

/// Add every PEM certificate in the bundle to `roots`
fn load_ca_bundle(
    path: Option<&Path>,
    roots: &mut RootCertStore,
) -> Result<usize, SecurityContextError> {
    let Some(path) = path else {
        return Err(SecurityContextError::CaBundle {
            path: PathBuf::new(),
            reason: "path is not configured".to_string(),
        });
    };
    let ca_error = |reason: String| SecurityContextError::CaBundle {
        path: path.to_path_buf(),
        reason,
    };

    let certs = read_certificates(path).map_err(ca_error)?;
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(ca_error(format!(
            "no usable certificates ({} ignored)",
            ignored
        )));
    }

    Ok(added)
}

type ClientIdentity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

fn load_client_identity(
    cert_path: &Path,
    key_path: Option<&Path>,
) -> Result<ClientIdentity, SecurityContextError> {
    let chain = read_certificates(cert_path).map_err(|reason| {
        SecurityContextError::ClientCertificate {
            path: cert_path.to_path_buf(),
            reason,
        }
    })?;
    if chain.is_empty() {
        return Err(SecurityContextError::ClientCertificate {
            path: cert_path.to_path_buf(),
            reason: "no certificates found".to_string(),
        });
    }

    let key_path = key_path.ok_or(SecurityContextError::MissingClientKey)?;
    let key_error = |reason: String| SecurityContextError::ClientKey {
        path: key_path.to_path_buf(),
        reason,
    };

    let file = File::open(key_path).map_err(|e| key_error(e.to_string()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| key_error(e.to_string()))?
        .ok_or_else(|| key_error("no private key found".to_string()))?;

    Ok((chain, key))
}

fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())
}

/// Accepts any server certificate, used when `SSLSkipVerify` is set.
/// Handshake signatures are still checked.
#[derive(Debug)]
struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    fn tls_endpoint() -> Endpoint {
        let mut endpoint = Endpoint::new("tls slave", "10.82.15.52", 5671, "guest1", "guest1");
        endpoint.ca_cert_path = Some(fixture("ca.pem"));
        endpoint.client_cert_path = Some(fixture("client.pem"));
        endpoint.client_key_path = Some(fixture("client.key"));
        endpoint
    }

    #[test]
    fn test_plaintext_without_client_cert() {
        let endpoint = Endpoint::new("plain", "10.82.15.52", 5672, "guest1", "guest1");

        let ctx = SecurityContext::build(&endpoint, CertificatePolicy::Strict).unwrap();
        assert!(!ctx.is_tls());
        assert!(ctx.client_config().is_none());
        assert_eq!(ctx.trust_root_count(), 0);
        assert!(ctx.issues().is_empty());
    }

    #[test]
    fn test_full_tls_context() {
        let ctx = SecurityContext::build(&tls_endpoint(), CertificatePolicy::Strict).unwrap();

        assert!(ctx.is_tls());
        assert_eq!(ctx.trust_root_count(), 1);
        assert!(ctx.has_client_identity());
        assert!(ctx.verifies_server());
        assert_eq!(ctx.server_name(), Some("10.82.15.52"));
        assert!(!ctx.is_degraded());
    }

    #[test]
    fn test_common_name_override_and_skip_verify() {
        let mut endpoint = tls_endpoint();
        endpoint.cert_common_name = "testslave1".to_string();
        endpoint.ssl_skip_verify = true;

        let ctx = SecurityContext::build(&endpoint, CertificatePolicy::Lenient).unwrap();
        assert_eq!(ctx.server_name(), Some("testslave1"));
        assert!(!ctx.verifies_server());
    }

    #[test]
    fn test_unreadable_ca_is_lenient_by_default() {
        let mut endpoint = tls_endpoint();
        endpoint.ca_cert_path = Some(fixture("does-not-exist.pem"));

        let ctx = SecurityContext::build(&endpoint, CertificatePolicy::default()).unwrap();
        assert!(ctx.is_tls());
        assert_eq!(ctx.trust_root_count(), 0);
        assert!(ctx.has_client_identity());
        assert!(ctx.is_degraded());
        assert!(matches!(ctx.issues()[0], CredentialIssue::CaBundle { .. }));
    }

    #[test]
    fn test_unreadable_ca_is_error_when_strict() {
        let mut endpoint = tls_endpoint();
        endpoint.ca_cert_path = Some(fixture("does-not-exist.pem"));

        let err = SecurityContext::build(&endpoint, CertificatePolicy::Strict).unwrap_err();
        assert!(matches!(err, SecurityContextError::CaBundle { .. }));
    }

    #[test]
    fn test_garbage_ca_bundle() {
        let mut endpoint = tls_endpoint();
        endpoint.ca_cert_path = Some(fixture("garbage.pem"));

        let ctx = SecurityContext::build(&endpoint, CertificatePolicy::Lenient).unwrap();
        assert_eq!(ctx.trust_root_count(), 0);

        assert!(SecurityContext::build(&endpoint, CertificatePolicy::Strict).is_err());
    }

    #[test]
    fn test_missing_client_key() {
        let mut endpoint = tls_endpoint();
        endpoint.client_key_path = None;

        let ctx = SecurityContext::build(&endpoint, CertificatePolicy::Lenient).unwrap();
        assert!(!ctx.has_client_identity());
        assert_eq!(ctx.trust_root_count(), 1);
        assert!(matches!(
            ctx.issues()[0],
            CredentialIssue::ClientIdentity { .. }
        ));

        let err = SecurityContext::build(&endpoint, CertificatePolicy::Strict).unwrap_err();
        assert!(matches!(err, SecurityContextError::MissingClientKey));
    }

    #[test]
    fn test_unreadable_client_cert() {
        let mut endpoint = tls_endpoint();
        endpoint.client_cert_path = Some(fixture("missing-client.pem"));

        let ctx = SecurityContext::build(&endpoint, CertificatePolicy::Lenient).unwrap();
        assert!(ctx.is_tls());
        assert!(!ctx.has_client_identity());

        let err = SecurityContext::build(&endpoint, CertificatePolicy::Strict).unwrap_err();
        assert!(matches!(
            err,
            SecurityContextError::ClientCertificate { .. }
        ));
    }

    #[test]
    fn test_version_one_client_cert_is_rejected() {
        let mut endpoint = tls_endpoint();
        endpoint.client_cert_path = Some(fixture("legacy-v1.pem"));

        let ctx = SecurityContext::build(&endpoint, CertificatePolicy::Lenient).unwrap();
        assert!(ctx.is_tls());
        assert!(!ctx.has_client_identity());
        assert_eq!(ctx.trust_root_count(), 1);
        assert_eq!(ctx.issues().len(), 1);
        assert!(matches!(
            ctx.issues()[0],
            CredentialIssue::ClientIdentity { .. }
        ));

        let err = SecurityContext::build(&endpoint, CertificatePolicy::Strict).unwrap_err();
        assert!(matches!(err, SecurityContextError::Tls(_)));
    }

    #[test]
    fn test_no_ca_path_with_client_cert() {
        let mut endpoint = tls_endpoint();
        endpoint.ca_cert_path = None;

        let ctx = SecurityContext::build(&endpoint, CertificatePolicy::Lenient).unwrap();
        assert_eq!(ctx.trust_root_count(), 0);
        assert_eq!(ctx.issues().len(), 1);
        assert!(ctx.issues()[0].to_string().contains("not configured"));
    }
}
