//! mTLS plumbing for the cluster channel.
//!
//! Two trust models. In `shared` mode both roles present the same cluster
//! certificate and each side pins the other's leaf to its SHA-256
//! fingerprint inside the verifier, so a mismatched identity fails the TLS
//! handshake itself. In `pki` mode certificates chain to a configured CA and
//! the control plane may additionally consult OCSP after the handshake.

use super::ocsp::{self, OcspError, RevocationStatus};
use super::types::OCSP_TIMEOUT;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig,
    SignatureScheme,
};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::{server, TlsAcceptor};
use tracing::warn;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("rustls: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
    #[error("no private key found in {0}")]
    NoKey(String),
    #[error("no certificate found in {0}")]
    NoCert(String),
    #[error("client certificate is revoked")]
    Revoked,
    #[error("revocation check failed: {0}")]
    Ocsp(#[from] OcspError),
}

/// How data plane identity is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MtlsMode {
    /// One well-known certificate on both sides, pinned by fingerprint.
    Shared,
    /// Per-node certificates validated against a cluster CA.
    Pki,
}

impl std::str::FromStr for MtlsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(MtlsMode::Shared),
            "pki" => Ok(MtlsMode::Pki),
            other => Err(format!("unknown mtls mode {other:?} (expected shared or pki)")),
        }
    }
}

/// Revocation policy in pki mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcspPolicy {
    /// Never consult OCSP.
    Off,
    /// Any failure to confirm a good status is fatal.
    On,
    /// Soft mode: revoked is fatal, everything else logs a warning.
    OptionalNoCa,
}

impl std::str::FromStr for OcspPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(OcspPolicy::Off),
            "on" => Ok(OcspPolicy::On),
            "optional_no_ca" => Ok(OcspPolicy::OptionalNoCa),
            other => Err(format!(
                "unknown ocsp policy {other:?} (expected on, off or optional_no_ca)"
            )),
        }
    }
}

/// Certificate chain plus private key for one side of the channel.
pub struct TlsIdentity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        if certs.is_empty() {
            return Err(TlsError::NoCert(cert_path.display().to_string()));
        }
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| TlsError::NoKey(key_path.display().to_string()))?;
        Ok(Self { certs, key })
    }

    /// SHA-256 fingerprint of the leaf, the pin used in shared mode.
    pub fn leaf_fingerprint(&self) -> String {
        leaf_fingerprint(&self.certs[0])
    }
}

pub fn load_ca(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)) {
        roots.add(cert?)?;
    }
    if roots.is_empty() {
        return Err(TlsError::NoCert(path.display().to_string()));
    }
    Ok(roots)
}

/// Lowercase hex SHA-256 of a DER certificate.
pub fn leaf_fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

/// Install the process-wide crypto provider. Idempotent; rustls refuses to
/// pick one itself when more than one backend is linked in.
pub fn init_crypto() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn provider() -> Arc<CryptoProvider> {
    init_crypto();
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

// =============================================================================
// CONTROL PLANE GATE
// =============================================================================

enum GateMode {
    Shared,
    Pki { policy: OcspPolicy },
}

/// Server-side identity gate: TLS acceptor plus the post-handshake
/// revocation policy.
pub struct TlsGate {
    acceptor: TlsAcceptor,
    mode: GateMode,
}

impl TlsGate {
    /// Shared-certificate gate. The acceptor rejects any client whose leaf
    /// does not match this identity's fingerprint.
    pub fn shared(identity: TlsIdentity) -> Result<Self, TlsError> {
        let pin = identity.leaf_fingerprint();
        let verifier = Arc::new(PinnedClientVerifier { pin, provider: provider() });
        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(identity.certs, identity.key)?;
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            mode: GateMode::Shared,
        })
    }

    /// CA-validated gate with optional OCSP.
    pub fn pki(identity: TlsIdentity, roots: RootCertStore, policy: OcspPolicy) -> Result<Self, TlsError> {
        init_crypto();
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;
        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(identity.certs, identity.key)?;
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            mode: GateMode::Pki { policy },
        })
    }

    pub async fn accept(&self, stream: TcpStream) -> Result<server::TlsStream<TcpStream>, TlsError> {
        Ok(self.acceptor.accept(stream).await?)
    }

    /// Post-handshake revocation check on the presented chain. Revoked is
    /// always fatal; whether an inconclusive check is depends on policy.
    pub async fn verify_revocation(
        &self,
        chain: &[CertificateDer<'static>],
    ) -> Result<(), TlsError> {
        let policy = match &self.mode {
            GateMode::Shared | GateMode::Pki { policy: OcspPolicy::Off } => return Ok(()),
            GateMode::Pki { policy } => *policy,
        };
        match ocsp::check_chain(chain, OCSP_TIMEOUT).await {
            Ok(RevocationStatus::Good) => Ok(()),
            Ok(RevocationStatus::Revoked) => Err(TlsError::Revoked),
            Ok(RevocationStatus::Unknown) => {
                soft_fail(policy, OcspError::Inconclusive("responder returned unknown status"))
            }
            Err(e) => soft_fail(policy, e),
        }
    }
}

fn soft_fail(policy: OcspPolicy, error: OcspError) -> Result<(), TlsError> {
    match policy {
        OcspPolicy::On => Err(error.into()),
        _ => {
            warn!("ocsp check inconclusive, allowing connection: {error}");
            Ok(())
        }
    }
}

// =============================================================================
// DATA PLANE CONNECTOR
// =============================================================================

/// Client TLS config for the data plane. In shared mode the control plane's
/// leaf is pinned instead of chain-validated.
pub fn client_config_shared(identity: TlsIdentity) -> Result<ClientConfig, TlsError> {
    let pin = identity.leaf_fingerprint();
    let verifier = Arc::new(PinnedServerVerifier { pin, provider: provider() });
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(identity.certs, identity.key)?;
    Ok(config)
}

pub fn client_config_pki(identity: TlsIdentity, roots: RootCertStore) -> Result<ClientConfig, TlsError> {
    init_crypto();
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(identity.certs, identity.key)?;
    Ok(config)
}

// =============================================================================
// PINNED VERIFIERS
// =============================================================================

#[derive(Debug)]
struct PinnedClientVerifier {
    pin: String,
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for PinnedClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        if leaf_fingerprint(end_entity) == self.pin {
            Ok(ClientCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
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

#[derive(Debug)]
struct PinnedServerVerifier {
    pin: String,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if leaf_fingerprint(end_entity) == self.pin {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
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
