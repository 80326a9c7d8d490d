//! TLS for explicit and implicit FTPS (RFC 4217).
//!
//! Handshakes never fail on an untrusted chain. The verifier records what it
//! saw ([`CertificateInfo`]) and lets the connection state machine decide:
//! trusted chains pass, untrusted ones go to the prompter unless their
//! fingerprint was already accepted during this operation.
//!
//! Each worker builds one [`ClientConfig`] and reuses it for the control and
//! data connections so data channels can resume the control session.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::CertificateInfo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// SHA-256 of a DER certificate, lowercase hex.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Fingerprints the user accepted, shared by all workers of an operation.
#[derive(Debug, Default)]
pub struct CertificateCache {
    accepted: Mutex<HashSet<String>>,
}

impl CertificateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&self, fingerprint: &str) {
        self.accepted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(fingerprint.to_ascii_lowercase());
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.accepted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&fingerprint.to_ascii_lowercase())
    }

    /// Trusted by the roots or accepted earlier.
    pub fn allows(&self, cert: &CertificateInfo) -> bool {
        cert.trusted || self.contains(&cert.fingerprint)
    }
}

// ─── Verifier ────────────────────────────────────────────────────────

/// Runs the webpki checks but only records their outcome.
#[derive(Debug)]
struct RecordingVerifier {
    provider: Arc<CryptoProvider>,
    webpki: Option<Arc<WebPkiServerVerifier>>,
    seen: Mutex<Option<CertificateInfo>>,
}

impl RecordingVerifier {
    fn new(provider: Arc<CryptoProvider>, roots: Arc<RootCertStore>) -> Self {
        let webpki = if roots.is_empty() {
            None
        } else {
            WebPkiServerVerifier::builder_with_provider(roots, Arc::clone(&provider))
                .build()
                .map_err(|e| log::warn!("TLS: cannot build chain verifier: {}", e))
                .ok()
        };
        Self {
            provider,
            webpki,
            seen: Mutex::new(None),
        }
    }

    fn take(&self) -> Option<CertificateInfo> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verdict = match &self.webpki {
            Some(v) => v
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .map(|_| ())
                .map_err(|e| e.to_string()),
            None => Err("no trusted root certificates available".to_string()),
        };
        let info = CertificateInfo {
            fingerprint: fingerprint(end_entity.as_ref()),
            trusted: verdict.is_ok(),
            verify_error: verdict.err(),
        };
        *self.seen.lock().unwrap_or_else(|e| e.into_inner()) = Some(info);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

// ─── Context ─────────────────────────────────────────────────────────

/// Crypto provider and trust roots of an operation.
#[derive(Debug, Clone)]
pub struct TlsContext {
    provider: Arc<CryptoProvider>,
    roots: Arc<RootCertStore>,
}

impl TlsContext {
    /// Trust the platform's root certificates.
    pub fn with_native_roots() -> Self {
        let loaded = rustls_native_certs::load_native_certs();
        for err in &loaded.errors {
            log::warn!("TLS: error loading native root certificates: {}", err);
        }
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
        log::debug!("TLS: {} native roots loaded, {} ignored", added, ignored);
        Self::with_roots(roots)
    }

    pub fn with_roots(roots: RootCertStore) -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            roots: Arc::new(roots),
        }
    }

    /// Session config for one worker.
    pub fn client_config(&self) -> FtpResult<Arc<ClientConfig>> {
        let verifier = Arc::new(RecordingVerifier::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.roots),
        ));
        let config = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| FtpError::tls_failed(format!("TLS config: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }

    /// Run a client handshake over `stream` using the session `config`.
    pub async fn connect<S>(
        &self,
        config: &Arc<ClientConfig>,
        server_name: &str,
        stream: S,
    ) -> FtpResult<(TlsStream<S>, CertificateInfo)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| FtpError::tls_failed(format!("invalid server name '{}': {}", server_name, e)))?;

        // fresh verifier per handshake, same session store
        let verifier = Arc::new(RecordingVerifier::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.roots),
        ));
        let mut handshake_config = (**config).clone();
        handshake_config
            .dangerous()
            .set_certificate_verifier(Arc::clone(&verifier) as Arc<dyn ServerCertVerifier>);

        let tls = TlsConnector::from(Arc::new(handshake_config))
            .connect(name, stream)
            .await
            .map_err(|e| FtpError::tls_failed(format!("TLS handshake failed: {}", e)))?;

        // a resumed session skips certificate verification
        let info = verifier.take().unwrap_or_else(|| resumed_info(&tls));
        Ok((tls, info))
    }
}

fn resumed_info<S>(tls: &TlsStream<S>) -> CertificateInfo {
    let (_, conn) = tls.get_ref();
    let fp = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|c| fingerprint(c.as_ref()))
        .unwrap_or_default();
    CertificateInfo {
        fingerprint: fp,
        trusted: false,
        verify_error: Some("resumed session".into()),
    }
}
