//! Issuer credentials: PEM loading, key/cert pairing, chain verification.
//!
//! The issuer credential is loaded once at startup from `key.pem` and
//! `crt.pem`, checked against the configured trust anchors under the
//! identity service's own DNS name, and then shared read-only with the
//! issuing CA for the lifetime of the process.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use rcgen::{KeyPair, PublicKeyData};
use rustls_pki_types::{CertificateDer, ServerName, TrustAnchor, UnixTime};
use webpki::{anchor_from_trusted_cert, EndEntityCert, KeyUsage};
use x509_parser::prelude::*;

use crate::{Error, Result};

/// An X.509 certificate held as DER with a cached PEM rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    pem: String,
}

impl Certificate {
    /// Creates a certificate from DER-encoded bytes.
    pub fn from_der(der: Vec<u8>) -> Self {
        let pem = ::pem::encode(&::pem::Pem::new("CERTIFICATE", der.clone()));
        Self { der, pem }
    }

    /// Returns the DER-encoded certificate.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Returns the PEM-encoded certificate.
    pub fn to_pem(&self) -> &str {
        &self.pem
    }

    /// Returns the certificate's not-after (expiry) time.
    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        let (_, cert) = parse_x509_certificate(&self.der)
            .map_err(|e| Error::SignatureInvalid(format!("failed to parse certificate: {e}")))?;

        let timestamp = cert.validity().not_after.timestamp();
        DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| Error::SignatureInvalid("invalid not_after timestamp".to_string()))
    }

    /// Returns the certificate's not-before time.
    pub fn not_before(&self) -> Result<DateTime<Utc>> {
        let (_, cert) = parse_x509_certificate(&self.der)
            .map_err(|e| Error::SignatureInvalid(format!("failed to parse certificate: {e}")))?;

        let timestamp = cert.validity().not_before.timestamp();
        DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| Error::SignatureInvalid("invalid not_before timestamp".to_string()))
    }
}

/// A certificate together with the intermediates that link it toward the
/// trust anchors. The anchors themselves are never part of the chain.
#[derive(Debug, Clone)]
pub struct Crt {
    /// The end certificate.
    pub certificate: Certificate,
    /// Intermediates, nearest issuer first.
    pub chain: Vec<Certificate>,
}

impl Crt {
    /// Parses a PEM bundle: the first certificate is the end certificate,
    /// any following ones are its intermediates in order.
    pub fn from_pem(bundle: &str) -> Result<Self> {
        let mut certs = parse_pem_certificates(bundle)?;
        if certs.is_empty() {
            return Err(Error::PemDecode(
                "no certificates in PEM bundle".to_string(),
            ));
        }
        let certificate = certs.remove(0);
        Ok(Self {
            certificate,
            chain: certs,
        })
    }

    /// Renders the end certificate followed by its chain as PEM.
    pub fn to_pem(&self) -> String {
        let mut out = self.certificate.to_pem().to_string();
        for c in &self.chain {
            out.push_str(c.to_pem());
        }
        out
    }

    /// Expiry of the end certificate.
    pub fn expiry(&self) -> Result<DateTime<Utc>> {
        self.certificate.not_after()
    }

    /// Verifies that this certificate chains to one of `anchors` through its
    /// embedded intermediates and is valid for `expected_name` right now.
    pub fn verify(&self, anchors: &TrustAnchors, expected_name: &str) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::SignatureInvalid(format!("system clock error: {e}")))?;

        // Check the validity window first so expiry surfaces as its own
        // error kind rather than a generic chain failure.
        let (_, cert) = parse_x509_certificate(self.certificate.der())
            .map_err(|e| Error::SignatureInvalid(format!("failed to parse certificate: {e}")))?;
        let now_secs = now.as_secs() as i64;
        if cert.validity().not_after.timestamp() < now_secs {
            return Err(Error::Expired);
        }
        if cert.validity().not_before.timestamp() > now_secs {
            return Err(Error::NotYetValid);
        }

        let leaf = CertificateDer::from(self.certificate.der().to_vec());
        let ee = EndEntityCert::try_from(&leaf)
            .map_err(|e| Error::SignatureInvalid(format!("failed to parse certificate: {e:?}")))?;

        let intermediates: Vec<CertificateDer<'static>> = self
            .chain
            .iter()
            .map(|c| CertificateDer::from(c.der().to_vec()))
            .collect();

        ee.verify_for_usage(
            webpki::ALL_VERIFICATION_ALGS,
            anchors.webpki_anchors(),
            &intermediates,
            UnixTime::since_unix_epoch(now),
            KeyUsage::server_auth(),
            None,
            None,
        )
        .map_err(|e| match e {
            webpki::Error::UnknownIssuer => Error::ChainIncomplete(
                "no path from certificate to a configured trust anchor".to_string(),
            ),
            other => Error::SignatureInvalid(format!("{other:?}")),
        })?;

        let name = ServerName::try_from(expected_name).map_err(|_| Error::NameMismatch {
            expected: expected_name.to_string(),
        })?;
        ee.verify_is_valid_for_subject_name(&name)
            .map_err(|_| Error::NameMismatch {
                expected: expected_name.to_string(),
            })?;

        Ok(())
    }
}

/// A bound private key and certificate, plus the certificate's chain.
///
/// Construction enforces the issuance profile: the key is P-256 ECDSA and
/// its public half equals the certificate's subject public key. Read-only
/// once constructed.
pub struct Credentials {
    pub(crate) key: KeyPair,
    pub crt: Crt,
}

impl Credentials {
    /// Binds `key` to `crt`, checking key type and pairing.
    pub fn new(key: KeyPair, crt: Crt) -> Result<Self> {
        if !key.is_compatible(&rcgen::PKCS_ECDSA_P256_SHA256) {
            return Err(Error::KeyTypeMismatch);
        }

        let (_, cert) = parse_x509_certificate(crt.certificate.der())
            .map_err(|e| Error::PemDecode(format!("failed to parse certificate: {e}")))?;
        if !public_keys_match(&key, cert.public_key()) {
            return Err(Error::KeyCertPairMismatch);
        }

        Ok(Self { key, crt })
    }

    /// Loads credentials from PEM files on disk.
    ///
    /// `crt_path` may contain intermediates after the end certificate.
    pub fn load(key_path: impl AsRef<Path>, crt_path: impl AsRef<Path>) -> Result<Self> {
        let key_pem = std::fs::read_to_string(key_path)?;
        let crt_pem = std::fs::read_to_string(crt_path)?;

        let key = KeyPair::from_pem(&key_pem)
            .map_err(|e| Error::PemDecode(format!("failed to parse private key: {e}")))?;
        let crt = Crt::from_pem(&crt_pem)?;

        Self::new(key, crt)
    }

    /// Returns the PEM-encoded private key.
    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &"[REDACTED]")
            .field("crt", &self.crt)
            .finish()
    }
}

/// The set of self-signed roots this service trusts, loaded once at startup.
#[derive(Debug)]
pub struct TrustAnchors {
    roots: Vec<Certificate>,
    anchors: Vec<TrustAnchor<'static>>,
}

impl TrustAnchors {
    /// Parses a PEM bundle of root certificates.
    pub fn from_pem(bundle: &str) -> Result<Self> {
        let roots = parse_pem_certificates(bundle)?;
        if roots.is_empty() {
            return Err(Error::PemDecode(
                "no certificates in trust anchor bundle".to_string(),
            ));
        }

        let mut anchors = Vec::with_capacity(roots.len());
        for cert in &roots {
            let der = CertificateDer::from(cert.der().to_vec());
            let anchor = anchor_from_trusted_cert(&der)
                .map_err(|e| Error::PemDecode(format!("failed to parse trust anchor: {e:?}")))?;
            anchors.push(anchor.to_owned());
        }

        Ok(Self { roots, anchors })
    }

    /// Returns the root certificates.
    pub fn roots(&self) -> &[Certificate] {
        &self.roots
    }

    pub(crate) fn webpki_anchors(&self) -> &[TrustAnchor<'static>] {
        &self.anchors
    }
}

fn public_keys_match(key: &KeyPair, spki: &SubjectPublicKeyInfo<'_>) -> bool {
    let pk = key.der_bytes();
    spki.subject_public_key.data.as_ref() == pk || spki.raw == pk
}

/// Parses every CERTIFICATE block in a PEM bundle, in order.
fn parse_pem_certificates(bundle: &str) -> Result<Vec<Certificate>> {
    let blocks = ::pem::parse_many(bundle).map_err(|e| Error::PemDecode(e.to_string()))?;
    Ok(blocks
        .into_iter()
        .filter(|b| b.tag() == "CERTIFICATE")
        .map(|b| Certificate::from_der(b.into_contents()))
        .collect())
}
