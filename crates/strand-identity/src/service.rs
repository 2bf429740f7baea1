//! The token-authenticated signing-request handler.
//!
//! One call to [`IdentityService::certify`] is the whole issuance pipeline:
//! decode the CSR, authenticate the bearer token with the cluster, check
//! that the CSR's DNS name is exactly the authenticated workload's canonical
//! name, normalize the request, and sign it through the CA task.
//!
//! Identity binding is the security contract here: whatever a client puts in
//! its CSR, the issued certificate's subject and single DNS SAN are forced
//! to the name derived from the *token's* identity, never the CSR's.

use chrono::{DateTime, Utc};
use rcgen::{CertificateSigningRequestParams, DistinguishedName, DnType, SanType};
use rustls_pki_types::CertificateSigningRequestDer;
use tracing::{info, warn};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use crate::ca::CaHandle;
use crate::token::TokenAuthenticator;
use crate::trust_domain::{dns_names_equal, TrustDomain};
use crate::{Error, Result};

/// The public-key algorithm this service issues for: id-ecPublicKey.
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
/// The only accepted curve: prime256v1 (P-256).
const OID_CURVE_P256: &str = "1.2.840.10045.3.1.7";

/// A successfully issued certificate, ready for the wire.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// DER-encoded leaf certificate.
    pub leaf_der: Vec<u8>,
    /// DER-encoded intermediates, nearest issuer first, trust anchors
    /// excluded.
    pub intermediates_der: Vec<Vec<u8>>,
    /// The leaf's not-after time.
    pub expiry: DateTime<Utc>,
}

/// Issues workload certificates after authenticating each request.
pub struct IdentityService<A> {
    authenticator: A,
    ca: CaHandle,
    trust_domain: TrustDomain,
}

impl<A: TokenAuthenticator> IdentityService<A> {
    /// Creates a service issuing under `trust_domain`, authenticating with
    /// `authenticator`, and signing through `ca`.
    pub fn new(authenticator: A, ca: CaHandle, trust_domain: TrustDomain) -> Self {
        Self {
            authenticator,
            ca,
            trust_domain,
        }
    }

    /// Returns the trust domain this service issues under.
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// Authenticates `token`, binds the resulting identity to `csr_der`, and
    /// returns a signed leaf with the issuer chain.
    ///
    /// No serial is consumed on any failure path.
    pub async fn certify(&self, token: &str, csr_der: &[u8]) -> Result<IssuedCertificate> {
        // CSR shape and key type are checked before spending a round-trip
        // on the token review.
        let requested_names = inspect_csr(csr_der)?;

        let identity = self.authenticator.validate(token).await?;
        let expected = self
            .trust_domain
            .workload_identity(&identity.service_account, &identity.namespace)?;

        match requested_names.as_slice() {
            [only] if dns_names_equal(only, &expected) => {}
            _ => {
                warn!(
                    expected = %expected,
                    requested = requested_names.len(),
                    "rejecting CSR whose DNS names do not bind to the token identity"
                );
                return Err(Error::IdentityMismatch {
                    expected,
                    requested: requested_names.join(", "),
                });
            }
        }

        // Normalize: the issued certificate names exactly the authenticated
        // identity. IP, URI, and email SANs are not part of this profile.
        let mut csr = CertificateSigningRequestParams::from_der(
            &CertificateSigningRequestDer::from(csr_der.to_vec()),
        )
        .map_err(|e| Error::MalformedCsr(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, expected.clone());
        csr.params.distinguished_name = dn;
        let san = rcgen::string::Ia5String::try_from(expected.clone())
            .map_err(|e| Error::Signing(format!("derived name is not IA5: {e}")))?;
        csr.params.subject_alt_names = vec![SanType::DnsName(san)];

        let crt = self.ca.sign_end_entity(csr).await?;
        let expiry = crt.expiry()?;

        info!(identity = %expected, %expiry, "issued certificate");

        Ok(IssuedCertificate {
            leaf_der: crt.certificate.der().to_vec(),
            intermediates_der: crt.chain.iter().map(|c| c.der().to_vec()).collect(),
            expiry,
        })
    }
}

/// Decodes a CSR, verifies its self-signature (proof of key possession),
/// enforces the P-256 profile, and returns its requested DNS names.
fn inspect_csr(csr_der: &[u8]) -> Result<Vec<String>> {
    let (rest, csr) = X509CertificationRequest::from_der(csr_der)
        .map_err(|e| Error::MalformedCsr(e.to_string()))?;
    if !rest.is_empty() {
        return Err(Error::MalformedCsr(
            "trailing bytes after CSR".to_string(),
        ));
    }

    csr.verify_signature()
        .map_err(|e| Error::MalformedCsr(format!("signature verification failed: {e}")))?;

    ensure_p256(&csr)?;

    Ok(requested_dns_names(&csr))
}

fn ensure_p256(csr: &X509CertificationRequest<'_>) -> Result<()> {
    let algorithm = &csr.certification_request_info.subject_pki.algorithm;

    let key_oid = algorithm.algorithm.to_id_string();
    if key_oid != OID_EC_PUBLIC_KEY {
        return Err(Error::UnsupportedKey(format!(
            "public key algorithm {key_oid} is not id-ecPublicKey"
        )));
    }

    let curve = algorithm
        .parameters
        .as_ref()
        .and_then(|p| p.as_oid().ok())
        .map(|oid| oid.to_id_string());
    match curve {
        Some(oid) if oid == OID_CURVE_P256 => Ok(()),
        Some(oid) => Err(Error::UnsupportedKey(format!(
            "EC curve {oid} is not P-256"
        ))),
        None => Err(Error::UnsupportedKey(
            "EC key does not name a curve".to_string(),
        )),
    }
}

fn requested_dns_names(csr: &X509CertificationRequest<'_>) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(extensions) = csr.requested_extensions() {
        for ext in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                for name in &san.general_names {
                    if let GeneralName::DNSName(dns) = name {
                        names.push((*dns).to_string());
                    }
                }
            }
        }
    }
    names
}
