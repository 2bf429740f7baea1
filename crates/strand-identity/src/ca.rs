//! The issuing certificate authority.
//!
//! A [`Ca`] holds one verified credential and a monotonically increasing
//! serial counter. Every certificate it produces follows a single profile:
//! ECDSA P-256 with SHA-256, serverAuth + clientAuth, with a validity window
//! padded by a clock-skew allowance on both ends.
//!
//! Issuance is not reentrant: the counter must have exactly one owner. Use
//! [`Ca::spawn`] to move the CA into a dedicated task and issue through the
//! cloneable [`CaHandle`].

use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::creds::{Certificate, Credentials, Crt};
use crate::{Error, Result};

/// Issued certificates are valid for one year unless configured otherwise.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Everything that processes issued certificates must have a clock that is
/// off by no more than this in either direction.
pub const DEFAULT_CLOCK_SKEW_ALLOWANCE: Duration = Duration::from_secs(2 * 60 * 60);

/// Configures the validity window of issued certificates.
///
/// Zero-valued fields mean "use the default": a one-year lifetime and a
/// two-hour clock-skew allowance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Validity {
    /// How long issued certificates remain valid, excluding skew padding.
    pub lifetime: Duration,
    /// Symmetric padding applied to both ends of the window.
    pub clock_skew_allowance: Duration,
}

impl Validity {
    /// Computes (not-before, not-after) for a certificate issued at `now`.
    pub fn window(&self, now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
        let lifetime = if self.lifetime.is_zero() {
            DEFAULT_LIFETIME
        } else {
            self.lifetime
        };
        let skew = if self.clock_skew_allowance.is_zero() {
            DEFAULT_CLOCK_SKEW_ALLOWANCE
        } else {
            self.clock_skew_allowance
        };
        (now - skew, now + lifetime + skew)
    }
}

/// Generates a new P-256 ECDSA private key.
pub fn generate_key() -> Result<KeyPair> {
    KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| Error::Signing(format!("key generation failed: {e}")))
}

/// A certificate authority for mesh workload certificates.
///
/// Construction from already-validated [`Credentials`] cannot fail; every
/// failure mode belongs to the credential loader. Issuing certificates
/// concurrently is not supported; see [`Ca::spawn`].
pub struct Ca {
    creds: Credentials,
    validity: Validity,
    /// Serial of the next certificate to issue. Serials are never reused,
    /// and the counter only advances after a successful signature.
    next_serial: u64,
}

impl Ca {
    /// Creates a CA from verified credentials.
    pub fn new(creds: Credentials, validity: Validity) -> Self {
        Self {
            creds,
            validity,
            next_serial: 1,
        }
    }

    /// Returns the CA's credentials.
    pub fn credentials(&self) -> &Credentials {
        &self.creds
    }

    /// Self-signs a root CA certificate for `key` under `name`.
    ///
    /// The root consumes serial 1, so the returned CA issues from serial 2.
    pub fn create_root(name: &str, key: KeyPair, validity: Validity) -> Result<Ca> {
        let mut params = template(1, &validity)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        // Path length is unrestricted at the root.
        shape_ca(&mut params, None);

        let cert = params
            .self_signed(&key)
            .map_err(|e| Error::Signing(format!("root certificate generation failed: {e}")))?;

        let crt = Crt {
            certificate: Certificate::from_der(cert.der().to_vec()),
            chain: vec![],
        };
        let creds = Credentials::new(key, crt)?;

        Ok(Ca {
            creds,
            validity,
            next_serial: 2,
        })
    }

    /// Generates a fresh key and self-signs a root CA with default validity.
    pub fn generate_root(name: &str) -> Result<Ca> {
        let key = generate_key()?;
        Self::create_root(name, key, Validity::default())
    }

    /// Generates an intermediate CA signed by this one.
    ///
    /// `max_path_len` of `None` leaves the path length unrestricted;
    /// `Some(0)` restricts the child to signing end entities only. The name
    /// is carried both as the subject common name and as a DNS SAN so the
    /// child credential can later be verified under it.
    pub fn generate_ca(
        &mut self,
        name: &str,
        validity: Validity,
        max_path_len: Option<u8>,
    ) -> Result<Ca> {
        let key = generate_key()?;
        let serial = self.next_serial;

        let mut params = template(serial, &self.validity)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        let san = rcgen::string::Ia5String::try_from(name.to_string())
            .map_err(|e| Error::Signing(format!("invalid CA name: {e}")))?;
        params.subject_alt_names = vec![rcgen::SanType::DnsName(san)];
        shape_ca(&mut params, max_path_len);

        let cert = {
            let issuer =
                Issuer::from_ca_cert_pem(self.creds.crt.certificate.to_pem(), &self.creds.key)
                    .map_err(|e| Error::Signing(format!("failed to load issuer: {e}")))?;
            params
                .signed_by(&key, &issuer)
                .map_err(|e| Error::Signing(format!("CA certificate signing failed: {e}")))?
        };

        self.advance_serial();

        let creds = Credentials::new(
            key,
            Crt {
                certificate: Certificate::from_der(cert.der().to_vec()),
                chain: self.issued_chain(),
            },
        )?;

        Ok(Ca::new(creds, validity))
    }

    /// Generates a fresh keypair and an end-entity certificate for
    /// `dns_name`, signed by this CA.
    pub fn generate_end_entity_creds(&mut self, dns_name: &str) -> Result<Credentials> {
        let key = generate_key()?;

        let mut params = CertificateParams::new(vec![dns_name.to_string()])
            .map_err(|e| Error::Signing(format!("failed to create params: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, dns_name);
        params.distinguished_name = dn;

        let csr = params
            .serialize_request(&key)
            .map_err(|e| Error::Signing(format!("CSR serialization failed: {e}")))?;
        let csr_params = CertificateSigningRequestParams::from_der(csr.der())
            .map_err(|e| Error::Signing(format!("failed to re-parse CSR: {e}")))?;

        let crt = self.sign_end_entity(csr_params)?;
        Credentials::new(key, crt)
    }

    /// Signs an end-entity certificate for the given signing request.
    ///
    /// The request's subject and subject alternative names are carried into
    /// the issued certificate as-is; callers bind them to an authenticated
    /// identity before signing. Everything else comes from the issuance
    /// profile: the next serial, the validity window, fixed key usages, and
    /// an ECDSA-P256-SHA256 signature.
    ///
    /// On error the serial counter is unchanged.
    pub fn sign_end_entity(&mut self, mut csr: CertificateSigningRequestParams) -> Result<Crt> {
        if csr.public_key.algorithm() != &rcgen::PKCS_ECDSA_P256_SHA256 {
            return Err(Error::UnsupportedKey(
                "signing request public key must be P-256 ECDSA".to_string(),
            ));
        }

        let serial = self.next_serial;
        let now = OffsetDateTime::now_utc();
        let (not_before, not_after) = self.validity.window(now);

        csr.params.serial_number = Some(serial_number(serial));
        csr.params.not_before = not_before;
        csr.params.not_after = not_after;
        csr.params.is_ca = IsCa::NoCa;
        csr.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let cert = {
            let issuer =
                Issuer::from_ca_cert_pem(self.creds.crt.certificate.to_pem(), &self.creds.key)
                    .map_err(|e| Error::Signing(format!("failed to load issuer: {e}")))?;
            csr.signed_by(&issuer)
                .map_err(|e| Error::Signing(format!("certificate signing failed: {e}")))?
        };

        self.advance_serial();

        Ok(Crt {
            certificate: Certificate::from_der(cert.der().to_vec()),
            chain: self.issued_chain(),
        })
    }

    /// Moves the CA into a dedicated task and returns a handle for issuing
    /// through it. All signing is serialized through that task, which is
    /// what keeps the serial counter single-owner under concurrent load.
    pub fn spawn(mut self) -> CaHandle {
        let (tx, mut rx) = mpsc::channel::<SignJob>(64);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                // The requester may have disconnected while the job sat in
                // the queue. Skipping it here keeps the serial unconsumed.
                if job.reply.is_closed() {
                    debug!("discarding signing job from disconnected requester");
                    continue;
                }
                let result = self.sign_end_entity(job.csr);
                let _ = job.reply.send(result);
            }
        });
        CaHandle { tx }
    }

    /// The chain distributed with certificates this CA issues: its own
    /// certificate followed by its intermediates. Trust anchors are never
    /// included.
    fn issued_chain(&self) -> Vec<Certificate> {
        let mut chain = Vec::with_capacity(1 + self.creds.crt.chain.len());
        chain.push(self.creds.crt.certificate.clone());
        chain.extend(self.creds.crt.chain.iter().cloned());
        chain
    }

    fn advance_serial(&mut self) {
        // Serial reuse is never acceptable. Overflow means the counter
        // invariant is gone, so abort instead of wrapping to 0.
        self.next_serial = self
            .next_serial
            .checked_add(1)
            .expect("certificate serial counter overflow");
    }
}

struct SignJob {
    csr: CertificateSigningRequestParams,
    reply: oneshot::Sender<Result<Crt>>,
}

/// A cloneable handle to a [spawned](Ca::spawn) certificate authority.
#[derive(Clone)]
pub struct CaHandle {
    tx: mpsc::Sender<SignJob>,
}

impl CaHandle {
    /// Signs an end-entity certificate through the owning task.
    pub async fn sign_end_entity(&self, csr: CertificateSigningRequestParams) -> Result<Crt> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SignJob { csr, reply })
            .await
            .map_err(|_| Error::Signing("certificate authority task stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Signing("certificate authority task stopped".to_string()))?
    }
}

/// Returns a certificate template for a non-CA certificate with no subject
/// and no subjectAltNames; the caller shapes it into a root, intermediate,
/// or end-entity certificate.
///
/// ECDSA P-256 with SHA-256 is the only profile this service produces: CA
/// and end-entity certificates use the same algorithm, and a larger digest
/// would be truncated to the length of a P-256 scalar anyway.
fn template(serial: u64, validity: &Validity) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(vec![])
        .map_err(|e| Error::Signing(format!("failed to create params: {e}")))?;

    let (not_before, not_after) = validity.window(OffsetDateTime::now_utc());
    params.not_before = not_before;
    params.not_after = not_after;
    params.serial_number = Some(serial_number(serial));
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    Ok(params)
}

/// Shapes a template into a CA certificate. `None` leaves the path length
/// unrestricted; `Some(0)` is an explicit zero, not an absent value.
fn shape_ca(params: &mut CertificateParams, max_path_len: Option<u8>) {
    params.is_ca = match max_path_len {
        Some(n) => IsCa::Ca(BasicConstraints::Constrained(n)),
        None => IsCa::Ca(BasicConstraints::Unconstrained),
    };
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
}

/// Encodes a serial as its minimal big-endian byte string.
fn serial_number(serial: u64) -> SerialNumber {
    let bytes = serial.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(7);
    SerialNumber::from_slice(&bytes[first..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::Validity;
    use x509_parser::prelude::*;

    fn make_csr(dns_name: &str) -> CertificateSigningRequestParams {
        let key = generate_key().unwrap();
        let mut params = CertificateParams::new(vec![dns_name.to_string()]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, dns_name);
        params.distinguished_name = dn;
        let csr = params.serialize_request(&key).unwrap();
        CertificateSigningRequestParams::from_der(csr.der()).unwrap()
    }

    fn make_ed25519_csr(dns_name: &str) -> CertificateSigningRequestParams {
        let key = KeyPair::generate_for(&rcgen::PKCS_ED25519).unwrap();
        let params = CertificateParams::new(vec![dns_name.to_string()]).unwrap();
        let csr = params.serialize_request(&key).unwrap();
        CertificateSigningRequestParams::from_der(csr.der()).unwrap()
    }

    fn leaf_serial(crt: &Crt) -> u64 {
        let (_, cert) = parse_x509_certificate(crt.certificate.der()).unwrap();
        cert.raw_serial()
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }

    #[test]
    fn window_substitutes_defaults_for_zero() {
        let now = OffsetDateTime::now_utc();
        let (start, end) = Validity::default().window(now);
        assert_eq!(start, now - DEFAULT_CLOCK_SKEW_ALLOWANCE);
        assert_eq!(end, now + DEFAULT_LIFETIME + DEFAULT_CLOCK_SKEW_ALLOWANCE);
        assert!(start < end);
    }

    #[test]
    fn window_uses_configured_durations() {
        let validity = Validity {
            lifetime: Duration::from_secs(24 * 60 * 60),
            clock_skew_allowance: Duration::from_secs(2 * 60 * 60),
        };
        let now = OffsetDateTime::now_utc();
        let (start, end) = validity.window(now);
        // 24h lifetime padded by 2h skew on both ends.
        assert_eq!(end - start, ::time::Duration::hours(28));
    }

    #[test]
    fn root_consumes_serial_one() {
        let mut root = Ca::generate_root("root.test.local").unwrap();
        let creds = root.generate_end_entity_creds("a.test.local").unwrap();
        assert_eq!(leaf_serial(&creds.crt), 2);
    }

    #[test]
    fn fresh_ca_issues_strictly_increasing_serials() {
        let mut root = Ca::generate_root("root.test.local").unwrap();
        let mut issuer = root
            .generate_ca("identity.strand.cluster.local", Validity::default(), Some(0))
            .unwrap();

        let first = issuer.generate_end_entity_creds("a.test.local").unwrap();
        let second = issuer.generate_end_entity_creds("b.test.local").unwrap();
        assert_eq!(leaf_serial(&first.crt), 1);
        assert_eq!(leaf_serial(&second.crt), 2);
    }

    #[test]
    fn failed_sign_does_not_consume_a_serial() {
        let mut root = Ca::generate_root("root.test.local").unwrap();
        let mut issuer = root
            .generate_ca("identity.strand.cluster.local", Validity::default(), Some(0))
            .unwrap();

        let result = issuer.sign_end_entity(make_ed25519_csr("a.test.local"));
        assert!(matches!(result, Err(crate::Error::UnsupportedKey(_))));

        let crt = issuer.sign_end_entity(make_csr("a.test.local")).unwrap();
        assert_eq!(leaf_serial(&crt), 1);
    }

    #[test]
    fn issued_leaf_has_fixed_profile() {
        let mut root = Ca::generate_root("root.test.local").unwrap();
        let crt = root
            .sign_end_entity(make_csr("web.test.local"))
            .unwrap();

        let (_, cert) = parse_x509_certificate(crt.certificate.der()).unwrap();

        // ecdsa-with-SHA256
        assert_eq!(
            cert.signature_algorithm.algorithm.to_id_string(),
            "1.2.840.10045.4.3.2"
        );

        let ku = cert.key_usage().unwrap().unwrap();
        assert!(ku.value.digital_signature());
        assert!(ku.value.key_encipherment());
        assert!(!ku.value.key_cert_sign());

        let eku = cert.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.server_auth);
        assert!(eku.value.client_auth);

        assert!(!cert.is_ca());
    }

    #[test]
    fn issued_leaf_window_spans_lifetime_plus_double_skew() {
        let validity = Validity {
            lifetime: Duration::from_secs(24 * 60 * 60),
            clock_skew_allowance: Duration::from_secs(2 * 60 * 60),
        };
        let mut root = Ca::generate_root("root.test.local").unwrap();
        let mut issuer = root
            .generate_ca("identity.strand.cluster.local", validity, Some(0))
            .unwrap();

        let crt = issuer.sign_end_entity(make_csr("web.test.local")).unwrap();
        let not_before = crt.certificate.not_before().unwrap();
        let not_after = crt.certificate.not_after().unwrap();
        assert_eq!((not_after - not_before).num_hours(), 28);
    }

    #[test]
    fn issued_chain_excludes_the_root() {
        let mut root = Ca::generate_root("root.test.local").unwrap();
        let mut issuer = root
            .generate_ca("identity.strand.cluster.local", Validity::default(), Some(0))
            .unwrap();

        let crt = issuer.sign_end_entity(make_csr("web.test.local")).unwrap();
        // The issuer itself is the only intermediate; the root stays with
        // the trust anchors.
        assert_eq!(crt.chain.len(), 1);
        assert_eq!(
            crt.chain[0].der(),
            issuer.credentials().crt.certificate.der()
        );
    }

    #[tokio::test]
    async fn spawned_ca_signs_through_handle() {
        let mut root = Ca::generate_root("root.test.local").unwrap();
        let issuer = root
            .generate_ca("identity.strand.cluster.local", Validity::default(), Some(0))
            .unwrap();
        let handle = issuer.spawn();

        let first = handle.sign_end_entity(make_csr("a.test.local")).await.unwrap();
        let second = handle.sign_end_entity(make_csr("b.test.local")).await.unwrap();
        assert_eq!(leaf_serial(&first), 1);
        assert_eq!(leaf_serial(&second), 2);
    }
}
