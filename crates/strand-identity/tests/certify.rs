//! End-to-end tests for the issuance pipeline.
//!
//! ```text
//! root CA → issuer CA → verified Credentials → spawned Ca
//!   → IdentityService::certify(token, csr)
//!     → leaf bound to the token identity, chain closing at the anchors
//! ```
//!
//! The cluster's token review is replaced with a stub so every
//! authentication outcome can be exercised deterministically.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::*;

use strand_identity::ca::generate_key;
use strand_identity::{
    AuthenticatedIdentity, Ca, CaHandle, Credentials, Crt, Error, IdentityService, TokenAuthenticator,
    TrustAnchors, TrustDomain, Validity,
};

const EXPECTED_SAN: &str = "books.emojivoto.serviceaccount.identity.strand.cluster.local";

/// A token authenticator with a canned answer, counting how often the
/// oracle was consulted.
struct StubAuthenticator {
    result: Box<dyn Fn() -> strand_identity::Result<AuthenticatedIdentity> + Send + Sync>,
    calls: AtomicUsize,
}

impl StubAuthenticator {
    fn attesting(service_account: &str, namespace: &str) -> Arc<Self> {
        let sa = service_account.to_string();
        let ns = namespace.to_string();
        Arc::new(Self {
            result: Box::new(move || {
                Ok(AuthenticatedIdentity {
                    service_account: sa.clone(),
                    namespace: ns.clone(),
                })
            }),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(make_error: impl Fn() -> Error + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            result: Box::new(move || Err(make_error())),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenAuthenticator for StubAuthenticator {
    async fn validate(&self, _token: &str) -> strand_identity::Result<AuthenticatedIdentity> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.result)()
    }
}

struct Harness {
    service: IdentityService<Arc<StubAuthenticator>>,
    authenticator: Arc<StubAuthenticator>,
    anchors: TrustAnchors,
}

/// Root + issuer CA with a 24h/2h issuance policy, fronted by a service
/// using the given authenticator.
fn harness(authenticator: Arc<StubAuthenticator>) -> Harness {
    let mut root = Ca::generate_root("root.cluster.local").unwrap();
    let anchors = TrustAnchors::from_pem(root.credentials().crt.certificate.to_pem()).unwrap();

    let validity = Validity {
        lifetime: Duration::from_secs(24 * 60 * 60),
        clock_skew_allowance: Duration::from_secs(2 * 60 * 60),
    };
    let issuer = root
        .generate_ca("identity.strand.cluster.local", validity, Some(0))
        .unwrap();

    // Round-trip the issuer credential through PEM and the verifier, the
    // way process startup loads it.
    let key = KeyPair::from_pem(&issuer.credentials().key_pem()).unwrap();
    let crt = Crt::from_pem(&issuer.credentials().crt.to_pem()).unwrap();
    let creds = Credentials::new(key, crt).unwrap();
    creds
        .crt
        .verify(&anchors, "identity.strand.cluster.local")
        .unwrap();

    let handle: CaHandle = Ca::new(creds, validity).spawn();
    let trust_domain = TrustDomain::new("strand", "cluster.local").unwrap();

    Harness {
        service: IdentityService::new(authenticator.clone(), handle, trust_domain),
        authenticator,
        anchors,
    }
}

fn p256_csr(dns_names: &[&str], common_name: &str) -> Vec<u8> {
    let key = generate_key().unwrap();
    let mut params =
        CertificateParams::new(dns_names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
            .unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    let csr = params.serialize_request(&key).unwrap();
    csr.der().as_ref().to_vec()
}

fn ed25519_csr(dns_names: &[&str]) -> Vec<u8> {
    let key = KeyPair::generate_for(&rcgen::PKCS_ED25519).unwrap();
    let params =
        CertificateParams::new(dns_names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
            .unwrap();
    let csr = params.serialize_request(&key).unwrap();
    csr.der().as_ref().to_vec()
}

fn leaf_dns_names(leaf_der: &[u8]) -> Vec<String> {
    let (_, cert) = parse_x509_certificate(leaf_der).unwrap();
    let mut names = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::DNSName(dns) = name {
                    names.push((*dns).to_string());
                }
            }
        }
    }
    names
}

fn leaf_serial(leaf_der: &[u8]) -> u64 {
    let (_, cert) = parse_x509_certificate(leaf_der).unwrap();
    cert.raw_serial()
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

#[tokio::test]
async fn happy_path_issues_a_bound_leaf() {
    let h = harness(StubAuthenticator::attesting("books", "emojivoto"));

    let csr = p256_csr(&[EXPECTED_SAN], EXPECTED_SAN);
    let issued = h.service.certify("token", &csr).await.unwrap();

    // Exactly the canonical name, nothing else.
    assert_eq!(leaf_dns_names(&issued.leaf_der), vec![EXPECTED_SAN]);

    // 24h lifetime plus 2h skew on both ends.
    let (_, cert) = parse_x509_certificate(&issued.leaf_der).unwrap();
    let window =
        cert.validity().not_after.timestamp() - cert.validity().not_before.timestamp();
    assert_eq!(window, 28 * 60 * 60);

    // The advertised expiry is the leaf's.
    assert_eq!(issued.expiry.timestamp(), cert.validity().not_after.timestamp());

    // Leaf plus returned intermediates chain to the trust anchors.
    let crt = Crt {
        certificate: strand_identity::Certificate::from_der(issued.leaf_der.clone()),
        chain: issued
            .intermediates_der
            .iter()
            .map(|der| strand_identity::Certificate::from_der(der.clone()))
            .collect(),
    };
    crt.verify(&h.anchors, EXPECTED_SAN).unwrap();

    assert_eq!(h.authenticator.calls(), 1);
}

#[tokio::test]
async fn csr_subject_never_reaches_the_leaf() {
    let h = harness(StubAuthenticator::attesting("books", "emojivoto"));

    // A hostile common name is overwritten by the authenticated identity.
    let csr = p256_csr(&[EXPECTED_SAN], "attacker.example.com");
    let issued = h.service.certify("token", &csr).await.unwrap();

    let (_, cert) = parse_x509_certificate(&issued.leaf_der).unwrap();
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap();
    assert_eq!(cn, EXPECTED_SAN);
    assert_eq!(leaf_dns_names(&issued.leaf_der), vec![EXPECTED_SAN]);
}

#[tokio::test]
async fn mismatched_san_is_rejected_without_consuming_a_serial() {
    let h = harness(StubAuthenticator::attesting("books", "emojivoto"));

    let good = p256_csr(&[EXPECTED_SAN], EXPECTED_SAN);
    let first = h.service.certify("token", &good).await.unwrap();
    assert_eq!(leaf_serial(&first.leaf_der), 1);

    let other = "ledger.emojivoto.serviceaccount.identity.strand.cluster.local";
    let bad = p256_csr(&[other], other);
    let result = h.service.certify("token", &bad).await;
    assert!(matches!(result, Err(Error::IdentityMismatch { .. })));

    // The failure consumed nothing.
    let second = h.service.certify("token", &good).await.unwrap();
    assert_eq!(leaf_serial(&second.leaf_der), 2);
}

#[tokio::test]
async fn san_comparison_ignores_ascii_case() {
    let h = harness(StubAuthenticator::attesting("books", "emojivoto"));

    let upper = "Books.Emojivoto.serviceaccount.identity.strand.cluster.local";
    let csr = p256_csr(&[upper], upper);
    let issued = h.service.certify("token", &csr).await.unwrap();

    // The issued SAN is the canonical spelling, not the client's.
    assert_eq!(leaf_dns_names(&issued.leaf_der), vec![EXPECTED_SAN]);
}

#[tokio::test]
async fn empty_san_list_is_an_identity_mismatch() {
    let h = harness(StubAuthenticator::attesting("books", "emojivoto"));

    let csr = p256_csr(&[], "no-sans-here");
    let result = h.service.certify("token", &csr).await;
    assert!(matches!(result, Err(Error::IdentityMismatch { .. })));
}

#[tokio::test]
async fn extra_sans_are_an_identity_mismatch() {
    let h = harness(StubAuthenticator::attesting("books", "emojivoto"));

    let csr = p256_csr(&[EXPECTED_SAN, "second.example.com"], EXPECTED_SAN);
    let result = h.service.certify("token", &csr).await;
    assert!(matches!(result, Err(Error::IdentityMismatch { .. })));
}

#[tokio::test]
async fn unsupported_key_is_rejected_before_the_oracle_is_consulted() {
    let h = harness(StubAuthenticator::attesting("books", "emojivoto"));

    let csr = ed25519_csr(&[EXPECTED_SAN]);
    let result = h.service.certify("token", &csr).await;
    assert!(matches!(result, Err(Error::UnsupportedKey(_))));
    assert_eq!(h.authenticator.calls(), 0);
}

#[tokio::test]
async fn malformed_csr_is_rejected_before_the_oracle_is_consulted() {
    let h = harness(StubAuthenticator::attesting("books", "emojivoto"));

    let result = h.service.certify("token", b"definitely not DER").await;
    assert!(matches!(result, Err(Error::MalformedCsr(_))));
    assert_eq!(h.authenticator.calls(), 0);
}

#[tokio::test]
async fn token_errors_propagate() {
    let h = harness(StubAuthenticator::failing(|| Error::TokenExpired));

    let csr = p256_csr(&[EXPECTED_SAN], EXPECTED_SAN);
    let result = h.service.certify("stale-token", &csr).await;
    assert!(matches!(result, Err(Error::TokenExpired)));
}

#[tokio::test]
async fn review_outage_is_reported_as_retryable() {
    let h = harness(StubAuthenticator::failing(|| {
        Error::ReviewUnavailable("connection refused".to_string())
    }));

    let csr = p256_csr(&[EXPECTED_SAN], EXPECTED_SAN);
    let result = h.service.certify("token", &csr).await;
    assert!(matches!(result, Err(Error::ReviewUnavailable(_))));
}
