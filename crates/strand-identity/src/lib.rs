//! Certificate issuance for strand mesh workloads.
//!
//! This crate implements the core of the strand identity service: it turns a
//! cluster-issued service-account bearer token plus a certificate signing
//! request into a short-lived X.509 leaf certificate that workloads use for
//! mutual TLS inside the mesh.
//!
//! # Components
//!
//! - [`trust_domain`] - Deterministic naming of mesh identities
//! - [`creds`] - Issuer credential loading and chain verification
//! - [`ca`] - The issuing certificate authority and its validity windows
//! - [`token`] - Bearer-token validation against the cluster's review endpoint
//! - [`service`] - The token-authenticated signing-request handler

pub mod ca;
pub mod creds;
pub mod service;
pub mod token;
pub mod trust_domain;

pub use ca::{Ca, CaHandle, Validity};
pub use creds::{Certificate, Credentials, Crt, TrustAnchors};
pub use service::{IdentityService, IssuedCertificate};
pub use token::{AuthenticatedIdentity, TokenAuthenticator, TokenReviewer};
pub use trust_domain::TrustDomain;

/// Errors that can occur in identity operations.
///
/// Startup-fatal kinds (credential and trust-domain problems) and
/// per-request kinds (token and CSR problems) share this enum; the process
/// boundary decides which ones abort and which ones become RPC statuses.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Trust domain or namespace failed DNS validation.
    #[error("invalid trust domain: {0}")]
    InvalidTrustDomain(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// PEM decoding failed.
    #[error("PEM decode error: {0}")]
    PemDecode(String),

    /// The issuer private key is not a P-256 ECDSA key.
    #[error("issuer key must be a P-256 ECDSA key")]
    KeyTypeMismatch,

    /// The issuer private key does not match the issuer certificate.
    #[error("issuer key does not match the issuer certificate public key")]
    KeyCertPairMismatch,

    /// Chain construction did not reach a configured trust anchor.
    #[error("certificate chain does not reach a trust anchor: {0}")]
    ChainIncomplete(String),

    /// The certificate is not valid for the expected DNS name.
    #[error("certificate is not valid for '{expected}'")]
    NameMismatch { expected: String },

    /// The certificate has expired.
    #[error("certificate has expired")]
    Expired,

    /// The certificate is not yet valid.
    #[error("certificate is not yet valid")]
    NotYetValid,

    /// A signature in the chain failed verification.
    #[error("certificate verification failed: {0}")]
    SignatureInvalid(String),

    /// The signing request could not be decoded or its signature is bad.
    #[error("malformed certificate signing request: {0}")]
    MalformedCsr(String),

    /// The signing request carries a key this service does not issue for.
    #[error("unsupported key type: {0}")]
    UnsupportedKey(String),

    /// The CSR's DNS name does not bind to the authenticated identity.
    #[error("CSR is not valid for authenticated identity '{expected}' (requested: {requested})")]
    IdentityMismatch { expected: String, requested: String },

    /// The cluster rejected the token.
    #[error("token rejected by the cluster: {0}")]
    TokenInvalid(String),

    /// The token has expired.
    #[error("token has expired")]
    TokenExpired,

    /// The token was issued for an audience this service does not accept.
    #[error("token audience not accepted")]
    WrongAudience,

    /// The token authenticated something other than a service account.
    #[error("token does not authenticate a service account: {0}")]
    NotServiceAccount(String),

    /// The cluster's token review endpoint could not be reached. Retryable.
    #[error("token review unavailable: {0}")]
    ReviewUnavailable(String),

    /// Key generation or certificate signing failed.
    #[error("certificate signing failed: {0}")]
    Signing(String),
}

/// Result type for identity operations.
pub type Result<T> = std::result::Result<T, Error>;
