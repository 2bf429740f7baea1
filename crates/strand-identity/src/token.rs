//! Bearer-token validation against the cluster's token review endpoint.
//!
//! Workloads authenticate to the identity service with the bearer token the
//! cluster mounted for their service account. This module posts that token
//! to the cluster's `authentication.k8s.io/v1` review endpoint and, when the
//! cluster vouches for it, extracts the service-account coordinates from the
//! attested principal.
//!
//! The reviewer is stateless across requests and may be shared freely
//! between concurrent handlers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Deadline for one review round-trip. Exceeding it is reported as
/// retryable.
const REVIEW_TIMEOUT: Duration = Duration::from_secs(5);

/// Prefix the cluster uses for service-account principals.
const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

const IN_CLUSTER_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const IN_CLUSTER_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// The identity the cluster attested for a bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity {
    /// Service-account name.
    pub service_account: String,
    /// Namespace the service account lives in.
    pub namespace: String,
}

/// Turns bearer tokens into authenticated identities.
#[async_trait]
pub trait TokenAuthenticator: Send + Sync {
    /// Validates `token` and returns the identity the cluster attests for
    /// it.
    async fn validate(&self, token: &str) -> Result<AuthenticatedIdentity>;
}

#[async_trait]
impl<T: TokenAuthenticator + ?Sized> TokenAuthenticator for Arc<T> {
    async fn validate(&self, token: &str) -> Result<AuthenticatedIdentity> {
        T::validate(self, token).await
    }
}

/// A [`TokenAuthenticator`] backed by the cluster's token review endpoint.
pub struct TokenReviewer {
    client: reqwest::Client,
    review_url: String,
    bearer: String,
    audience: Option<String>,
}

impl TokenReviewer {
    /// Builds a reviewer from the conventional in-cluster environment: the
    /// API server address from `KUBERNETES_SERVICE_HOST`, and this pod's own
    /// service-account token and cluster CA from their mount paths.
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            Error::ReviewUnavailable("KUBERNETES_SERVICE_HOST is not set".to_string())
        })?;
        let port =
            std::env::var("KUBERNETES_SERVICE_PORT_HTTPS").unwrap_or_else(|_| "443".to_string());

        let bearer = std::fs::read_to_string(IN_CLUSTER_TOKEN_PATH)?
            .trim()
            .to_string();
        let ca_pem = std::fs::read(IN_CLUSTER_CA_PATH)?;

        Self::build(
            format!("https://{host}:{port}"),
            bearer,
            Some(&ca_pem),
        )
    }

    /// Builds a reviewer from a kubeconfig file, honoring the current
    /// context's cluster address, certificate authority, and user token.
    pub fn from_kubeconfig(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: KubeConfig = serde_yaml::from_str(&raw)
            .map_err(|e| Error::ReviewUnavailable(format!("invalid kubeconfig: {e}")))?;
        Self::from_kubeconfig_parts(config)
    }

    /// Restricts accepted tokens to ones issued for `audience`.
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    fn from_kubeconfig_parts(config: KubeConfig) -> Result<Self> {
        let context_name = config
            .current_context
            .clone()
            .or_else(|| config.contexts.first().map(|c| c.name.clone()))
            .ok_or_else(|| {
                Error::ReviewUnavailable("kubeconfig has no usable context".to_string())
            })?;
        let context = config
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .map(|c| &c.context)
            .ok_or_else(|| {
                Error::ReviewUnavailable(format!("kubeconfig context '{context_name}' not found"))
            })?;

        let cluster = config
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| {
                Error::ReviewUnavailable(format!(
                    "kubeconfig cluster '{}' not found",
                    context.cluster
                ))
            })?;
        let user = config
            .users
            .iter()
            .find(|u| u.name == context.user)
            .map(|u| &u.user)
            .ok_or_else(|| {
                Error::ReviewUnavailable(format!("kubeconfig user '{}' not found", context.user))
            })?;

        let bearer = user.token.clone().ok_or_else(|| {
            Error::ReviewUnavailable("kubeconfig user carries no bearer token".to_string())
        })?;

        let ca_pem = match (&cluster.certificate_authority_data, &cluster.certificate_authority) {
            (Some(data), _) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(data.trim())
                    .map_err(|e| Error::PemDecode(format!("kubeconfig CA data: {e}")))?,
            ),
            (None, Some(path)) => Some(std::fs::read(path)?),
            (None, None) => None,
        };

        Self::build(cluster.server.clone(), bearer, ca_pem.as_deref())
    }

    fn build(server: String, bearer: String, ca_pem: Option<&[u8]>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(REVIEW_TIMEOUT);
        if let Some(pem) = ca_pem {
            let ca = reqwest::Certificate::from_pem(pem)
                .map_err(|e| Error::PemDecode(format!("cluster CA: {e}")))?;
            builder = builder.add_root_certificate(ca);
        }
        let client = builder
            .build()
            .map_err(|e| Error::ReviewUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            review_url: format!(
                "{}/apis/authentication.k8s.io/v1/tokenreviews",
                server.trim_end_matches('/')
            ),
            bearer,
            audience: None,
        })
    }
}

#[async_trait]
impl TokenAuthenticator for TokenReviewer {
    async fn validate(&self, token: &str) -> Result<AuthenticatedIdentity> {
        if token.is_empty() {
            return Err(Error::TokenInvalid("empty token".to_string()));
        }

        let review = TokenReview {
            api_version: "authentication.k8s.io/v1".to_string(),
            kind: "TokenReview".to_string(),
            spec: Some(TokenReviewSpec {
                token: token.to_string(),
                audiences: self.audience.iter().cloned().collect(),
            }),
            status: None,
        };

        let response = self
            .client
            .post(&self.review_url)
            .bearer_auth(&self.bearer)
            .json(&review)
            .send()
            .await
            .map_err(review_transport_error)?;

        if !response.status().is_success() {
            return Err(Error::ReviewUnavailable(format!(
                "token review returned HTTP {}",
                response.status()
            )));
        }

        let review: TokenReview = response.json().await.map_err(review_transport_error)?;
        let status = review.status.ok_or_else(|| {
            Error::ReviewUnavailable("token review response carries no status".to_string())
        })?;

        debug!(authenticated = status.authenticated, "token review complete");
        parse_review_status(status, self.audience.as_deref())
    }
}

fn review_transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::ReviewUnavailable("token review timed out".to_string())
    } else {
        // reqwest error display never includes the request body.
        Error::ReviewUnavailable(e.to_string())
    }
}

/// Interprets a review status, rejecting everything that is not a healthy
/// service-account principal.
fn parse_review_status(
    status: TokenReviewStatus,
    expected_audience: Option<&str>,
) -> Result<AuthenticatedIdentity> {
    if let Some(error) = status.error.filter(|e| !e.is_empty()) {
        if error.to_ascii_lowercase().contains("expired") {
            return Err(Error::TokenExpired);
        }
        return Err(Error::TokenInvalid(error));
    }
    if !status.authenticated {
        return Err(Error::TokenInvalid(
            "cluster did not authenticate the token".to_string(),
        ));
    }

    if let Some(expected) = expected_audience {
        if !status.audiences.is_empty() && !status.audiences.iter().any(|a| a == expected) {
            return Err(Error::WrongAudience);
        }
    }

    let user = status.user.ok_or_else(|| {
        Error::TokenInvalid("token review reported no principal".to_string())
    })?;

    let rest = user
        .username
        .strip_prefix(SERVICE_ACCOUNT_PREFIX)
        .ok_or_else(|| Error::NotServiceAccount(user.username.clone()))?;
    let (namespace, service_account) = rest
        .split_once(':')
        .filter(|(ns, sa)| !ns.is_empty() && !sa.is_empty())
        .ok_or_else(|| Error::NotServiceAccount(user.username.clone()))?;

    Ok(AuthenticatedIdentity {
        service_account: service_account.to_string(),
        namespace: namespace.to_string(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenReview {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    spec: Option<TokenReviewSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<TokenReviewStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenReviewSpec {
    token: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    audiences: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenReviewStatus {
    #[serde(default)]
    authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user: Option<UserInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    audiences: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserInfo {
    username: String,
}

#[derive(Debug, Deserialize)]
struct KubeConfig {
    #[serde(rename = "current-context")]
    current_context: Option<String>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: KubeContext,
}

#[derive(Debug, Deserialize)]
struct KubeContext {
    cluster: String,
    user: String,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: KubeCluster,
}

#[derive(Debug, Deserialize)]
struct KubeCluster {
    server: String,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: Option<String>,
    #[serde(rename = "certificate-authority")]
    certificate_authority: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    user: KubeUser,
}

#[derive(Debug, Deserialize)]
struct KubeUser {
    token: Option<String>,
}
