//! The strand identity controller.
//!
//! Boots the certificate-issuance service: loads the global mesh
//! configuration, verifies the issuer credential against the configured
//! trust anchors, and serves the `Certify` RPC alongside an HTTP admin
//! endpoint until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tonic::{Request, Response, Status};
use tracing::{error, info};

use strand_identity::{
    Ca, Credentials, Error as IdentityError, IdentityService, TokenAuthenticator, TokenReviewer,
    TrustAnchors, TrustDomain,
};
use strand_proto::identity::identity_server::{Identity, IdentityServer};
use strand_proto::identity::{CertifyRequest, CertifyResponse};

mod admin;
mod config;

use admin::{AdminState, Metrics};

// TODO watch the trust-anchor bundle for changes
// TODO watch the issuer directory for changes

#[derive(Parser, Debug)]
#[command(name = "strand-controller")]
#[command(about = "Identity service for the strand mesh control plane")]
struct Args {
    /// Address to serve certificate signing on.
    #[arg(long, env = "STRAND_IDENTITY_ADDR", default_value = ":8083")]
    addr: String,
    /// Address of the HTTP admin server.
    #[arg(long, env = "STRAND_IDENTITY_ADMIN_ADDR", default_value = ":9996")]
    admin_addr: String,
    /// Path to a kubeconfig; empty means in-cluster discovery.
    #[arg(long, env = "STRAND_IDENTITY_KUBECONFIG", default_value = "")]
    kubeconfig: String,
    /// Directory containing issuer credentials (key.pem and crt.pem).
    #[arg(
        long,
        env = "STRAND_IDENTITY_ISSUER_DIR",
        default_value = "/var/run/strand/identity/issuer"
    )]
    issuer: PathBuf,
    /// Path to the mesh's global configuration document.
    #[arg(
        long,
        env = "STRAND_IDENTITY_CONFIG",
        default_value = "/var/run/strand/config/global.json"
    )]
    config: PathBuf,
}

#[derive(Debug, thiserror::Error)]
enum ControllerError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("invalid listen address '{0}'")]
    ListenAddr(String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("gRPC serve failed: {0}")]
    Serve(#[from] tonic::transport::Error),
}

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let args = Args::parse();
    let cfg = config::load(&args.config)?;

    let Some(identity_cfg) = cfg.identity else {
        // Exit 0: the operator turned the feature off, nothing to serve.
        info!("identity disabled in mesh configuration");
        return Ok(());
    };

    let trust_domain = TrustDomain::new(&cfg.namespace, &identity_cfg.trust_domain)?;
    let expected_name = trust_domain.identity_service_name();

    let anchors = TrustAnchors::from_pem(&identity_cfg.trust_anchors_pem)?;
    let creds = Credentials::load(args.issuer.join("key.pem"), args.issuer.join("crt.pem"))?;
    creds.crt.verify(&anchors, &expected_name)?;
    info!(
        issuer = %expected_name,
        expiry = %creds.crt.expiry()?,
        "verified issuer credentials against trust anchors"
    );

    let ca = Ca::new(creds, identity_cfg.validity());
    let handle = ca.spawn();

    let reviewer = if args.kubeconfig.is_empty() {
        TokenReviewer::in_cluster()?
    } else {
        TokenReviewer::from_kubeconfig(&args.kubeconfig)?
    };
    let service = IdentityService::new(reviewer, handle, trust_domain);

    let metrics = Arc::new(Metrics::default());
    let admin_state = AdminState::new(metrics.clone());
    let admin_addr = listen_addr(&args.admin_addr)?;
    {
        let admin_state = admin_state.clone();
        tokio::spawn(async move {
            if let Err(err) = admin::serve(admin_state, admin_addr).await {
                error!("admin server error: {err}");
            }
        });
    }

    let addr = listen_addr(&args.addr)?;
    let grpc = IdentityGrpc {
        service: Arc::new(service),
        metrics,
    };

    info!(%addr, "identity service listening");
    admin_state.set_ready();
    tonic::transport::Server::builder()
        .add_service(IdentityServer::new(grpc))
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;

    info!("identity service stopped");
    Ok(())
}

/// Accepts both `host:port` and the bare `:port` shorthand.
fn listen_addr(addr: &str) -> Result<SocketAddr, ControllerError> {
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    normalized
        .parse()
        .map_err(|_| ControllerError::ListenAddr(addr.to_string()))
}

/// Resolves on SIGINT or SIGTERM; tonic then stops accepting and drains.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining in-flight requests");
}

struct IdentityGrpc<A> {
    service: Arc<IdentityService<A>>,
    metrics: Arc<Metrics>,
}

#[tonic::async_trait]
impl<A: TokenAuthenticator + 'static> Identity for IdentityGrpc<A> {
    async fn certify(
        &self,
        request: Request<CertifyRequest>,
    ) -> Result<Response<CertifyResponse>, Status> {
        let request = request.into_inner();

        match self
            .service
            .certify(&request.token, &request.certificate_signing_request)
            .await
        {
            Ok(issued) => {
                self.metrics.record_success();
                Ok(Response::new(CertifyResponse {
                    leaf_certificate: issued.leaf_der,
                    intermediate_certificates: issued.intermediates_der,
                    valid_until: Some(prost_types::Timestamp {
                        seconds: issued.expiry.timestamp(),
                        nanos: 0,
                    }),
                }))
            }
            Err(err) => {
                self.metrics.record_failure(&err);
                Err(status_for(err))
            }
        }
    }
}

/// Maps issuance errors to RPC statuses. Authentication problems are kept
/// distinct from identity-binding problems so clients can tell a bad token
/// from a bad CSR.
fn status_for(err: IdentityError) -> Status {
    match &err {
        IdentityError::MalformedCsr(_) | IdentityError::UnsupportedKey(_) => {
            Status::invalid_argument(err.to_string())
        }
        IdentityError::IdentityMismatch { .. } | IdentityError::NotServiceAccount(_) => {
            Status::failed_precondition(err.to_string())
        }
        IdentityError::TokenInvalid(_)
        | IdentityError::TokenExpired
        | IdentityError::WrongAudience => Status::unauthenticated(err.to_string()),
        IdentityError::ReviewUnavailable(_) => Status::unavailable(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}
