//! Generated gRPC types for the strand identity service.

/// Generated types for `strand.identity.v1`.
pub mod identity {
    tonic::include_proto!("strand.identity.v1");
}
