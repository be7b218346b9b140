//! Caller identity.
//!
//! Every RPC is attributed to an [`Owner`]: the subject common name of the
//! client certificate that was verified during the TLS handshake. The
//! [`Authenticator`] interceptor resolves it once per call and stores it in
//! the request extensions, where handlers pick it up with
//! [`owner_from_request`]. Nothing in the request payload or metadata can
//! influence the identity.

use std::fmt;

use tonic::service::Interceptor;
use tonic::{Request, Status};
use x509_parser::parse_x509_certificate;

use crate::error::{Result, WorkerError};

/// Authenticated principal that jobs are scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner(String);

impl Owner {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extract the subject common name from a DER-encoded X.509 certificate.
pub fn common_name_from_der(der: &[u8]) -> Result<String> {
    let (_, cert) = parse_x509_certificate(der)
        .map_err(|e| WorkerError::Unauthenticated(format!("invalid peer certificate: {e}")))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .ok_or_else(|| {
            WorkerError::Unauthenticated("peer certificate has no common name".to_string())
        })?
        .as_str()
        .map_err(|e| WorkerError::Unauthenticated(format!("unreadable common name: {e}")))?;

    if common_name.trim().is_empty() {
        return Err(WorkerError::Unauthenticated(
            "peer certificate has an empty common name".to_string(),
        ));
    }
    Ok(common_name.to_string())
}

/// Read the identity attached by [`Authenticator`].
pub fn owner_from_request<T>(request: &Request<T>) -> Result<Owner> {
    request
        .extensions()
        .get::<Owner>()
        .cloned()
        .ok_or_else(|| WorkerError::Unauthenticated("no verified client identity".to_string()))
}

/// Interceptor that turns the verified client certificate into an [`Owner`].
///
/// The TLS layer has already validated the chain against the configured CA,
/// so only the leaf certificate's common name is inspected here. Plaintext
/// connections are rejected unless `insecure_identity` is set.
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    insecure_identity: Option<Owner>,
}

impl Authenticator {
    pub fn new(insecure_identity: Option<String>) -> Self {
        Self {
            insecure_identity: insecure_identity.map(Owner::new),
        }
    }

    fn resolve<T>(&self, request: &Request<T>) -> Result<Owner> {
        if let Some(certs) = request.peer_certs() {
            let leaf = certs.first().ok_or_else(|| {
                WorkerError::Unauthenticated("could not verify peer certificate".to_string())
            })?;
            return common_name_from_der(leaf.as_ref()).map(Owner);
        }

        self.insecure_identity
            .clone()
            .ok_or_else(|| WorkerError::Unauthenticated("no client certificate".to_string()))
    }
}

impl Interceptor for Authenticator {
    fn call(&mut self, mut request: Request<()>) -> std::result::Result<Request<()>, Status> {
        match self.resolve(&request) {
            Ok(owner) => {
                tracing::trace!(owner = %owner, "Authenticated request");
                request.extensions_mut().insert(owner);
                Ok(request)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Rejected unauthenticated request");
                Err(e.into())
            }
        }
    }
}
