//! Coral core: error taxonomy, reconcile outcomes and the condition ledger.

#![forbid(unsafe_code)]

use std::time::Duration;

use thiserror::Error;

pub mod conditions;
pub mod config;

pub use config::OperatorConfig;

/// Classified reconcile error. The class decides requeue behavior and the
/// `reason` users see on the `Reconciled` condition; only the orchestrator
/// turns one of these into an [`Outcome`].
#[derive(Debug, Error)]
pub enum Error {
    /// Structurally invalid spec. Terminal: reported, never requeued.
    #[error("invalid component spec: {0}")]
    Invalid(String),

    /// A protocol step needs a secret/resource that does not exist yet.
    #[error("missing dependency: {0}")]
    MissingDependency(String),

    /// Optimistic-concurrency clash on a write; requeued immediately.
    #[error("conflict writing {0}")]
    Conflict(String),

    /// A managed certificate has not been issued yet. Blocking: the pass
    /// stops without a requeue, the watch on the certificate wakes us.
    #[error("certificate {0} is not ready")]
    CertificateNotReady(String),

    /// The spec mandates a platform kind that is not installed.
    #[error("platform does not support {0}")]
    UnsupportedCapability(String),

    /// Any other remote failure; retriable with backoff.
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

impl Error {
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Invalid(_) => "InvalidSpec",
            Error::MissingDependency(_) => "DependencyNotFound",
            Error::Conflict(_) => "ResourceConflict",
            Error::CertificateNotReady(_) => "CertificateNotReady",
            Error::UnsupportedCapability(_) => "CapabilityUnsupported",
            Error::Transient(_) => "ReconcileFailed",
        }
    }

    /// Terminal errors are surfaced through conditions and never requeued.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Invalid(_) | Error::UnsupportedCapability(_))
    }

    /// Blocking errors stop the pass but rely on a watch, not a timer.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Error::CertificateNotReady(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What the dispatch layer should do with this request next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Converged, terminally failed, or blocked on a watched dependency.
    Done,
    /// Try again after the given delay.
    Requeue(Duration),
}
