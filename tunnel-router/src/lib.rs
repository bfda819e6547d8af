pub mod agent;
pub mod bootstrap;
pub mod config;
pub mod http;
pub mod kubernetes;
pub mod metrics;
pub mod reconcile;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kernel error: {0}")]
    Kernel(#[from] tunnel_router_kernel::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("firewall rule for {0} is installed but not tracked")]
    RuleExists(String),

    #[error("state invariant violated: {0}")]
    Invariant(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid tunnel annotation on {service}: {value}")]
    InvalidAnnotation { service: String, value: String },

    #[error("{0}")]
    Other(String),
}

/// How far a failure reaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Abandons the rest of the current cycle only.
    Transient,
    /// Stops the reconciler.
    Fatal,
}

impl Error {
    pub fn severity(&self) -> Severity {
        match self {
            Error::Invariant(_) | Error::InvalidConfig(_) => Severity::Fatal,
            _ => Severity::Transient,
        }
    }

    pub fn metric_label(&self) -> String {
        match self {
            Error::Kernel(e) => format!("kernel_{}", e.metric_label()),
            Error::KubeError(_) => "kube".into(),
            Error::IoError(_) => "io".into(),
            Error::RuleExists(_) => "rule_exists".into(),
            Error::Invariant(_) => "invariant".into(),
            Error::InvalidConfig(_) => "invalid_config".into(),
            Error::InvalidAnnotation { .. } => "invalid_annotation".into(),
            Error::Other(_) => "other".into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
