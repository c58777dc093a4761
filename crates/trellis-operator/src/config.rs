//! Operator configuration
//!
//! Flags are parsed by clap with environment fallbacks, then converted into
//! an [`OperatorConfig`] which is validated once at startup.

use std::time::Duration;

use clap::{Args, ValueEnum};
use trellis_common::Error;

/// Upper bound on concurrent reconciles
pub const MAX_WORKERS: u16 = 256;

/// Resyncs faster than this only generate API server load
pub const MIN_RESYNC_SECS: u64 = 10;

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Flags for the controller mode
#[derive(Args, Clone, Debug)]
pub struct ControllerArgs {
    /// Maximum number of clusters reconciled concurrently
    #[arg(long, env = "TRELLIS_WORKERS", default_value_t = 10)]
    pub workers: u16,

    /// Seconds between full resyncs of every ManagedCluster
    #[arg(long, env = "TRELLIS_RESYNC_SECS", default_value_t = 300)]
    pub resync_secs: u64,

    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "TRELLIS_NAMESPACE")]
    pub namespace: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Seconds to wait for installed CRDs to become established
    #[arg(long, default_value_t = 120)]
    pub crd_wait_secs: u64,
}

/// Validated operator configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    pub workers: u16,
    pub resync: Duration,
    pub namespace: Option<String>,
    pub log_format: LogFormat,
    pub crd_wait: Duration,
}

impl TryFrom<ControllerArgs> for OperatorConfig {
    type Error = Error;

    fn try_from(args: ControllerArgs) -> Result<Self, Error> {
        let config = Self {
            workers: args.workers,
            resync: Duration::from_secs(args.resync_secs),
            namespace: args.namespace.filter(|ns| !ns.is_empty()),
            log_format: args.log_format,
            crd_wait: Duration::from_secs(args.crd_wait_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

impl OperatorConfig {
    /// Check the configuration for values the controller cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(Error::validation(format!(
                "--workers must be between 1 and {}, got {}",
                MAX_WORKERS, self.workers
            )));
        }
        if self.resync.as_secs() < MIN_RESYNC_SECS {
            return Err(Error::validation(format!(
                "--resync-secs must be at least {}, got {}",
                MIN_RESYNC_SECS,
                self.resync.as_secs()
            )));
        }
        if self.crd_wait.is_zero() {
            return Err(Error::validation("--crd-wait-secs must be greater than zero"));
        }
        if let Some(ns) = &self.namespace {
            if !is_dns_label(ns) {
                return Err(Error::validation(format!(
                    "--namespace {:?} is not a valid namespace name",
                    ns
                )));
            }
        }
        Ok(())
    }
}

/// RFC 1123 label: lowercase alphanumerics and '-', at most 63 characters
fn is_dns_label(s: &str) -> bool {
    s.len() <= 63
        && s.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && s.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
