use std::time::Duration;

pub mod finalizer;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod status;

pub(crate) mod colors;

mod error;

pub use error::*;

/// The default interval for requeuing a managed resource.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Name of the kubernetes resource manager.
pub(crate) const MANAGER_NAME: &str = "hibernator-operator";

/// `k8s_openapi::Time` wraps a `jiff::Timestamp`, not a `chrono::DateTime`;
/// round-tripping through its RFC3339 rendering is the cheapest bridge
/// between the two time crates for the handful of call sites that need it.
pub fn time_to_utc(
    t: &k8s_openapi::apimachinery::pkg::apis::meta::v1::Time,
) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(&t.0.to_string())
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}
