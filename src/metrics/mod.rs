//! Metrics for credential acquisition and connection establishment
//!
//! Recorded through the `metrics` facade; no exporter is installed here. The
//! host application decides where (and whether) the values go.
//!
//! * `mysql_provider_credential_acquired_total{mode}`
//! * `mysql_provider_credential_failed_total{mode,kind}`
//! * `mysql_provider_credential_duration_seconds{mode}`
//! * `mysql_provider_connect_attempts_total{transport}`
//! * `mysql_provider_connect_retries_total{transport}`
//! * `mysql_provider_connect_duration_seconds{transport,outcome}`
//! * `mysql_provider_pool_dials_total{transport}`

pub mod counters;
pub mod histograms;
pub mod labels;
