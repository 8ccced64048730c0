//! Histogram metrics

use super::labels;
use std::time::Duration;

/// Time spent producing a credential
pub fn credential_duration(mode: &str, elapsed: Duration) {
    metrics::histogram!(
        "mysql_provider_credential_duration_seconds",
        labels::MODE => mode.to_string()
    )
    .record(elapsed.as_secs_f64());
}

/// Time from the first attempt to a usable connection (or final failure)
pub fn connect_duration(transport: &str, success: bool, elapsed: Duration) {
    let outcome = if success {
        labels::OUTCOME_SUCCESS
    } else {
        labels::OUTCOME_FAILURE
    };
    metrics::histogram!(
        "mysql_provider_connect_duration_seconds",
        labels::TRANSPORT => transport.to_string(),
        labels::OUTCOME => outcome
    )
    .record(elapsed.as_secs_f64());
}
