//! Counter metrics

use super::labels;

/// A credential was produced for a connection attempt
pub fn credential_acquired(mode: &str) {
    metrics::counter!(
        "mysql_provider_credential_acquired_total",
        labels::MODE => mode.to_string()
    )
    .increment(1);
}

/// Credential acquisition failed
pub fn credential_failed(mode: &str, kind: &str) {
    metrics::counter!(
        "mysql_provider_credential_failed_total",
        labels::MODE => mode.to_string(),
        labels::KIND => kind.to_string()
    )
    .increment(1);
}

/// A connection attempt started
pub fn connect_attempt(transport: &str) {
    metrics::counter!(
        "mysql_provider_connect_attempts_total",
        labels::TRANSPORT => transport.to_string()
    )
    .increment(1);
}

/// A failed attempt is being retried
pub fn connect_retry(transport: &str) {
    metrics::counter!(
        "mysql_provider_connect_retries_total",
        labels::TRANSPORT => transport.to_string()
    )
    .increment(1);
}

/// The pool opened a physical connection with a freshly minted credential
pub fn pool_dial(transport: &str) {
    metrics::counter!(
        "mysql_provider_pool_dials_total",
        labels::TRANSPORT => transport.to_string()
    )
    .increment(1);
}
