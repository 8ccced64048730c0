//! Error types for connection resolution and credential acquisition
//!
//! Every error carries a classification ([`ErrorKind`]) so the caller can
//! decide on retry policy without matching on driver internals:
//!
//! * `Config` - malformed or contradictory input, reported before any network attempt
//! * `Auth` - credential or token rejected, never retried
//! * `Connection` - transient dial/network failure, retried inside the connection factory
//! * `Cancelled` - a cancellation signal was observed mid-operation
//!
//! Error messages never contain passwords or tokens.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// MySQL server error codes that mean the credential itself was rejected.
const ER_DBACCESS_DENIED_ERROR: u16 = 1044;
const ER_ACCESS_DENIED_ERROR: u16 = 1045;
const ER_ACCESS_DENIED_NO_PASSWORD_ERROR: u16 = 1698;

/// Server error codes worth another attempt.
const ER_CON_COUNT_ERROR: u16 = 1040;
const ER_SERVER_SHUTDOWN: u16 = 1053;
const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
const ER_LOCK_DEADLOCK: u16 = 1213;
const ER_CONNECTION_KILLED: u16 = 1927;
const CR_SERVER_GONE_ERROR: u16 = 2006;
const CR_SERVER_LOST: u16 = 2013;

/// Error classification tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or contradictory configuration
    Config,
    /// Credential or token rejected
    Auth,
    /// Transient network or dial failure
    Connection,
    /// Deadline or cancellation observed
    Cancelled,
}

impl ErrorKind {
    /// Stable lowercase label (used in metrics and logs)
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Auth => "auth",
            ErrorKind::Connection => "connection",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or contradictory configuration
    #[error("config error: {0}")]
    Config(String),

    /// Credential acquisition failed or the server rejected the credential
    #[error("authentication error: {0}")]
    Auth(String),

    /// Transient connection failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation stopped by a cancellation signal
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// MySQL driver error
    #[error("mysql error: {0}")]
    Mysql(#[from] mysql_async::Error),

    /// HTTP error talking to an identity or control-plane endpoint
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Auth(_) => ErrorKind::Auth,
            Error::Connection(_) => ErrorKind::Connection,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Io(_) => ErrorKind::Connection,
            Error::Mysql(e) => classify_mysql(e),
            Error::Http(e) => classify_http(e),
        }
    }

    /// Whether the error is worth retrying within the connect budget
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    /// Whether the error is fatal (never retried)
    pub fn is_fatal(&self) -> bool {
        !self.is_transient()
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an auth error
    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Error::Connection(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Error::Cancelled(msg.into())
    }
}

fn classify_mysql(err: &mysql_async::Error) -> ErrorKind {
    match err {
        mysql_async::Error::Server(server) => match server.code {
            ER_DBACCESS_DENIED_ERROR | ER_ACCESS_DENIED_ERROR | ER_ACCESS_DENIED_NO_PASSWORD_ERROR => {
                ErrorKind::Auth
            }
            ER_CON_COUNT_ERROR | ER_LOCK_WAIT_TIMEOUT | ER_LOCK_DEADLOCK | ER_SERVER_SHUTDOWN
            | ER_CONNECTION_KILLED | CR_SERVER_GONE_ERROR | CR_SERVER_LOST => ErrorKind::Connection,
            _ => ErrorKind::Config,
        },
        mysql_async::Error::Io(mysql_async::IoError::Io(_)) => ErrorKind::Connection,
        // TLS failures: certificate or handshake configuration problems
        mysql_async::Error::Io(_) => ErrorKind::Config,
        mysql_async::Error::Url(_) => ErrorKind::Config,
        _ => ErrorKind::Connection,
    }
}

fn classify_http(err: &reqwest::Error) -> ErrorKind {
    match err.status() {
        Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => ErrorKind::Auth,
        Some(status) if status.is_client_error() => ErrorKind::Config,
        _ => ErrorKind::Connection,
    }
}
