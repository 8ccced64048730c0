//! RDS Data API executor
//!
//! Every statement is one signed `ExecuteStatement` call carrying the cluster
//! and secret ARNs. There is no socket and no pool; the AWS SDK signs each
//! request with the resolved credential chain. Aurora Serverless clusters that
//! are resuming answer with transient errors, which are retried within the
//! connect budget.

use super::factory::QueryExecutor;
use super::probe::{ServerCapabilities, BASEDIR_QUERY, VERSION_QUERY};
use super::retry::{retry_async, RetryPolicy};
use crate::cloud::DataApiTarget;
use crate::{Error, Result};
use async_trait::async_trait;
use aws_sdk_rdsdata::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_rdsdata::operation::execute_statement::{ExecuteStatementError, ExecuteStatementOutput};
use aws_sdk_rdsdata::types::Field;
use aws_types::SdkConfig;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Error codes returned while the cluster or the service is temporarily unavailable.
///
/// A statement that timed out may still be running or may have committed, so
/// `StatementTimeoutException` is never retried.
const TRANSIENT_CODES: &[&str] = &[
    "DatabaseResumingException",
    "DatabaseUnavailableException",
    "ServiceUnavailableError",
];

/// Error codes meaning the caller or the secret was rejected
const AUTH_CODES: &[&str] = &[
    "AccessDeniedException",
    "ForbiddenException",
    "InvalidSecretException",
    "SecretsErrorException",
    "UnrecognizedClientException",
];

/// Stateless query client for the RDS Data API
#[derive(Debug)]
pub struct DataApiClient {
    client: aws_sdk_rdsdata::Client,
    target: DataApiTarget,
    retry: RetryPolicy,
    cancel: CancellationToken,
    capabilities: OnceCell<ServerCapabilities>,
}

impl DataApiClient {
    /// Create a client from resolved SDK configuration
    pub fn new(
        sdk: &SdkConfig,
        target: DataApiTarget,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self::from_client(aws_sdk_rdsdata::Client::new(sdk), target, retry, cancel)
    }

    /// Wrap an existing SDK client
    pub fn from_client(
        client: aws_sdk_rdsdata::Client,
        target: DataApiTarget,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        tracing::info!(cluster = %target.cluster_arn, "RDS Data API client created");
        Self {
            client,
            target,
            retry,
            cancel,
            capabilities: OnceCell::new(),
        }
    }

    /// Cluster and secret addressed by this client
    pub fn target(&self) -> &DataApiTarget {
        &self.target
    }

    async fn execute_statement(&self, sql: &str) -> Result<ExecuteStatementOutput> {
        retry_async(&self.retry, &self.cancel, "data_api", |_| async move {
            self.client
                .execute_statement()
                .resource_arn(&self.target.cluster_arn)
                .secret_arn(&self.target.secret_arn)
                .sql(sql)
                .send()
                .await
                .map_err(classify_sdk_error)
        })
        .await
    }
}

#[async_trait]
impl QueryExecutor for DataApiClient {
    async fn execute(&self, sql: &str) -> Result<u64> {
        let output = self.execute_statement(sql).await?;
        Ok(output.number_of_records_updated().max(0) as u64)
    }

    async fn query(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        let output = self.execute_statement(sql).await?;
        output
            .records()
            .iter()
            .map(|record| record.iter().map(field_to_string).collect::<Result<Vec<_>>>())
            .collect()
    }

    async fn capabilities(&self) -> Result<ServerCapabilities> {
        self.capabilities
            .get_or_try_init(|| async {
                let version = first_value(self.query(VERSION_QUERY).await?).unwrap_or_default();
                let basedir = match self.query(BASEDIR_QUERY).await {
                    Ok(rows) => first_value(rows),
                    Err(e) => {
                        tracing::debug!(error = %e, "basedir lookup failed, assuming non-RDS");
                        None
                    }
                };
                let caps = ServerCapabilities::from_parts(&version, basedir.as_deref());
                tracing::info!(
                    vendor = %caps.vendor,
                    version = %caps.version_string,
                    "server capabilities detected through the Data API"
                );
                Ok(caps)
            })
            .await
            .cloned()
    }

    async fn close(&self) -> Result<()> {
        // nothing is held open between calls
        tracing::debug!(cluster = %self.target.cluster_arn, "RDS Data API client closed");
        Ok(())
    }
}

fn first_value(rows: Vec<Vec<Option<String>>>) -> Option<String> {
    rows.into_iter().next()?.into_iter().next()?
}

/// Render a Data API field the way the MySQL text protocol would
fn field_to_string(field: &Field) -> Result<Option<String>> {
    Ok(match field {
        Field::IsNull(_) => None,
        Field::StringValue(s) => Some(s.clone()),
        Field::LongValue(n) => Some(n.to_string()),
        Field::DoubleValue(d) => Some(d.to_string()),
        Field::BooleanValue(b) => Some(if *b { "1" } else { "0" }.to_string()),
        Field::BlobValue(blob) => Some(String::from_utf8_lossy(blob.as_ref()).into_owned()),
        other => {
            return Err(Error::Config(format!(
                "unsupported Data API field type: {:?}",
                other
            )))
        }
    })
}

fn classify_sdk_error<R>(err: SdkError<ExecuteStatementError, R>) -> Error
where
    R: std::fmt::Debug,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            Error::Connection(format!("Data API request failed: {}", DisplayErrorContext(&err)))
        }
        SdkError::ConstructionFailure(_) => {
            Error::Config(format!("invalid Data API request: {}", DisplayErrorContext(&err)))
        }
        _ => {
            let code = err
                .as_service_error()
                .and_then(|e| e.code())
                .unwrap_or("Unknown");
            let message = err
                .as_service_error()
                .and_then(|e| e.message())
                .unwrap_or_default();
            classify_code(code, message)
        }
    }
}

fn classify_code(code: &str, message: &str) -> Error {
    let msg = format!("Data API returned {}: {}", code, message);
    if TRANSIENT_CODES.contains(&code) || message.contains("Communications link failure") {
        Error::Connection(msg)
    } else if AUTH_CODES.contains(&code) {
        Error::Auth(msg)
    } else {
        Error::Config(msg)
    }
}
