//! Provider configuration: raw input and the validated spec derived from it

mod provider;
mod spec;

pub use provider::{
    AwsConfigBlock, AzureConfigBlock, CustomTlsBlock, ProviderConfig,
    DEFAULT_CONNECT_RETRY_TIMEOUT_SEC,
};
pub use spec::{AuthPlugin, ConnectionSpec, PoolPolicy, TlsMode, TransportScheme};
