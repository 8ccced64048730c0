//! Token acquisition against local identity and control-plane endpoints
//!
//! Azure AD, the Azure instance metadata service, Google OAuth2 and the Cloud
//! SQL Admin API are all served by a mock HTTP listener on 127.0.0.1.

mod common;

use common::MockHttpServer;
use mysql_provider::auth::{self, CredentialProvider};
use mysql_provider::client::CloudSqlInstance;
use mysql_provider::cloud::{
    AzureConfig, AzureCredentialChain, AzureEnvironment, ClientKeyPair, CloudSqlIpType,
    CloudSqlResolver, GoogleCredentials,
};
use mysql_provider::connection::{CloudSqlTls, TlsRegistry, TlsSource};
use mysql_provider::{
    AuthMode, AzureConfigBlock, CloudResolver, ConnectionSpec, Error, ProviderConfig, SecretString,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

fn client_secret_config() -> AzureConfig {
    AzureConfig {
        client_id: Some("app-id".into()),
        client_secret: Some(SecretString::new("super-secret-value")),
        tenant_id: Some("tenant-1".into()),
        environment: AzureEnvironment::Public,
    }
}

fn no_env(_: &str) -> Option<String> {
    None
}

#[tokio::test]
async fn test_azure_client_secret_flow() {
    common::init_tracing();
    let server = MockHttpServer::json(serde_json::json!({
        "token_type": "Bearer",
        "access_token": "eyJ0eXAiOiJKV1Qi.aad.token",
        "expires_in": 3599
    }))
    .await;

    let chain = AzureCredentialChain::with_env_lookup(
        &client_secret_config(),
        reqwest::Client::new(),
        no_env,
    )
    .authority_host(server.url());

    let token = chain.get_token().await.unwrap();
    assert_eq!(token.token.expose(), "eyJ0eXAiOiJKV1Qi.aad.token");
    assert!(token.expires_at > SystemTime::now() + Duration::from_secs(3500));

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].path(), "/tenant-1/oauth2/v2.0/token");
    assert!(requests[0].body.contains("grant_type=client_credentials"));
    assert!(requests[0]
        .body
        .contains("scope=https%3A%2F%2Fossrdbms-aad.database.windows.net%2F.default"));
}

#[tokio::test]
async fn test_azure_rejected_secret_is_auth_error_without_secret() {
    let server = MockHttpServer::start(|_| {
        (
            401,
            serde_json::json!({
                "error": "invalid_client",
                "error_description": "AADSTS7000215: Invalid client secret provided.\r\nTrace ID: 1"
            })
            .to_string(),
        )
    })
    .await;

    let chain = AzureCredentialChain::with_env_lookup(
        &client_secret_config(),
        reqwest::Client::new(),
        no_env,
    )
    .authority_host(server.url());

    let err = chain.get_token().await.unwrap_err();
    assert!(matches!(err, Error::Auth(_)), "{}", err);
    assert!(err.to_string().contains("invalid_client"));
    assert!(!err.to_string().contains("super-secret-value"));
}

#[tokio::test]
async fn test_azure_throttling_is_transient() {
    let server = MockHttpServer::start(|_| (429, "{}".into())).await;
    let chain = AzureCredentialChain::with_env_lookup(
        &client_secret_config(),
        reqwest::Client::new(),
        no_env,
    )
    .authority_host(server.url());

    assert!(chain.get_token().await.unwrap_err().is_transient());
}

#[tokio::test]
async fn test_azure_managed_identity() {
    let server = MockHttpServer::json(serde_json::json!({
        "access_token": "imds-token",
        "expires_in": "86399",
        "resource": "https://ossrdbms-aad.database.chinacloudapi.cn"
    }))
    .await;

    let config = AzureConfig {
        client_id: Some("user-assigned-id".into()),
        environment: AzureEnvironment::China,
        ..Default::default()
    };
    let chain = AzureCredentialChain::with_env_lookup(&config, reqwest::Client::new(), no_env)
        .imds_endpoint(format!("{}/metadata/identity/oauth2/token", server.url()));

    let token = chain.get_token().await.unwrap();
    assert_eq!(token.token.expose(), "imds-token");

    let request = &server.requests()[0];
    assert_eq!(request.method, "GET");
    assert_eq!(request.header("metadata"), Some("true"));
    assert!(request.target.contains("api-version=2018-02-01"));
    assert!(request.target.contains("client_id=user-assigned-id"));
    assert!(request
        .target
        .contains("resource=https%3A%2F%2Fossrdbms-aad.database.chinacloudapi.cn"));
}

#[tokio::test]
async fn test_azure_workload_identity_reads_token_file() {
    let dir = tempfile::tempdir().unwrap();
    let token_file = dir.path().join("azure-identity-token");
    std::fs::write(&token_file, "federated.jwt\n").unwrap();

    let server = MockHttpServer::json(serde_json::json!({
        "access_token": "workload-token",
        "expires_in": 3600
    }))
    .await;

    let path = token_file.to_string_lossy().into_owned();
    let config = AzureConfig::default();
    let chain = AzureCredentialChain::with_env_lookup(&config, reqwest::Client::new(), move |name| {
        match name {
            "AZURE_FEDERATED_TOKEN_FILE" => Some(path.clone()),
            "AZURE_CLIENT_ID" => Some("wi-client".into()),
            "AZURE_TENANT_ID" => Some("wi-tenant".into()),
            _ => None,
        }
    })
    .authority_host(server.url());

    let token = chain.get_token().await.unwrap();
    assert_eq!(token.token.expose(), "workload-token");

    let request = &server.requests()[0];
    assert_eq!(request.path(), "/wi-tenant/oauth2/v2.0/token");
    assert!(request.body.contains("client_assertion=federated.jwt"));
}

#[tokio::test]
async fn test_azure_provider_mints_per_acquire() {
    let server = MockHttpServer::start({
        let counter = std::sync::atomic::AtomicU32::new(0);
        move |_| {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            (
                200,
                serde_json::json!({ "access_token": format!("token-{}", n), "expires_in": 3600 })
                    .to_string(),
            )
        }
    })
    .await;

    let spec = ConnectionSpec::resolve(
        &ProviderConfig::new()
            .endpoint("azure://srv.mysql.database.azure.com")
            .username("aad_user")
            .azure_config(AzureConfigBlock {
                client_id: "app-id".into(),
                client_secret: "super-secret-value".into(),
                tenant_id: "tenant-1".into(),
                ..Default::default()
            }),
    )
    .unwrap();
    assert_eq!(spec.auth_mode(), AuthMode::AzureAd);

    let cloud = CloudResolver::new()
        .azure_authority_host(server.url())
        .resolve(&spec, reqwest::Client::new())
        .await
        .unwrap();

    let provider = auth::select_provider(&spec, &cloud).unwrap();
    assert_eq!(provider.mode(), AuthMode::AzureAd);

    let cancel = CancellationToken::new();
    let first = auth::acquire_with(provider.as_ref(), &cancel, Duration::from_secs(5))
        .await
        .unwrap();
    let second = auth::acquire_with(provider.as_ref(), &cancel, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(first.password(), Some("token-0"));
    assert_eq!(second.password(), Some("token-1"));
    assert!(first.expires_at().is_some());
}

#[tokio::test]
async fn test_google_authorized_user_refresh() {
    let server = MockHttpServer::json(serde_json::json!({
        "access_token": "ya29.refreshed",
        "expires_in": 3599,
        "token_type": "Bearer"
    }))
    .await;

    let credentials = GoogleCredentials::from_json(
        &serde_json::json!({
            "type": "authorized_user",
            "client_id": "123.apps.googleusercontent.com",
            "client_secret": "gcloud-client-secret",
            "refresh_token": "1//refresh-token",
            "token_uri": format!("{}/token", server.url())
        })
        .to_string(),
    )
    .unwrap();
    assert!(!format!("{:?}", credentials).contains("1//refresh-token"));

    let token = credentials.access_token(&reqwest::Client::new()).await.unwrap();
    assert_eq!(token.token.expose(), "ya29.refreshed");

    let request = &server.requests()[0];
    assert_eq!(request.path(), "/token");
    assert!(request.body.contains("grant_type=refresh_token"));
}

#[tokio::test]
async fn test_google_token_error_does_not_leak_description() {
    let server = MockHttpServer::start(|_| {
        (
            400,
            serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Bad refresh token 1//refresh-token"
            })
            .to_string(),
        )
    })
    .await;

    let credentials = GoogleCredentials::from_json(
        &serde_json::json!({
            "type": "authorized_user",
            "client_id": "123.apps.googleusercontent.com",
            "client_secret": "s",
            "refresh_token": "1//refresh-token",
            "token_uri": format!("{}/token", server.url())
        })
        .to_string(),
    )
    .unwrap();

    let err = credentials
        .access_token(&reqwest::Client::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Auth(_)));
    assert!(err.to_string().contains("invalid_grant"));
    assert!(!err.to_string().contains("1//refresh-token"));
}

#[tokio::test]
async fn test_cloud_sql_connect_settings() {
    let server = MockHttpServer::json(serde_json::json!({
        "kind": "sql#connectSettings",
        "serverCaCert": { "cert": include_str!("fixtures/ca.pem") },
        "ipAddresses": [
            { "type": "PRIMARY", "ipAddress": "34.1.2.3" },
            { "type": "PRIVATE", "ipAddress": "10.0.0.7" }
        ],
        "region": "europe-west1",
        "databaseVersion": "MYSQL_8_0"
    }))
    .await;

    let credentials = GoogleCredentials::discover_with(|name| {
        (name == "GOOGLE_OAUTH_ACCESS_TOKEN").then(|| "ya29.static".to_string())
    })
    .await
    .unwrap();
    let token = credentials.access_token(&reqwest::Client::new()).await.unwrap();

    let instance = CloudSqlInstance::parse("my-project:europe-west1:orders").unwrap();
    let settings = CloudSqlResolver::new(reqwest::Client::new())
        .with_api_base(server.url())
        .connect_settings(&instance, &token)
        .await
        .unwrap();

    assert_eq!(settings.address(CloudSqlIpType::Public).unwrap(), "34.1.2.3");
    assert_eq!(settings.address(CloudSqlIpType::Private).unwrap(), "10.0.0.7");
    assert!(settings.server_ca_pem.unwrap().starts_with("-----BEGIN CERTIFICATE-----"));
    assert_eq!(settings.database_version, "MYSQL_8_0");

    let request = &server.requests()[0];
    assert_eq!(
        request.path(),
        "/sql/v1beta4/projects/my-project/instances/orders/connectSettings"
    );
    assert_eq!(request.header("authorization"), Some("Bearer ya29.static"));
}

#[tokio::test]
async fn test_cloud_sql_lookup_errors_are_classified() {
    let token = mysql_provider::cloud::AccessToken {
        token: SecretString::new("ya29.static"),
        expires_at: SystemTime::now() + Duration::from_secs(60),
    };
    let instance = CloudSqlInstance::parse("p:r:i").unwrap();

    for (status, transient) in [(403u16, false), (404, false), (503, true)] {
        let server = MockHttpServer::start(move |_| (status, "{}".into())).await;
        let err = CloudSqlResolver::new(reqwest::Client::new())
            .with_api_base(server.url())
            .connect_settings(&instance, &token)
            .await
            .unwrap_err();
        assert_eq!(err.is_transient(), transient, "status {}: {}", status, err);
        assert!(!err.to_string().contains("ya29.static"));
    }
}

#[tokio::test]
async fn test_cloud_sql_region_mismatch() {
    let server = MockHttpServer::json(serde_json::json!({
        "ipAddresses": [{ "type": "PRIMARY", "ipAddress": "34.1.2.3" }],
        "region": "us-central1"
    }))
    .await;
    let token = mysql_provider::cloud::AccessToken {
        token: SecretString::new("t"),
        expires_at: SystemTime::now() + Duration::from_secs(60),
    };
    let instance = CloudSqlInstance::parse("p/europe-west1/i").unwrap();

    let err = CloudSqlResolver::new(reqwest::Client::new())
        .with_api_base(server.url())
        .connect_settings(&instance, &token)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

const EPHEMERAL_CERT: &str = include_str!("fixtures/ephemeral.pem");
const EPHEMERAL_KEY: &str = include_str!("fixtures/ephemeral.key");

fn admin_token() -> mysql_provider::cloud::AccessToken {
    mysql_provider::cloud::AccessToken {
        token: SecretString::new("ya29.admin"),
        expires_at: SystemTime::now() + Duration::from_secs(600),
    }
}

fn ephemeral_cert_body(expires_in: chrono::Duration) -> String {
    serde_json::json!({
        "ephemeralCert": {
            "kind": "sql#sslCert",
            "cert": EPHEMERAL_CERT,
            "expirationTime": (chrono::Utc::now() + expires_in).to_rfc3339(),
        }
    })
    .to_string()
}

#[tokio::test]
async fn test_cloud_sql_ephemeral_cert_request() {
    let server = MockHttpServer::json(serde_json::json!({
        "ephemeralCert": {
            "cert": EPHEMERAL_CERT,
            "expirationTime": "2099-01-01T00:00:00Z"
        }
    }))
    .await;

    let keys = ClientKeyPair::from_private_key_pem(EPHEMERAL_KEY).unwrap();
    let instance = CloudSqlInstance::parse("my-project:europe-west1:orders").unwrap();
    let login = SecretString::new("ya29.login");
    let cert = CloudSqlResolver::new(reqwest::Client::new())
        .with_api_base(server.url())
        .generate_ephemeral_cert(&instance, &admin_token(), &keys, Some(&login))
        .await
        .unwrap();

    assert_eq!(cert.cert_pem, EPHEMERAL_CERT);
    assert!(cert.expires_at > SystemTime::now() + Duration::from_secs(365 * 24 * 3600));

    let request = &server.requests()[0];
    assert_eq!(request.method, "POST");
    assert_eq!(
        request.path(),
        "/sql/v1beta4/projects/my-project/instances/orders:generateEphemeralCert"
    );
    assert_eq!(request.header("authorization"), Some("Bearer ya29.admin"));

    let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
    assert_eq!(body["public_key"], keys.public_key_pem());
    assert_eq!(body["access_token"], "ya29.login");
    assert!(!request.body.contains("PRIVATE KEY"));
}

#[tokio::test]
async fn test_cloud_sql_ephemeral_cert_rejected() {
    let server = MockHttpServer::start(|_| (403, r#"{"error":{"code":403}}"#.into())).await;
    let keys = ClientKeyPair::from_private_key_pem(EPHEMERAL_KEY).unwrap();
    let instance = CloudSqlInstance::parse("p:r:i").unwrap();

    let err = CloudSqlResolver::new(reqwest::Client::new())
        .with_api_base(server.url())
        .generate_ephemeral_cert(&instance, &admin_token(), &keys, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Auth(_)));
    assert!(!err.to_string().contains("ya29.admin"));
}

async fn cert_source(
    expires_in: chrono::Duration,
) -> (MockHttpServer, Arc<AtomicUsize>, CloudSqlTls, Arc<TlsRegistry>) {
    let issued = Arc::new(AtomicUsize::new(0));
    let counter = issued.clone();
    let server = MockHttpServer::start(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        (200, ephemeral_cert_body(expires_in))
    })
    .await;

    let registry = Arc::new(TlsRegistry::new());
    let source = CloudSqlTls::new(
        CloudSqlInstance::parse("my-project:europe-west1:orders").unwrap(),
        include_str!("fixtures/ca.pem"),
        Arc::new(ClientKeyPair::from_private_key_pem(EPHEMERAL_KEY).unwrap()),
        CloudSqlResolver::new(reqwest::Client::new()).with_api_base(server.url()),
        GoogleCredentials::AccessToken(SecretString::new("ya29.admin")),
        reqwest::Client::new(),
        registry.clone(),
    );
    (server, issued, source, registry)
}

#[tokio::test]
async fn test_cloud_sql_certificate_reused_while_valid() {
    let (_server, issued, source, registry) = cert_source(chrono::Duration::hours(1)).await;

    for _ in 0..3 {
        let opts = source.ssl_opts().await.unwrap().unwrap();
        assert!(opts.client_identity().is_some());
        assert!(opts.skip_domain_validation());
    }
    assert_eq!(issued.load(Ordering::SeqCst), 1);

    let material = registry.get("cloudsql:my-project:europe-west1:orders").unwrap();
    assert!(material.has_client_identity());
}

#[tokio::test]
async fn test_cloud_sql_certificate_renewed_near_expiry() {
    let (_server, issued, source, _registry) = cert_source(chrono::Duration::seconds(60)).await;

    source.ssl_opts().await.unwrap();
    source.ssl_opts().await.unwrap();
    assert_eq!(issued.load(Ordering::SeqCst), 2);
}
