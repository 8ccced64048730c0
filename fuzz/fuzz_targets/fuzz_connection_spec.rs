#![no_main]

use libfuzzer_sys::arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use mysql_provider::connection::select_transport;
use mysql_provider::{AwsConfigBlock, ConnectionSpec, ProviderConfig};

#[derive(Debug)]
struct ConfigInput {
    endpoint: String,
    username: String,
    password: String,
    proxy: Option<String>,
    tls: Option<String>,
    auth_plugin: Option<String>,
    iam: bool,
    private_ip: bool,
    data_api: bool,
}

impl<'a> Arbitrary<'a> for ConfigInput {
    fn arbitrary(u: &mut Unstructured<'a>) -> libfuzzer_sys::arbitrary::Result<Self> {
        Ok(Self {
            endpoint: u.arbitrary()?,
            username: u.arbitrary()?,
            password: u.arbitrary()?,
            proxy: u.arbitrary()?,
            tls: u.arbitrary()?,
            auth_plugin: u.arbitrary()?,
            iam: u.arbitrary()?,
            private_ip: u.arbitrary()?,
            data_api: u.arbitrary()?,
        })
    }
}

fuzz_target!(|input: ConfigInput| {
    // marker keeps the password distinct from field names and ARNs
    let password = format!("§pw§{}", input.password);
    let echoed = [
        Some(&input.endpoint),
        Some(&input.username),
        input.proxy.as_ref(),
        input.tls.as_ref(),
        input.auth_plugin.as_ref(),
    ]
    .into_iter()
    .flatten()
    .any(|field| field.contains(&password));

    let mut config = ProviderConfig::new()
        .endpoint(input.endpoint)
        .username(input.username)
        .password(password.clone())
        .iam_database_authentication(input.iam)
        .private_ip(input.private_ip);
    if let Some(proxy) = input.proxy {
        config = config.proxy(proxy);
    }
    if let Some(tls) = input.tls {
        config = config.tls(tls);
    }
    if let Some(plugin) = input.auth_plugin {
        config = config.authentication_plugin(plugin);
    }
    if input.data_api {
        config = config.aws_config(AwsConfigBlock {
            use_rds_data_api: true,
            cluster_arn: "arn:aws:rds:us-east-1:123456789012:cluster:c".into(),
            secret_arn: "arn:aws:secretsmanager:us-east-1:123456789012:secret:s".into(),
            ..Default::default()
        });
    }

    match ConnectionSpec::resolve(&config) {
        Ok(spec) => {
            if !echoed {
                assert!(!format!("{:?}", spec).contains(&password));
            }
            let _ = select_transport(&spec);
        }
        Err(err) => {
            if !echoed {
                assert!(!err.to_string().contains(&password));
            }
        }
    }
});
