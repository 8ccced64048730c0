#![no_main]

use libfuzzer_sys::fuzz_target;
use mysql_provider::connection::{PemSource, ProxyConfig};
use mysql_provider::Endpoint;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(endpoint) = Endpoint::parse(s) {
        let _ = endpoint.to_string();
        let _ = endpoint.host_port();
    }

    if let Ok(proxy) = ProxyConfig::parse(s) {
        let _ = format!("{:?}", proxy);
    }

    let _ = PemSource::parse(s);
});
