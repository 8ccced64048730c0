//! SOCKS5 proxy support
//!
//! The MySQL driver dials plain TCP addresses, so proxied connections go through
//! a local forwarder: it listens on `127.0.0.1:0`, and for every accepted socket
//! it opens a SOCKS5 tunnel (RFC 1928, username/password per RFC 1929) to the
//! database endpoint and relays bytes in both directions.

use crate::auth::SecretString;
use crate::{Error, Result};
use percent_encoding::percent_decode_str;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
const SOCKS5_AUTH_METHOD_PASSWORD: u8 = 0x02;
const SOCKS5_AUTH_FAILED: u8 = 0xFF;
const SOCKS5_AUTH_SUBNEGOTIATION_VERSION: u8 = 0x01;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;
const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;

/// Default SOCKS port when the proxy URL omits it
pub const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Bound on establishing one tunnel (TCP connect plus handshake)
const TUNNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Parsed SOCKS5 proxy URL
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<SecretString>,
    remote_dns: bool,
    url: SecretString,
}

impl ProxyConfig {
    /// Parse `socks5://[user:pass@]host[:port]` or `socks5h://...`.
    ///
    /// `socks5h` resolves the target hostname at the proxy; `socks5` resolves it locally.
    pub fn parse(value: &str) -> Result<Self> {
        let url = url::Url::parse(value.trim())
            .map_err(|e| Error::Config(format!("invalid proxy URL: {}", e)))?;

        let remote_dns = match url.scheme() {
            "socks5" => false,
            "socks5h" => true,
            other => {
                return Err(Error::Config(format!(
                    "unsupported proxy scheme '{}': expected socks5 or socks5h",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Config("proxy URL is missing a host".into()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let username = Some(decode_userinfo(url.username(), "username")?).filter(|u| !u.is_empty());
        let password = url
            .password()
            .map(|p| decode_userinfo(p, "password").map(SecretString::new))
            .transpose()?;

        if username.as_ref().is_some_and(|u| u.len() > 255)
            || password.as_ref().is_some_and(|p| p.expose().len() > 255)
        {
            return Err(Error::Config(
                "proxy username and password must be at most 255 bytes".into(),
            ));
        }

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_SOCKS_PORT),
            username,
            password,
            remote_dns,
            url: SecretString::new(value.trim()),
        })
    }

    /// Proxy host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Proxy port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether target names are resolved by the proxy
    pub fn remote_dns(&self) -> bool {
        self.remote_dns
    }

    /// Whether the proxy requires username/password authentication
    pub fn has_credentials(&self) -> bool {
        self.username.is_some()
    }

    /// Proxy for HTTP clients talking to identity and control-plane endpoints
    pub fn to_reqwest(&self) -> Result<reqwest::Proxy> {
        reqwest::Proxy::all(self.url.expose())
            .map_err(|_| Error::Config("proxy URL is not usable for HTTP requests".into()))
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("remote_dns", &self.remote_dns)
            .finish()
    }
}

/// Decode a percent-encoded userinfo component; the value never appears in errors
fn decode_userinfo(s: &str, what: &str) -> Result<String> {
    percent_decode_str(s)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| Error::Config(format!("proxy {} is not valid UTF-8 after percent-decoding", what)))
}

/// Open a SOCKS5 tunnel to `host:port` over an established proxy connection.
pub async fn socks5_connect<S>(stream: &mut S, proxy: &ProxyConfig, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_auth(stream, proxy).await?;

    let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0x00];
    match target_address(proxy, host, port).await? {
        TargetAddr::Ip(IpAddr::V4(ip)) => {
            request.push(SOCKS5_ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        TargetAddr::Ip(IpAddr::V6(ip)) => {
            request.push(SOCKS5_ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        TargetAddr::Domain(name) => {
            if name.len() > 255 {
                return Err(Error::Config(format!("hostname '{}' is too long for SOCKS5", name)));
            }
            request.push(SOCKS5_ATYP_DOMAIN);
            request.push(name.len() as u8);
            request.extend_from_slice(name.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(Error::Connection(format!(
            "invalid SOCKS version in proxy reply: {}",
            head[0]
        )));
    }
    if head[1] != SOCKS5_REPLY_SUCCEEDED {
        return Err(Error::Connection(format!(
            "proxy refused connection to {}: {}",
            crate::client::join_host_port(host, port),
            reply_message(head[1])
        )));
    }

    // bound address, unused
    let addr_len = match head[3] {
        SOCKS5_ATYP_IPV4 => 4,
        SOCKS5_ATYP_IPV6 => 16,
        SOCKS5_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(Error::Connection(format!(
                "unsupported address type in proxy reply: {}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

async fn negotiate_auth<S>(stream: &mut S, proxy: &ProxyConfig) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if proxy.has_credentials() {
        &[SOCKS5_VERSION, 2, SOCKS5_AUTH_METHOD_NONE, SOCKS5_AUTH_METHOD_PASSWORD]
    } else {
        &[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]
    };
    stream.write_all(greeting).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS5_VERSION {
        return Err(Error::Connection(format!(
            "invalid SOCKS version from proxy: {}",
            reply[0]
        )));
    }

    match reply[1] {
        SOCKS5_AUTH_METHOD_NONE => Ok(()),
        SOCKS5_AUTH_METHOD_PASSWORD if proxy.has_credentials() => {
            let user = proxy.username.as_deref().unwrap_or_default();
            let pass = proxy.password.as_ref().map(SecretString::expose).unwrap_or_default();

            let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
            msg.push(SOCKS5_AUTH_SUBNEGOTIATION_VERSION);
            msg.push(user.len() as u8);
            msg.extend_from_slice(user.as_bytes());
            msg.push(pass.len() as u8);
            msg.extend_from_slice(pass.as_bytes());
            stream.write_all(&msg).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(Error::Auth("proxy rejected username/password".into()));
            }
            Ok(())
        }
        SOCKS5_AUTH_FAILED => Err(Error::Config(
            "proxy accepts none of the offered authentication methods".into(),
        )),
        other => Err(Error::Connection(format!(
            "proxy selected unsupported authentication method {}",
            other
        ))),
    }
}

enum TargetAddr {
    Ip(IpAddr),
    Domain(String),
}

async fn target_address(proxy: &ProxyConfig, host: &str, port: u16) -> Result<TargetAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(TargetAddr::Ip(ip));
    }
    if proxy.remote_dns {
        return Ok(TargetAddr::Domain(host.to_string()));
    }

    let mut addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| {
        Error::Connection(format!("failed to resolve '{}': {}", host, e))
    })?;
    addrs
        .next()
        .map(|addr| TargetAddr::Ip(addr.ip()))
        .ok_or_else(|| Error::Connection(format!("no addresses found for '{}'", host)))
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// Local TCP listener tunneling every accepted connection through a SOCKS5 proxy
#[derive(Debug)]
pub struct Socks5Forwarder {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Socks5Forwarder {
    /// Start forwarding `127.0.0.1:<ephemeral>` to `target_host:target_port` via `proxy`.
    ///
    /// The forwarder stops when `cancel` (or a parent token) is cancelled.
    pub async fn spawn(
        proxy: ProxyConfig,
        target_host: impl Into<String>,
        target_port: u16,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_addr = listener.local_addr()?;
        let target_host = target_host.into();
        let cancel = cancel.child_token();

        let span = tracing::debug_span!(
            "socks5_forwarder",
            proxy = %crate::client::join_host_port(&proxy.host, proxy.port),
            target = %crate::client::join_host_port(&target_host, target_port),
            local = %local_addr,
        );

        let loop_cancel = cancel.clone();
        let task = tokio::spawn(
            async move {
                loop {
                    let accepted = tokio::select! {
                        _ = loop_cancel.cancelled() => break,
                        accepted = listener.accept() => accepted,
                    };

                    let (inbound, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "forwarder accept failed");
                            continue;
                        }
                    };

                    let proxy = proxy.clone();
                    let target_host = target_host.clone();
                    let conn_cancel = loop_cancel.clone();
                    tokio::spawn(
                        async move {
                            tokio::select! {
                                _ = conn_cancel.cancelled() => {}
                                result = relay(inbound, &proxy, &target_host, target_port) => {
                                    if let Err(e) = result {
                                        tracing::warn!(error = %e, "proxied connection failed");
                                    }
                                }
                            }
                        }
                        .instrument(tracing::debug_span!("socks5_relay", peer = %peer)),
                    );
                }
                tracing::debug!("forwarder stopped");
            }
            .instrument(span),
        );

        tracing::info!(local = %local_addr, "SOCKS5 forwarder listening");

        Ok(Self {
            local_addr,
            cancel,
            task: Some(task),
        })
    }

    /// Address the driver should dial
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close every relayed connection
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Socks5Forwarder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn relay(mut inbound: TcpStream, proxy: &ProxyConfig, host: &str, port: u16) -> Result<()> {
    let mut outbound = tokio::time::timeout(TUNNEL_TIMEOUT, async {
        let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
        socks5_connect(&mut stream, proxy, host, port).await?;
        Ok::<_, Error>(stream)
    })
    .await
    .map_err(|_| Error::Connection(format!("timed out opening proxy tunnel after {:?}", TUNNEL_TIMEOUT)))??;

    let _ = outbound.set_nodelay(true);
    let (up, down) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
    tracing::debug!(bytes_up = up, bytes_down = down, "proxied connection closed");
    Ok(())
}
