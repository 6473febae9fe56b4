//! Talking to the meshward server: address registration and queries.
//!
//! Plain HTTP/1.1 over hyper's connection API, one connection per
//! request. Responses use the server's `{success, data, error}` envelope.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use meshward_core::{ClientConfig, ConfigHandle};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info};

use crate::error::{HealError, HealResult};

/// Re-registers this node's current overlay address with the server.
#[async_trait]
pub trait AddressReporter: Send + Sync {
    async fn report(&self) -> HealResult<()>;
}

#[derive(Debug, Serialize)]
struct RememberRequest<'a> {
    identity: &'a str,
    address: &'a str,
}

/// Server acknowledgement of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RememberAck {
    pub identity: String,
    pub address: String,
    pub last_seen: u64,
    pub total_clients: usize,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// Minimal HTTP client for the meshward server API.
#[derive(Debug, Clone)]
pub struct ServerClient {
    host: String,
    port: u16,
    prefix: String,
    timeout: Duration,
}

impl ServerClient {
    /// `base` is the configured `server_base`, e.g. `http://10.147.17.1:5418`.
    pub fn new(base: &str, timeout: Duration) -> HealResult<Self> {
        let uri: Uri = base
            .parse()
            .map_err(|e| HealError::Http(format!("invalid server address {base:?}: {e}")))?;
        if uri.scheme_str() != Some("http") {
            return Err(HealError::Http(format!("unsupported scheme in {base:?}")));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| HealError::Http(format!("no host in {base:?}")))?;
        Ok(Self {
            host: authority
                .host()
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string(),
            port: authority.port_u16().unwrap_or(80),
            prefix: uri.path().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub async fn remember(&self, identity: &str, address: &str) -> HealResult<RememberAck> {
        let body = serde_json::to_vec(&RememberRequest { identity, address })
            .map_err(|e| HealError::Decode(e.to_string()))?;
        let bytes = self.send(Method::POST, "/clients/remember", Some(body)).await?;
        decode_envelope(&bytes)
    }

    /// GET an enveloped JSON endpoint and return its `data`.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> HealResult<T> {
        let bytes = self.send(Method::GET, path, None).await?;
        decode_envelope(&bytes)
    }

    /// POST to an enveloped JSON endpoint that takes no body.
    pub async fn post_json<T: DeserializeOwned>(&self, path: &str) -> HealResult<T> {
        let bytes = self.send(Method::POST, path, None).await?;
        decode_envelope(&bytes)
    }

    /// GET a plain-text endpoint such as `/metrics`.
    pub async fn get_text(&self, path: &str) -> HealResult<String> {
        let bytes = self.send(Method::GET, path, None).await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| HealError::Decode(e.to_string()))
    }

    async fn send(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> HealResult<Bytes> {
        let target = format!("{}{path}", self.prefix);
        match tokio::time::timeout(self.timeout, self.exchange(method, &target, body)).await {
            Ok(result) => result,
            Err(_) => Err(HealError::Http(format!(
                "{target} timed out after {:?}",
                self.timeout
            ))),
        }
    }

    fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    async fn exchange(&self, method: Method, target: &str, body: Option<Vec<u8>>) -> HealResult<Bytes> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| HealError::Http(format!("connect {}: {e}", self.authority())))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| HealError::Http(e.to_string()))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(target)
            .header(http::header::HOST, self.authority())
            .header(http::header::USER_AGENT, "meshward/0.1");
        if body.is_some() {
            builder = builder.header(http::header::CONTENT_TYPE, "application/json");
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| HealError::Http(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| HealError::Http(e.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| HealError::Http(e.to_string()))?
            .to_bytes();

        if status.is_success() {
            debug!(%target, %status, "server request ok");
            Ok(bytes)
        } else {
            Err(server_error(status, &bytes))
        }
    }
}

fn decode_envelope<T: DeserializeOwned>(bytes: &[u8]) -> HealResult<T> {
    let envelope: Envelope<T> =
        serde_json::from_slice(bytes).map_err(|e| HealError::Decode(e.to_string()))?;
    match (envelope.success, envelope.data) {
        (true, Some(data)) => Ok(data),
        (_, _) => Err(HealError::Decode(
            envelope.error.unwrap_or_else(|| "response carried no data".to_string()),
        )),
    }
}

fn server_error(status: StatusCode, bytes: &[u8]) -> HealError {
    let message = serde_json::from_slice::<Envelope<serde_json::Value>>(bytes)
        .ok()
        .and_then(|e| e.error)
        .unwrap_or_else(|| String::from_utf8_lossy(bytes).chars().take(200).collect());
    HealError::Server {
        status: status.as_u16(),
        message,
    }
}

/// Local address of the route towards `target`.
///
/// Connecting a UDP socket selects a source address without sending
/// anything, which on an overlay network is this node's overlay address.
pub async fn discover_overlay_address(target: &str) -> HealResult<IpAddr> {
    let remote = tokio::net::lookup_host((target, 9))
        .await
        .map_err(|e| HealError::Address(format!("resolve {target}: {e}")))?
        .next()
        .ok_or_else(|| HealError::Address(format!("{target} did not resolve")))?;

    let bind = if remote.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| HealError::Address(e.to_string()))?;
    socket
        .connect(remote)
        .await
        .map_err(|e| HealError::Address(format!("no route to {target}: {e}")))?;
    let local = socket
        .local_addr()
        .map_err(|e| HealError::Address(e.to_string()))?
        .ip();

    if local.is_unspecified() {
        return Err(HealError::Address(format!("no source address for {target}")));
    }
    Ok(local)
}

/// Reports the configured (or discovered) overlay address under this
/// node's identity.
pub struct ServerReporter {
    config: ConfigHandle<ClientConfig>,
    timeout: Duration,
}

impl ServerReporter {
    pub fn new(config: ConfigHandle<ClientConfig>, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    /// Register once and return the server's acknowledgement.
    pub async fn remember_self(&self) -> HealResult<RememberAck> {
        let config = self.config.current();
        let address = match config.overlay_address.as_deref().map(str::trim) {
            Some(address) if !address.is_empty() => address.to_string(),
            _ if !config.target_address.trim().is_empty() => {
                discover_overlay_address(config.target_address.trim())
                    .await?
                    .to_string()
            }
            _ => {
                return Err(HealError::Address(
                    "set overlay_address or target_address".to_string(),
                ));
            }
        };
        let identity = config.resolved_identity(&address);

        let ack = ServerClient::new(&config.server_base, self.timeout)?
            .remember(&identity, &address)
            .await?;
        info!(%identity, %address, total_clients = ack.total_clients, "registered with server");
        Ok(ack)
    }
}

#[async_trait]
impl AddressReporter for ServerReporter {
    async fn report(&self) -> HealResult<()> {
        self.remember_self().await.map(|_| ())
    }
}
