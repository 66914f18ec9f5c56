use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use hyper::body::Incoming;
use hyper::rt::{Read as RtRead, Write as RtWrite};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use crate::http::Body;
use crate::proxy::ProxyError;
use crate::upstream::{UpstreamResolver, default_port};

pub mod connect_tunnel;
pub mod tls;

pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// An established (possibly multi-hop) upstream byte stream.
pub type BoxedStream = Box<dyn Stream>;

/// Future driving a hyper connection; spawned by whoever owns the socket.
pub type ConnDriver = BoxFuture<'static, ()>;

/// Opens the transport to `host:port`, traversing the effective upstream
/// (HTTP(S) proxy CONNECT or SOCKS5) when one is configured.
pub async fn dial_upstream(
	upstream: Option<&Url>,
	host: &str,
	port: u16,
	insecure: bool,
) -> Result<BoxedStream, ProxyError> {
	let Some(proxy) = upstream else {
		let tcp = TcpStream::connect((host, port))
			.await
			.map_err(|e| ProxyError::Dial(format!("connect {host}:{port}: {e}")))?;
		return Ok(Box::new(tcp));
	};

	let scheme = proxy.scheme();
	let proxy_host = proxy
		.host_str()
		.ok_or_else(|| ProxyError::Dial(format!("upstream url {proxy} has no host")))?;
	let proxy_port = proxy.port().unwrap_or_else(|| default_port(scheme));
	let dest = format!("{host}:{port}");

	match scheme {
		"http" | "https" => {
			let tcp = TcpStream::connect((proxy_host, proxy_port))
				.await
				.map_err(|e| ProxyError::Dial(format!("connect proxy {proxy_host}:{proxy_port}: {e}")))?;
			let mut stream: BoxedStream = if scheme == "https" {
				let mut config = crate::tls::plain_client_config(insecure);
				// The CONNECT exchange is textual HTTP/1; never offer h2 here.
				config.alpn_protocols.clear();
				let tls = TlsConnector::from(Arc::new(config))
					.connect(tls::server_name(proxy_host)?, tcp)
					.await
					.map_err(|e| ProxyError::TlsHandshake(format!("proxy tls: {e}")))?;
				Box::new(tls)
			} else {
				Box::new(tcp)
			};
			let auth = if proxy.username().is_empty() {
				None
			} else {
				Some((proxy.username(), proxy.password()))
			};
			connect_tunnel::handshake(stream.as_mut(), &dest, auth).await?;
			Ok(stream)
		},
		"socks5" => {
			let proxy_addr = (proxy_host, proxy_port);
			let stream = if proxy.username().is_empty() {
				tokio_socks::tcp::Socks5Stream::connect(proxy_addr, dest.as_str()).await
			} else {
				tokio_socks::tcp::Socks5Stream::connect_with_password(
					proxy_addr,
					dest.as_str(),
					proxy.username(),
					proxy.password().unwrap_or_default(),
				)
				.await
			}
			.map_err(|e| ProxyError::Dial(format!("socks5 {proxy_host}:{proxy_port}: {e}")))?;
			Ok(Box::new(stream))
		},
		other => Err(ProxyError::Dial(format!("unsupported upstream scheme {other:?}"))),
	}
}

/// Connects to an upstream HTTP(S) proxy for absolute-form relaying: no
/// CONNECT exchange, just the (optionally TLS-wrapped) proxy socket.
pub async fn dial_http_proxy(proxy: &Url, insecure: bool) -> Result<BoxedStream, ProxyError> {
	let proxy_host = proxy
		.host_str()
		.ok_or_else(|| ProxyError::Dial(format!("upstream url {proxy} has no host")))?;
	let proxy_port = proxy.port().unwrap_or_else(|| default_port(proxy.scheme()));
	let tcp = TcpStream::connect((proxy_host, proxy_port))
		.await
		.map_err(|e| ProxyError::Dial(format!("connect proxy {proxy_host}:{proxy_port}: {e}")))?;
	if proxy.scheme() == "https" {
		let mut config = crate::tls::plain_client_config(insecure);
		config.alpn_protocols.clear();
		let tls = TlsConnector::from(Arc::new(config))
			.connect(tls::server_name(proxy_host)?, tcp)
			.await
			.map_err(|e| ProxyError::TlsHandshake(format!("proxy tls: {e}")))?;
		Ok(Box::new(tls))
	} else {
		Ok(Box::new(tcp))
	}
}

/// An HTTP client bound to one upstream socket: HTTP/1.1 with upgrade
/// support, or h2 multiplexing over the same connection.
pub enum SendClient {
	Http1(tokio::sync::Mutex<hyper::client::conn::http1::SendRequest<Body>>),
	Http2(hyper::client::conn::http2::SendRequest<Body>),
}

impl SendClient {
	pub fn is_h2(&self) -> bool {
		matches!(self, SendClient::Http2(_))
	}

	pub async fn send(
		&self,
		req: ::http::Request<Body>,
	) -> Result<::http::Response<Incoming>, ProxyError> {
		match self {
			SendClient::Http1(sender) => {
				let mut sender = sender.lock().await;
				sender.ready().await.map_err(classify)?;
				sender.send_request(req).await.map_err(classify)
			},
			SendClient::Http2(sender) => {
				let mut sender = sender.clone();
				sender.ready().await.map_err(classify)?;
				sender.send_request(req).await.map_err(classify)
			},
		}
	}
}

/// Malformed HTTP from the origin is its own failure class; everything else
/// on an established connection is a send failure.
fn classify(e: hyper::Error) -> ProxyError {
	if e.is_parse() || e.is_parse_status() || e.is_incomplete_message() {
		ProxyError::UpstreamResponse(e.to_string())
	} else {
		ProxyError::UpstreamSend(e.to_string())
	}
}

impl std::fmt::Debug for SendClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(if self.is_h2() { "SendClient(h2)" } else { "SendClient(http/1.1)" })
	}
}

/// Performs the client-side HTTP handshake over an owned socket, returning
/// the sender plus the connection driver the caller must spawn.
pub async fn per_conn_client<S>(io: S, h2: bool) -> Result<(SendClient, ConnDriver), ProxyError>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let io = TokioIo::new(io);
	if h2 {
		let (sender, conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), io)
			.await
			.map_err(|e| ProxyError::UpstreamSend(format!("h2 handshake: {e}")))?;
		let driver = async move {
			if let Err(e) = conn.await {
				debug!(error = %e, "upstream h2 connection closed");
			}
		}
		.boxed();
		Ok((SendClient::Http2(sender), driver))
	} else {
		let (sender, conn) = hyper::client::conn::http1::handshake(io)
			.await
			.map_err(|e| ProxyError::UpstreamSend(format!("http1 handshake: {e}")))?;
		let driver = async move {
			if let Err(e) = conn.with_upgrades().await {
				debug!(error = %e, "upstream connection closed");
			}
		}
		.boxed();
		Ok((SendClient::Http1(tokio::sync::Mutex::new(sender)), driver))
	}
}

/// The "separate client" path: a pooled client honoring the configured
/// upstream proxy and the system TLS trust, shared by every flow an addon
/// (or a target rewrite) routes away from the per-connection socket.
/// Connections pool per scheme+authority for the lifetime of the proxy;
/// redirects are never followed.
#[derive(Clone)]
pub struct SeparateClient {
	client: hyper_util::client::legacy::Client<SeparateConnector, Body>,
}

impl std::fmt::Debug for SeparateClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SeparateClient").finish()
	}
}

impl SeparateClient {
	pub fn new(resolver: UpstreamResolver, insecure: bool) -> Self {
		let mut builder = hyper_util::client::legacy::Client::builder(TokioExecutor::new());
		builder.pool_timer(TokioTimer::new());
		builder.timer(TokioTimer::new());
		builder.pool_idle_timeout(POOL_IDLE_TIMEOUT);
		let client = builder.build(SeparateConnector { resolver, insecure });
		SeparateClient { client }
	}

	pub async fn send(
		&self,
		req: ::http::Request<Body>,
	) -> Result<::http::Response<Incoming>, ProxyError> {
		self.client.request(req).await.map_err(|e| {
			if e.is_connect() {
				ProxyError::Dial(e.to_string())
			} else {
				ProxyError::UpstreamSend(e.to_string())
			}
		})
	}
}

const POOL_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(90);

/// Dials for the separate client: the effective upstream per target, TLS
/// with the system trust for https. What the pool needs to know about each
/// connection — negotiated h2, HTTP-proxy hop — rides on [`Connected`].
#[derive(Clone)]
struct SeparateConnector {
	resolver: UpstreamResolver,
	insecure: bool,
}

impl tower::Service<::http::Uri> for SeparateConnector {
	type Response = PooledStream;
	type Error = crate::http::BoxError;
	type Future = BoxFuture<'static, Result<PooledStream, Self::Error>>;

	fn poll_ready(
		&mut self,
		_cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<Result<(), Self::Error>> {
		std::task::Poll::Ready(Ok(()))
	}

	fn call(&mut self, dst: ::http::Uri) -> Self::Future {
		let connector = self.clone();
		Box::pin(async move { connector.connect(dst).await.map_err(Into::into) })
	}
}

impl SeparateConnector {
	async fn connect(&self, dst: ::http::Uri) -> Result<PooledStream, ProxyError> {
		let scheme = dst.scheme_str().unwrap_or("http").to_string();
		let host = dst
			.host()
			.ok_or_else(|| ProxyError::Dial("request has no host".to_string()))?
			.to_string();
		let port = dst.port_u16().unwrap_or_else(|| default_port(&scheme));
		let upstream = self.resolver.resolve(&dst);

		if scheme == "https" {
			let tcp = dial_upstream(upstream.as_ref(), &host, port, self.insecure).await?;
			let config = crate::tls::plain_client_config(self.insecure);
			let tls = TlsConnector::from(Arc::new(config))
				.connect(tls::server_name(&host)?, tcp)
				.await
				.map_err(|e| ProxyError::TlsHandshake(e.to_string()))?;
			let h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2");
			Ok(PooledStream::new(Box::new(tls), h2, false))
		} else {
			// Plain HTTP through an HTTP(S) proxy is relayed absolute-form on
			// an ordinary connection, not through a CONNECT tunnel.
			let via_http_proxy = upstream
				.as_ref()
				.is_some_and(|u| matches!(u.scheme(), "http" | "https"));
			if via_http_proxy {
				let proxy = upstream.as_ref().expect("checked above");
				let socket = dial_http_proxy(proxy, self.insecure).await?;
				Ok(PooledStream::new(socket, false, true))
			} else {
				let socket = dial_upstream(upstream.as_ref(), &host, port, self.insecure).await?;
				Ok(PooledStream::new(socket, false, false))
			}
		}
	}
}

pin_project! {
	/// A pooled upstream connection for the separate client.
	pub struct PooledStream {
		#[pin]
		inner: TokioIo<BoxedStream>,
		h2: bool,
		proxied: bool,
	}
}

impl PooledStream {
	fn new(stream: BoxedStream, h2: bool, proxied: bool) -> Self {
		PooledStream {
			inner: TokioIo::new(stream),
			h2,
			proxied,
		}
	}
}

impl Connection for PooledStream {
	fn connected(&self) -> Connected {
		let mut connected = Connected::new();
		if self.h2 {
			connected = connected.negotiated_h2();
		}
		if self.proxied {
			connected = connected.proxy(true);
		}
		connected
	}
}

impl RtRead for PooledStream {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: hyper::rt::ReadBufCursor<'_>,
	) -> std::task::Poll<std::io::Result<()>> {
		self.project().inner.poll_read(cx, buf)
	}
}

impl RtWrite for PooledStream {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &[u8],
	) -> std::task::Poll<std::io::Result<usize>> {
		self.project().inner.poll_write(cx, buf)
	}

	fn poll_flush(
		self: Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<std::io::Result<()>> {
		self.project().inner.poll_flush(cx)
	}

	fn poll_shutdown(
		self: Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<std::io::Result<()>> {
		self.project().inner.poll_shutdown(cx)
	}

	fn is_write_vectored(&self) -> bool {
		self.inner.is_write_vectored()
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		bufs: &[std::io::IoSlice<'_>],
	) -> std::task::Poll<std::io::Result<usize>> {
		self.project().inner.poll_write_vectored(cx, bufs)
	}
}

/// Shapes a proxied request for the wire: h2 wants the absolute URI (hyper
/// derives the pseudo-headers from it), HTTP/1.1 wants origin-form plus Host
/// — unless it is being relayed through a plain HTTP proxy, which takes the
/// absolute form too.
pub fn prepare_for_send(
	req: ::http::Request<Body>,
	h2: bool,
	absolute_form: bool,
) -> Result<::http::Request<Body>, ProxyError> {
	if h2 {
		// :authority carries the target in h2; a stray Host header from an
		// HTTP/1.1 client side must not ride along.
		let (mut parts, body) = req.into_parts();
		parts.headers.remove(::http::header::HOST);
		return Ok(::http::Request::from_parts(parts, body));
	}
	let (mut parts, body) = req.into_parts();
	let authority = parts
		.uri
		.authority()
		.map(|a| a.to_string());
	if let Some(authority) = authority {
		if !parts.headers.contains_key(::http::header::HOST) {
			parts.headers.insert(
				::http::header::HOST,
				::http::HeaderValue::from_str(&authority)
					.map_err(|e| ProxyError::UpstreamSend(format!("host header: {e}")))?,
			);
		}
		if !absolute_form {
			parts.uri = parts
				.uri
				.path_and_query()
				.map(|pq| pq.as_str())
				.unwrap_or("/")
				.parse()
				.map_err(|e| ProxyError::UpstreamSend(format!("origin-form uri: {e}")))?;
		}
	}
	parts.version = ::http::Version::HTTP_11;
	Ok(::http::Request::from_parts(parts, body))
}

const HOP_BY_HOP: &[&str] = &[
	"connection",
	"proxy-connection",
	"keep-alive",
	"proxy-authenticate",
	"proxy-authorization",
	"te",
	"trailer",
	"transfer-encoding",
	"upgrade",
];

/// Strips hop-by-hop headers that must not be forwarded past this hop.
pub fn strip_hop_headers(headers: &mut ::http::HeaderMap) {
	for name in HOP_BY_HOP {
		headers.remove(*name);
	}
}
