use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::{Method, StatusCode, Uri};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::addon::guard;
use crate::client::{self, BoxedStream};
use crate::connection::{ConnContext, ServerConn};
use crate::flow::{self, Flow};
use crate::http::{self as hx};
use crate::proxy::{Shared, attacker};
use crate::upstream::default_port;

/// Direct requests to the proxy that no addon claims get this, verbatim.
const DIRECT_REQUEST_MESSAGE: &str = "此为代理服务器，不能直接发起请求";

pub(crate) async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
	let ctx = ConnContext::new(peer, shared.upstream_cert, shared.pipeline.clone());
	shared.pipeline.client_connected(&ctx.client).await;

	let io = TokioIo::new(stream);
	let svc_shared = shared.clone();
	let svc_ctx = ctx.clone();
	let service = service_fn(move |req| {
		let shared = svc_shared.clone();
		let ctx = svc_ctx.clone();
		async move { route(shared, ctx, req).await }
	});

	let conn = hyper::server::conn::http1::Builder::new()
		.serve_connection(io, service)
		.with_upgrades();
	if let Err(e) = conn.await {
		debug!(%peer, error = %e, "client connection ended");
	}
	// A CONNECT hands the socket to a tunnel task; the context must outlive it.
	if let Some(tunnel) = ctx.take_tunnel_task() {
		let _ = tunnel.await;
	}
	ctx.shutdown().await;
}

async fn route(
	shared: Arc<Shared>,
	ctx: Arc<ConnContext>,
	req: http::Request<Incoming>,
) -> Result<hx::Response, Infallible> {
	if req.method() == Method::CONNECT {
		return Ok(handle_connect(shared, ctx, req).await);
	}

	if req.uri().authority().is_none() {
		// Not proxying: the request is addressed to the proxy itself.
		let (parts, body) = req.into_parts();
		let mut request = http::Request::from_parts(parts, hx::incoming(body));
		if let Some(resp) = shared.pipeline.access_proxy_server(&mut request).await {
			return Ok(resp);
		}
		return Ok(text_response(StatusCode::BAD_REQUEST, DIRECT_REQUEST_MESSAGE));
	}

	// Plain HTTP proxying: flows ride the per-connection origin socket, opened
	// lazily by the first request that needs it.
	install_plain_dial(&shared, &ctx, req.uri());
	Ok(attacker::attack(shared, ctx, req, "", false).await)
}

async fn handle_connect(
	shared: Arc<Shared>,
	ctx: Arc<ConnContext>,
	req: http::Request<Incoming>,
) -> hx::Response {
	let Some(authority) = req.uri().authority().cloned() else {
		return text_response(StatusCode::BAD_REQUEST, "CONNECT requires authority");
	};
	let host = authority.host().to_string();
	let port = authority.port_u16().unwrap_or(443);

	let mut flow = Flow::new(
		ctx.clone(),
		flow::Request {
			method: req.method().clone(),
			url: req.uri().clone(),
			version: req.version(),
			headers: req.headers().clone(),
			body: None,
		},
	);
	let intercept = shared.should_intercept(&flow.request);
	ctx.set_intercept(intercept);
	debug!(host = %authority, intercept, "CONNECT");

	for addon in shared.pipeline.addons() {
		guard("request_headers", addon.request_headers(&mut flow)).await;
	}

	// The eager path reaches the origin before answering the client so its
	// handshake can be mirrored later; the bypass path needs a socket to
	// splice. Only the lazy intercept defers dialing.
	let eager_socket: Option<BoxedStream> = if !intercept || shared.upstream_cert {
		let upstream = shared.resolver.resolve(&flow.request.url);
		match client::dial_upstream(upstream.as_ref(), &host, port, shared.ssl_insecure).await {
			Ok(socket) => {
				let server = ServerConn::new(authority.to_string(), intercept, false);
				ctx.record_server(server);
				shared.pipeline.server_connected(&ctx).await;
				Some(socket)
			},
			Err(e) => {
				if e.is_benign_disconnect() {
					debug!(host = %authority, error = %e, "CONNECT dial failed");
				} else {
					info!(host = %authority, error = %e, "CONNECT dial failed");
				}
				flow.finish();
				return status_response(StatusCode::BAD_GATEWAY);
			},
		}
	} else {
		None
	};

	flow.response = Some(flow::Response::new(StatusCode::OK));
	for addon in shared.pipeline.addons() {
		guard("response_headers", addon.response_headers(&mut flow)).await;
	}

	let on_upgrade = hyper::upgrade::on(req);
	let task_shared = shared.clone();
	let task_ctx = ctx.clone();
	let task = tokio::spawn(async move {
		match on_upgrade.await {
			Ok(upgraded) => {
				tunnel(
					task_shared.clone(),
					task_ctx,
					upgraded,
					host,
					port,
					intercept,
					eager_socket,
				)
				.await;
			},
			Err(e) => debug!(error = %e, "CONNECT upgrade failed"),
		}
		for addon in task_shared.pipeline.addons() {
			guard("response", addon.response(&mut flow)).await;
		}
		flow.finish();
	});
	ctx.set_tunnel_task(task);

	status_response(StatusCode::OK)
}

/// After `200 Connection Established`, look at the client's first bytes to
/// tell TLS from anything else, then either forge or splice.
async fn tunnel(
	shared: Arc<Shared>,
	ctx: Arc<ConnContext>,
	upgraded: hyper::upgrade::Upgraded,
	host: String,
	port: u16,
	intercept: bool,
	eager_socket: Option<BoxedStream>,
) {
	let mut client_io = TokioIo::new(upgraded);
	let mut magic = [0u8; 3];
	if let Err(e) = client_io.read_exact(&mut magic).await {
		debug!(error = %e, "reading tunnel preamble");
		return;
	}
	let client_stream = Prefixed::new(Bytes::copy_from_slice(&magic), client_io);

	if intercept && crate::tls::is_tls_record(&magic) {
		attacker::serve_intercepted(shared, ctx, client_stream, host, port, eager_socket).await;
		return;
	}

	// Bypass, or an intercepted tunnel carrying something other than TLS
	// (typically plaintext websockets): splice bytes verbatim.
	let origin: BoxedStream = match eager_socket {
		Some(socket) => socket,
		None => {
			let uri = authority_uri("https", &host, port);
			let upstream = shared.resolver.resolve(&uri);
			match client::dial_upstream(upstream.as_ref(), &host, port, shared.ssl_insecure).await {
				Ok(socket) => {
					let server = ServerConn::new(format!("{host}:{port}"), false, false);
					ctx.record_server(server);
					shared.pipeline.server_connected(&ctx).await;
					socket
				},
				Err(e) => {
					info!(host = %host, error = %e, "tunnel dial failed");
					return;
				},
			}
		},
	};
	raw_tunnel(ctx, client_stream, origin).await;
}

pub(crate) async fn raw_tunnel<C>(ctx: Arc<ConnContext>, mut client: C, mut origin: BoxedStream)
where
	C: AsyncRead + AsyncWrite + Unpin,
{
	match tokio::io::copy_bidirectional(&mut client, &mut origin).await {
		Ok((up, down)) => debug!(up, down, "tunnel closed"),
		Err(e) => debug!(error = %e, "tunnel closed"),
	}
	ctx.fire_server_disconnected().await;
}

fn install_plain_dial(shared: &Arc<Shared>, ctx: &Arc<ConnContext>, uri: &Uri) {
	let shared = shared.clone();
	let weak = Arc::downgrade(ctx);
	let uri = uri.clone();
	ctx.set_dial_fn(Box::new(move || {
		Box::pin(async move {
			let ctx = weak
				.upgrade()
				.ok_or_else(|| crate::proxy::ProxyError::Internal("connection gone".to_string()))?;
			let host = uri.host().unwrap_or_default().to_string();
			let port = uri.port_u16().unwrap_or_else(|| default_port("http"));
			let upstream = shared.resolver.resolve(&uri);

			// A plain-HTTP upstream proxy takes absolute-form requests on an
			// ordinary connection rather than a CONNECT tunnel.
			let via_http_proxy = upstream
				.as_ref()
				.is_some_and(|u| matches!(u.scheme(), "http" | "https"));
			let (socket, address, absolute_form) = if via_http_proxy {
				let proxy = upstream.as_ref().expect("checked above");
				let socket = client::dial_http_proxy(proxy, shared.ssl_insecure).await?;
				(socket, format!("{host}:{port}"), true)
			} else {
				let socket =
					client::dial_upstream(upstream.as_ref(), &host, port, shared.ssl_insecure).await?;
				(socket, format!("{host}:{port}"), false)
			};

			let server = ServerConn::new(address, false, absolute_form);
			ctx.record_server(server.clone());
			ctx.pipeline.server_connected(&ctx).await;

			let (send, driver) = client::per_conn_client(socket, false).await?;
			server.set_client(send);
			ctx.spawn_server_driver(driver);
			Ok(())
		})
	}));
}

pub(crate) fn authority_uri(scheme: &str, host: &str, port: u16) -> Uri {
	let authority = if host.contains(':') {
		// Bracket bare IPv6 literals.
		format!("[{host}]:{port}")
	} else {
		format!("{host}:{port}")
	};
	Uri::builder()
		.scheme(scheme)
		.authority(authority)
		.path_and_query("/")
		.build()
		.unwrap_or_default()
}

pub(crate) fn status_response(status: StatusCode) -> hx::Response {
	http::Response::builder()
		.status(status)
		.body(hx::empty())
		.expect("static response is valid")
}

pub(crate) fn text_response(status: StatusCode, message: &str) -> hx::Response {
	http::Response::builder()
		.status(status)
		.header(
			http::header::CONTENT_TYPE,
			"text/plain; charset=utf-8",
		)
		.body(hx::full(message.to_string()))
		.expect("static response is valid")
}

pin_project! {
	/// A stream that first replays already-consumed bytes, then continues
	/// from the underlying connection. Lets the tunnel peek at the protocol
	/// magic without losing it.
	pub(crate) struct Prefixed<S> {
		prefix: Bytes,
		#[pin]
		inner: S,
	}
}

impl<S> Prefixed<S> {
	pub(crate) fn new(prefix: Bytes, inner: S) -> Self {
		Prefixed { prefix, inner }
	}
}

impl<S: AsyncRead> AsyncRead for Prefixed<S> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		let this = self.project();
		if !this.prefix.is_empty() {
			let n = this.prefix.len().min(buf.remaining());
			buf.put_slice(&this.prefix.split_to(n));
			return Poll::Ready(Ok(()));
		}
		this.inner.poll_read(cx, buf)
	}
}

impl<S: AsyncWrite> AsyncWrite for Prefixed<S> {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		self.project().inner.poll_write(cx, buf)
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		self.project().inner.poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		self.project().inner.poll_shutdown(cx)
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[std::io::IoSlice<'_>],
	) -> Poll<std::io::Result<usize>> {
		self.project().inner.poll_write_vectored(cx, bufs)
	}

	fn is_write_vectored(&self) -> bool {
		self.inner.is_write_vectored()
	}
}
