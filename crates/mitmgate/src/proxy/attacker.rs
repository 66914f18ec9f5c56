use std::sync::Arc;

use http::{StatusCode, Uri};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

use crate::addon::{guard, guard_sync};
use crate::client::{self, BoxedStream};
use crate::connection::{ConnContext, ServerConn};
use crate::flow::{self, Flow};
use crate::http::{self as hx, Body, IngestedBody};
use crate::proxy::entry::{authority_uri, status_response};
use crate::proxy::{ProxyError, Shared};
use crate::tls::ClientHelloCapture;

/// Maximum in-flight streams served to an h2 client over the forged TLS.
const H2_MAX_CONCURRENT_STREAMS: u32 = 100;

/// The interception core for a CONNECT tunnel that turned out to be TLS:
/// capture the ClientHello, coordinate the two handshakes, then serve the
/// decrypted requests.
///
/// The two handshakes form a diamond: the client side needs the origin's
/// negotiated ALPN before committing to a certificate, and the origin side
/// mirrors the client's ClientHello. The lazy acceptor holds the client
/// handshake open exactly at that point.
pub(crate) async fn serve_intercepted<S>(
	shared: Arc<Shared>,
	ctx: Arc<ConnContext>,
	client_stream: S,
	host: String,
	port: u16,
	eager_socket: Option<BoxedStream>,
) where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), client_stream);
	let start = match acceptor.await {
		Ok(start) => start,
		Err(e) => {
			debug!(host = %host, error = %e, "client hello never arrived");
			return;
		},
	};
	let capture = ClientHelloCapture::from_accepted(&start.client_hello());
	ctx.client.set_client_hello(capture.clone());
	let cert_name = capture.server_name.clone().unwrap_or_else(|| host.clone());

	// ALPN offered back to the client: exactly what the origin negotiated on
	// the eager path, http/1.1 only on the lazy path.
	let mut client_alpn: Vec<Vec<u8>> = Vec::new();
	if let Some(socket) = eager_socket {
		let server = ctx
			.server()
			.expect("eager CONNECT records the server before tunneling");
		let (tls_stream, origin_alpn) =
			match client::tls::handshake(socket, &capture, &host, shared.ssl_insecure).await {
				Ok(done) => done,
				Err(e) => {
					// Dropping `start` aborts the client handshake too.
					if e.is_benign_disconnect() {
						debug!(host = %host, error = %e, "origin tls handshake failed");
					} else {
						info!(host = %host, error = %e, "origin tls handshake failed");
					}
					return;
				},
			};
		if let Some(alpn) = &origin_alpn {
			server.set_negotiated_alpn(alpn.clone());
		}
		shared.pipeline.tls_established_server(&ctx).await;

		let h2 = origin_alpn.as_deref() == Some(b"h2");
		match client::per_conn_client(tls_stream, h2).await {
			Ok((send, driver)) => {
				server.set_client(send);
				ctx.spawn_server_driver(driver);
			},
			Err(e) => {
				info!(host = %host, error = %e, "origin http handshake failed");
				return;
			},
		}
		if let Some(alpn) = origin_alpn {
			client_alpn.push(alpn);
		}
	} else {
		client_alpn.push(b"http/1.1".to_vec());
		install_https_dial(&shared, &ctx, capture, host.clone(), port);
	}

	let leaf = match shared.ca.get_cert(&cert_name).await {
		Ok(leaf) => leaf,
		Err(e) => {
			warn!(%cert_name, error = %e, "leaf mint failed");
			return;
		},
	};
	let config = match crate::tls::forged_server_config(leaf.chain.clone(), leaf.key(), client_alpn)
	{
		Ok(config) => config,
		Err(e) => {
			warn!(%cert_name, error = %e, "forged server config rejected");
			return;
		},
	};
	let tls_stream = match start.into_stream(Arc::new(config)).await {
		Ok(stream) => stream,
		Err(e) => {
			debug!(host = %host, error = %e, "client tls handshake failed");
			return;
		},
	};
	ctx.client.set_tls();
	let negotiated = tls_stream.get_ref().1.alpn_protocol().map(|p| p.to_vec());
	let client_h2 = negotiated.as_deref() == Some(b"h2");
	if let Some(alpn) = negotiated {
		ctx.client.set_negotiated_alpn(alpn);
	}

	serve_decrypted(shared, ctx, tls_stream, host, port, client_h2).await;
}

/// Lazy attack: the origin is dialed (and its handshake mirrored from the
/// stored capture) only when the first decrypted request needs it.
fn install_https_dial(
	shared: &Arc<Shared>,
	ctx: &Arc<ConnContext>,
	capture: ClientHelloCapture,
	host: String,
	port: u16,
) {
	let shared = shared.clone();
	let weak = Arc::downgrade(ctx);
	ctx.set_dial_fn(Box::new(move || {
		Box::pin(async move {
			let ctx = weak
				.upgrade()
				.ok_or_else(|| ProxyError::Internal("connection gone".to_string()))?;
			let uri = authority_uri("https", &host, port);
			let upstream = shared.resolver.resolve(&uri);
			let socket =
				client::dial_upstream(upstream.as_ref(), &host, port, shared.ssl_insecure).await?;

			let server = ServerConn::new(format!("{host}:{port}"), true, false);
			ctx.record_server(server.clone());
			ctx.pipeline.server_connected(&ctx).await;

			let (tls_stream, origin_alpn) =
				client::tls::handshake(socket, &capture, &host, shared.ssl_insecure).await?;
			if let Some(alpn) = &origin_alpn {
				server.set_negotiated_alpn(alpn.clone());
			}
			ctx.pipeline.tls_established_server(&ctx).await;

			let h2 = origin_alpn.as_deref() == Some(b"h2");
			let (send, driver) = client::per_conn_client(tls_stream, h2).await?;
			server.set_client(send);
			ctx.spawn_server_driver(driver);
			Ok(())
		})
	}));
}

/// Serves decrypted requests over the forged TLS, h2 or HTTP/1.1 according
/// to the client-side ALPN. Closing the underlying client socket cancels
/// every in-flight stream.
async fn serve_decrypted<S>(
	shared: Arc<Shared>,
	ctx: Arc<ConnContext>,
	tls_stream: S,
	host: String,
	port: u16,
	client_h2: bool,
) where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let io = TokioIo::new(tls_stream);
	let fallback = format!("{host}:{port}");
	let svc_shared = shared.clone();
	let svc_ctx = ctx.clone();
	let service = service_fn(move |req| {
		let shared = svc_shared.clone();
		let ctx = svc_ctx.clone();
		let fallback = fallback.clone();
		async move {
			Ok::<_, std::convert::Infallible>(dispatch(shared, ctx, req, &fallback, client_h2).await)
		}
	});

	let token = ctx.close_token();
	if client_h2 {
		let mut builder = hyper::server::conn::http2::Builder::new(TokioExecutor::new());
		builder.max_concurrent_streams(H2_MAX_CONCURRENT_STREAMS);
		let conn = builder.serve_connection(io, service);
		tokio::select! {
			result = conn => {
				if let Err(e) = result {
					debug!(error = %e, "decrypted h2 connection ended");
				}
			},
			_ = token.cancelled() => {},
		}
	} else {
		let conn = hyper::server::conn::http1::Builder::new()
			.serve_connection(io, service)
			.with_upgrades();
		tokio::select! {
			result = conn => {
				if let Err(e) = result {
					debug!(error = %e, "decrypted connection ended");
				}
			},
			_ = token.cancelled() => {},
		}
	}
}

async fn dispatch(
	shared: Arc<Shared>,
	ctx: Arc<ConnContext>,
	req: http::Request<Incoming>,
	fallback_authority: &str,
	client_h2: bool,
) -> hx::Response {
	if is_websocket_upgrade(req.headers()) {
		return serve_wss(shared, ctx, req).await;
	}
	attack(shared, ctx, req, fallback_authority, client_h2).await
}

fn is_websocket_upgrade(headers: &http::HeaderMap) -> bool {
	let connection_upgrade = headers
		.get(http::header::CONNECTION)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
	let upgrade_ws = headers
		.get(http::header::UPGRADE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
	connection_upgrade && upgrade_ws
}

/// The flow engine: request hooks, bounded body buffering, upstream exchange,
/// response hooks, reply. Mirrors the hook contract exactly — a response
/// installed by an addon before the upstream send short-circuits the dial,
/// and response-phase hooks still see the synthetic response.
pub(crate) async fn attack(
	shared: Arc<Shared>,
	ctx: Arc<ConnContext>,
	req: http::Request<Incoming>,
	fallback_authority: &str,
	client_h2: bool,
) -> hx::Response {
	ctx.count_flow();
	let (parts, body) = req.into_parts();
	let Some(url) = absolute_url(&parts, ctx.client.tls(), fallback_authority) else {
		return status_response(StatusCode::BAD_REQUEST);
	};
	let mut flow = Flow::new(ctx.clone(), flow::Request::from_parts(&parts, url));
	let raw_authority = flow.request.url.authority().map(|a| a.to_string());
	let raw_scheme = flow.request.url.scheme_str().map(|s| s.to_string());

	for addon in shared.pipeline.addons() {
		guard("request_headers", addon.request_headers(&mut flow)).await;
		if flow.response.is_some() {
			return short_circuit_reply(&shared, &mut flow, client_h2).await;
		}
	}

	let mut outgoing: Body;
	if !flow.stream {
		match hx::ingest_body(hx::incoming(body), shared.stream_large_bodies).await {
			Ok(IngestedBody::Buffered(data)) => {
				flow.request.body = Some(data);
				for addon in shared.pipeline.addons() {
					guard("request", addon.request(&mut flow)).await;
					if flow.response.is_some() {
						return short_circuit_reply(&shared, &mut flow, client_h2).await;
					}
				}
				outgoing = hx::full(flow.request.body.clone().unwrap_or_default());
			},
			Ok(IngestedBody::Streamed(replay)) => {
				warn!(
					limit = shared.stream_large_bodies,
					"request body over threshold, streaming"
				);
				flow.stream = true;
				outgoing = replay;
			},
			Err(e) => {
				info!(error = %e, "reading request body");
				flow.finish();
				return status_response(StatusCode::BAD_GATEWAY);
			},
		}
	} else {
		outgoing = hx::incoming(body);
	}

	for addon in shared.pipeline.addons() {
		let taken = std::mem::replace(&mut outgoing, hx::empty());
		if let Some(wrapped) =
			guard_sync("stream_request_modifier", || addon.stream_request_modifier(&flow, taken))
		{
			outgoing = wrapped;
		}
	}

	let mut headers = flow.request.headers.clone();
	client::strip_hop_headers(&mut headers);
	if !flow.stream {
		// The buffered body may have been rewritten; hyper recomputes the
		// exact length from it.
		headers.remove(http::header::CONTENT_LENGTH);
	}
	let mut upstream_req = match http::Request::builder()
		.method(flow.request.method.clone())
		.uri(flow.request.url.clone())
		.body(outgoing)
	{
		Ok(r) => r,
		Err(e) => {
			info!(error = %e, "building upstream request");
			flow.finish();
			return status_response(StatusCode::BAD_GATEWAY);
		},
	};
	*upstream_req.headers_mut() = headers;

	// A rewritten target means the per-connection socket points at the wrong
	// place; such flows go through the separate client.
	let rewritten = raw_authority != flow.request.url.authority().map(|a| a.to_string())
		|| raw_scheme != flow.request.url.scheme_str().map(|s| s.to_string());
	let use_separate = flow.use_separate_client || rewritten;

	let sent = if use_separate {
		shared.separate.send(upstream_req).await
	} else {
		send_on_conn(&ctx, upstream_req).await
	};
	let upstream_resp = match sent {
		Ok(resp) => resp,
		Err(e) => {
			if e.is_benign_disconnect() {
				debug!(url = %flow.request.url, error = %e, "upstream exchange failed");
			} else {
				info!(url = %flow.request.url, error = %e, "upstream exchange failed");
			}
			flow.finish();
			return status_response(StatusCode::BAD_GATEWAY);
		},
	};

	let (rparts, rbody) = upstream_resp.into_parts();
	let close = wants_close(&rparts.headers);
	if close {
		ctx.set_close_after_response();
	}
	let mut response = flow::Response::new(rparts.status);
	response.headers = rparts.headers;
	response.close = close;
	flow.response = Some(response);

	for addon in shared.pipeline.addons() {
		guard("response_headers", addon.response_headers(&mut flow)).await;
		let supplied = flow
			.response
			.as_ref()
			.is_some_and(|r| r.body.is_some() || r.body_stream.is_some());
		if supplied {
			// The addon replaced the body outright; the origin's is dropped.
			return finish_reply(&shared, &mut flow, None, client_h2);
		}
	}

	let mut downstream: Option<Body> = None;
	if !flow.stream {
		match hx::ingest_body(hx::incoming(rbody), shared.stream_large_bodies).await {
			Ok(IngestedBody::Buffered(data)) => {
				if let Some(r) = flow.response.as_mut() {
					r.body = Some(data);
				}
				for addon in shared.pipeline.addons() {
					guard("response", addon.response(&mut flow)).await;
				}
			},
			Ok(IngestedBody::Streamed(replay)) => {
				warn!(
					limit = shared.stream_large_bodies,
					"response body over threshold, streaming"
				);
				flow.stream = true;
				downstream = Some(replay);
			},
			Err(e) => {
				info!(error = %e, "reading response body");
				flow.finish();
				return status_response(StatusCode::BAD_GATEWAY);
			},
		}
	} else {
		downstream = Some(hx::incoming(rbody));
	}

	finish_reply(&shared, &mut flow, downstream, client_h2)
}

async fn send_on_conn(
	ctx: &Arc<ConnContext>,
	req: http::Request<Body>,
) -> Result<http::Response<Incoming>, ProxyError> {
	let server = ctx.open_server().await?;
	let client = server
		.client()
		.ok_or_else(|| ProxyError::Internal("server connection has no http client".to_string()))?;
	let shaped = client::prepare_for_send(req, client.is_h2(), server.absolute_form)?;
	client.send(shaped).await
}

/// A response installed before the upstream send: no origin connection is
/// made, but the response-phase hooks still run so the synthetic response is
/// visible to every addon.
async fn short_circuit_reply(
	shared: &Arc<Shared>,
	flow: &mut Flow,
	client_h2: bool,
) -> hx::Response {
	for addon in shared.pipeline.addons() {
		guard("response_headers", addon.response_headers(flow)).await;
	}
	for addon in shared.pipeline.addons() {
		guard("response", addon.response(flow)).await;
	}
	finish_reply(shared, flow, None, client_h2)
}

/// Writes the flow's response back: streamed upstream body if one is in
/// flight, else whatever the addons left on the flow.
fn finish_reply(
	shared: &Shared,
	flow: &mut Flow,
	upstream_body: Option<Body>,
	client_h2: bool,
) -> hx::Response {
	let resp = build_reply(shared, flow, upstream_body, client_h2);
	flow.finish();
	resp
}

fn build_reply(
	shared: &Shared,
	flow: &mut Flow,
	upstream_body: Option<Body>,
	client_h2: bool,
) -> hx::Response {
	let close_conn = flow.conn.close_after_response();
	if flow.response.is_none() {
		return status_response(StatusCode::BAD_GATEWAY);
	}
	let mut streamed = upstream_body
		.or_else(|| flow.response.as_mut().and_then(|r| r.body_stream.take()));
	if let Some(body) = streamed.take() {
		let mut body = body;
		for addon in shared.pipeline.addons() {
			let taken = std::mem::replace(&mut body, hx::empty());
			if let Some(wrapped) =
				guard_sync("stream_response_modifier", || addon.stream_response_modifier(flow, taken))
			{
				body = wrapped;
			}
		}
		streamed = Some(body);
	}

	let response = flow.response.as_ref().expect("checked above");
	let mut headers = response.headers.clone();
	let body = match (streamed, response.body.clone()) {
		(Some(stream), _) => stream,
		(None, Some(bytes)) => {
			headers.remove(http::header::TRANSFER_ENCODING);
			headers.insert(
				http::header::CONTENT_LENGTH,
				http::HeaderValue::from(bytes.len()),
			);
			hx::full(bytes)
		},
		(None, None) => {
			headers.remove(http::header::CONTENT_LENGTH);
			hx::empty()
		},
	};

	if client_h2 {
		// Connection management is the frame layer's job in h2; h1
		// connection-specific headers must not leak into it.
		headers.remove(http::header::CONNECTION);
		headers.remove(http::header::TRANSFER_ENCODING);
		headers.remove(http::header::UPGRADE);
		headers.remove("keep-alive");
	} else if response.close || close_conn {
		headers.insert(
			http::header::CONNECTION,
			http::HeaderValue::from_static("close"),
		);
	}

	let mut reply = http::Response::builder()
		.status(response.status)
		.body(body)
		.expect("status and body are valid");
	*reply.headers_mut() = headers;
	reply
}

/// Decrypted websocket upgrade: forward it on the per-connection origin
/// socket, and once both sides have switched protocols, splice bytes.
async fn serve_wss(
	_shared: Arc<Shared>,
	ctx: Arc<ConnContext>,
	mut req: http::Request<Incoming>,
) -> hx::Response {
	let server = match ctx.open_server().await {
		Ok(server) => server,
		Err(e) => {
			info!(error = %e, "websocket upstream dial failed");
			return status_response(StatusCode::BAD_GATEWAY);
		},
	};
	let Some(client) = server.client() else {
		return status_response(StatusCode::BAD_GATEWAY);
	};
	if client.is_h2() {
		debug!("websocket upgrade over h2 upstream is unsupported");
		return status_response(StatusCode::BAD_GATEWAY);
	}

	let client_upgrade = hyper::upgrade::on(&mut req);
	let (parts, body) = req.into_parts();
	let path = parts
		.uri
		.path_and_query()
		.map(|pq| pq.as_str())
		.unwrap_or("/")
		.to_string();
	let mut upstream_req = match http::Request::builder()
		.method(parts.method)
		.uri(path)
		.body(hx::incoming(body))
	{
		Ok(r) => r,
		Err(e) => {
			info!(error = %e, "building websocket upgrade");
			return status_response(StatusCode::BAD_GATEWAY);
		},
	};
	// The upgrade headers (Connection, Upgrade, Sec-WebSocket-*) travel
	// verbatim; this hop must not strip them.
	*upstream_req.headers_mut() = parts.headers;

	let mut upstream_resp = match client.send(upstream_req).await {
		Ok(resp) => resp,
		Err(e) => {
			info!(error = %e, "websocket upgrade failed upstream");
			return status_response(StatusCode::BAD_GATEWAY);
		},
	};

	if upstream_resp.status() == StatusCode::SWITCHING_PROTOCOLS {
		let upstream_upgrade = hyper::upgrade::on(&mut upstream_resp);
		tokio::spawn(async move {
			match tokio::try_join!(client_upgrade, upstream_upgrade) {
				Ok((client_io, upstream_io)) => {
					let mut client_io = TokioIo::new(client_io);
					let mut upstream_io = TokioIo::new(upstream_io);
					if let Err(e) =
						tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await
					{
						debug!(error = %e, "websocket tunnel closed");
					}
				},
				Err(e) => debug!(error = %e, "websocket upgrade join failed"),
			}
		});
	}

	let (rparts, rbody) = upstream_resp.into_parts();
	http::Response::from_parts(rparts, hx::incoming(rbody))
}

fn wants_close(headers: &http::HeaderMap) -> bool {
	headers
		.get_all(http::header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.any(|v| v.to_ascii_lowercase().contains("close"))
}

fn absolute_url(
	parts: &http::request::Parts,
	tls: bool,
	fallback_authority: &str,
) -> Option<Uri> {
	if parts.uri.scheme().is_some() && parts.uri.authority().is_some() {
		return Some(parts.uri.clone());
	}
	let scheme = if tls { "https" } else { "http" };
	let authority = parts
		.uri
		.authority()
		.map(|a| a.to_string())
		.or_else(|| {
			parts
				.headers
				.get(http::header::HOST)
				.and_then(|v| v.to_str().ok())
				.map(|s| s.to_string())
		})
		.unwrap_or_else(|| fallback_authority.to_string());
	if authority.is_empty() {
		return None;
	}
	let path = parts
		.uri
		.path_and_query()
		.map(|pq| pq.as_str())
		.unwrap_or("/");
	Uri::builder()
		.scheme(scheme)
		.authority(authority)
		.path_and_query(path)
		.build()
		.ok()
}
