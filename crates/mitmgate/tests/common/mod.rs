#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use mitmgate::cert::CertAuthority;
use mitmgate::http::{self as hx};
use mitmgate::{Addon, Flow, Options, Proxy};

pub fn init_logging() {
	use tracing_subscriber::EnvFilter;
	let _ = tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

/// Counts accepted sockets so tests can assert "no upstream was opened".
#[derive(Clone, Default)]
pub struct AcceptCounter(pub Arc<Mutex<usize>>);

impl AcceptCounter {
	pub fn count(&self) -> usize {
		*self.0.lock()
	}
}

pub type Responder =
	Arc<dyn Fn(http::Request<Incoming>) -> http::Response<hx::Body> + Send + Sync>;

pub fn ok_responder() -> Responder {
	Arc::new(|_req| {
		http::Response::builder()
			.status(http::StatusCode::OK)
			.body(hx::full("ok"))
			.unwrap()
	})
}

/// A plain HTTP/1.1 origin server on localhost.
pub async fn spawn_origin_http(responder: Responder) -> (SocketAddr, AcceptCounter) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let accepts = AcceptCounter::default();
	let counter = accepts.clone();
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				break;
			};
			*counter.0.lock() += 1;
			let responder = responder.clone();
			tokio::spawn(async move {
				let service = service_fn(move |req| {
					let responder = responder.clone();
					async move { Ok::<_, std::convert::Infallible>(responder(req)) }
				});
				let _ = hyper::server::conn::http1::Builder::new()
					.serve_connection(TokioIo::new(stream), service)
					.await;
			});
		}
	});
	(addr, accepts)
}

/// An HTTP/1.1 origin that buffers request bodies and replies with their
/// length as the response body.
pub async fn spawn_body_sink_origin() -> (SocketAddr, Arc<Mutex<Vec<u8>>>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let seen: Arc<Mutex<Vec<u8>>> = Arc::default();
	let sink = seen.clone();
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				break;
			};
			let sink = sink.clone();
			tokio::spawn(async move {
				let service = service_fn(move |req: http::Request<Incoming>| {
					let sink = sink.clone();
					async move {
						let body = req.into_body().collect().await.unwrap().to_bytes();
						let len = body.len();
						sink.lock().extend_from_slice(&body);
						Ok::<_, std::convert::Infallible>(
							http::Response::builder()
								.status(http::StatusCode::OK)
								.body(hx::full(len.to_string()))
								.unwrap(),
						)
					}
				});
				let _ = hyper::server::conn::http1::Builder::new()
					.serve_connection(TokioIo::new(stream), service)
					.await;
			});
		}
	});
	(addr, seen)
}

/// A TLS origin. `alpn` is what the origin advertises (e.g. `[b"h2",
/// b"http/1.1"]`); requests are served over whichever protocol negotiates.
pub async fn spawn_origin_https(
	alpn: Vec<Vec<u8>>,
	responder: Responder,
) -> (SocketAddr, AcceptCounter) {
	let ca = CertAuthority::new_memory().unwrap();
	let leaf = ca.get_cert("localhost").await.unwrap();
	let mut config = rustls::ServerConfig::builder_with_provider(mitmgate::tls::provider())
		.with_protocol_versions(mitmgate::tls::ALL_TLS_VERSIONS)
		.unwrap()
		.with_no_client_auth()
		.with_single_cert(leaf.chain.clone(), leaf.key())
		.unwrap();
	config.alpn_protocols = alpn;
	let acceptor = TlsAcceptor::from(Arc::new(config));

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let accepts = AcceptCounter::default();
	let counter = accepts.clone();
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				break;
			};
			*counter.0.lock() += 1;
			let acceptor = acceptor.clone();
			let responder = responder.clone();
			tokio::spawn(async move {
				let Ok(tls) = acceptor.accept(stream).await else {
					return;
				};
				let h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2");
				let service = service_fn(move |req| {
					let responder = responder.clone();
					async move { Ok::<_, std::convert::Infallible>(responder(req)) }
				});
				if h2 {
					let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
						.serve_connection(TokioIo::new(tls), service)
						.await;
				} else {
					let _ = hyper::server::conn::http1::Builder::new()
						.serve_connection(TokioIo::new(tls), service)
						.await;
				}
			});
		}
	});
	(addr, accepts)
}

pub fn test_options() -> Options {
	let mut opts = Options::new("127.0.0.1:0");
	opts.ssl_insecure = true;
	opts.new_ca_fn = Some(Arc::new(CertAuthority::new_memory));
	// Pin the upstream decision to "direct" so a proxy configured in the
	// test environment cannot leak in.
	opts.upstream_proxy = Some(Arc::new(|_uri| None));
	opts
}

/// Boots a proxy on an ephemeral port and serves it in the background.
pub async fn start_proxy(configure: impl FnMut(&mut Proxy)) -> (SocketAddr, Arc<CertAuthority>) {
	start_proxy_opts(test_options(), configure).await
}

pub async fn start_proxy_opts(
	opts: Options,
	mut configure: impl FnMut(&mut Proxy),
) -> (SocketAddr, Arc<CertAuthority>) {
	let mut proxy = Proxy::new(opts).unwrap();
	configure(&mut proxy);
	let ca = proxy.ca().clone();
	let bound = proxy.bind().await.unwrap();
	let addr = bound.local_addr().unwrap();
	tokio::spawn(async move {
		let _ = bound.serve().await;
	});
	(addr, ca)
}

/// Records the order of addon events for assertions.
#[derive(Clone, Default)]
pub struct Recorder {
	pub events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
	fn push(&self, event: &str) {
		self.events.lock().push(event.to_string());
	}

	pub fn snapshot(&self) -> Vec<String> {
		self.events.lock().clone()
	}
}

#[async_trait]
impl Addon for Recorder {
	async fn client_connected(&self, _: &mitmgate::ClientConn) {
		self.push("client_connected");
	}
	async fn client_disconnected(&self, _: &mitmgate::ClientConn) {
		self.push("client_disconnected");
	}
	async fn server_connected(&self, _: &mitmgate::ConnContext) {
		self.push("server_connected");
	}
	async fn server_disconnected(&self, _: &mitmgate::ConnContext) {
		self.push("server_disconnected");
	}
	async fn tls_established_server(&self, _: &mitmgate::ConnContext) {
		self.push("tls_established_server");
	}
	async fn request_headers(&self, _: &mut Flow) {
		self.push("request_headers");
	}
	async fn request(&self, _: &mut Flow) {
		self.push("request");
	}
	async fn response_headers(&self, _: &mut Flow) {
		self.push("response_headers");
	}
	async fn response(&self, _: &mut Flow) {
		self.push("response");
	}
}

/// Sends an absolute-form request through the proxy over a raw socket and
/// returns (status line, headers, body).
pub async fn plain_proxy_roundtrip(
	proxy: SocketAddr,
	method: &str,
	url: &str,
	body: &[u8],
) -> (String, String, Vec<u8>) {
	let mut stream = TcpStream::connect(proxy).await.unwrap();
	let host = url
		.trim_start_matches("http://")
		.split('/')
		.next()
		.unwrap();
	let request = format!(
		"{method} {url} HTTP/1.1\r\nHost: {host}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
		body.len()
	);
	stream.write_all(request.as_bytes()).await.unwrap();
	stream.write_all(body).await.unwrap();
	let mut raw = Vec::new();
	stream.read_to_end(&mut raw).await.unwrap();
	split_response(&raw)
}

fn split_response(raw: &[u8]) -> (String, String, Vec<u8>) {
	let header_end = raw
		.windows(4)
		.position(|w| w == b"\r\n\r\n")
		.map(|p| p + 4)
		.unwrap_or(raw.len());
	let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
	let (status_line, headers) = head.split_once("\r\n").unwrap_or((head.as_str(), ""));
	let mut body = raw[header_end..].to_vec();
	// Undo chunked framing if present, crudely but sufficiently for tests.
	if head.to_ascii_lowercase().contains("transfer-encoding: chunked") {
		body = dechunk(&body);
	}
	(status_line.to_string(), headers.to_string(), body)
}

fn dechunk(mut raw: &[u8]) -> Vec<u8> {
	let mut out = Vec::new();
	loop {
		let Some(pos) = raw.windows(2).position(|w| w == b"\r\n") else {
			break;
		};
		let size = usize::from_str_radix(
			std::str::from_utf8(&raw[..pos]).unwrap_or("0").trim(),
			16,
		)
		.unwrap_or(0);
		if size == 0 {
			break;
		}
		let start = pos + 2;
		out.extend_from_slice(&raw[start..start + size]);
		raw = &raw[start + size + 2..];
	}
	out
}

/// Opens a CONNECT tunnel through the proxy and returns the socket once the
/// 200 has been consumed.
pub async fn open_connect_tunnel(proxy: SocketAddr, authority: &str) -> TcpStream {
	let mut stream = TcpStream::connect(proxy).await.unwrap();
	let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
	stream.write_all(request.as_bytes()).await.unwrap();
	let mut buf = vec![0u8; 1024];
	let mut read = 0;
	loop {
		let n = stream.read(&mut buf[read..]).await.unwrap();
		assert!(n > 0, "proxy closed during CONNECT");
		read += n;
		if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
			break;
		}
	}
	let head = String::from_utf8_lossy(&buf[..read]);
	assert!(head.starts_with("HTTP/1.1 200"), "CONNECT refused: {head}");
	stream
}

/// TLS client config that trusts exactly the proxy's root.
pub fn trusting_client_config(ca: &CertAuthority, alpn: Vec<Vec<u8>>) -> rustls::ClientConfig {
	let mut roots = rustls::RootCertStore::empty();
	roots.add(ca.root_cert().clone()).unwrap();
	let mut config = rustls::ClientConfig::builder_with_provider(mitmgate::tls::provider())
		.with_protocol_versions(mitmgate::tls::ALL_TLS_VERSIONS)
		.unwrap()
		.with_root_certificates(roots)
		.with_no_client_auth();
	config.alpn_protocols = alpn;
	config
}

/// CONNECT + TLS against the forged certificate, returning the TLS stream.
pub async fn open_intercepted_tls(
	proxy: SocketAddr,
	ca: &CertAuthority,
	authority: &str,
	sni: &str,
	alpn: Vec<Vec<u8>>,
) -> tokio_rustls::client::TlsStream<TcpStream> {
	let tcp = open_connect_tunnel(proxy, authority).await;
	let config = trusting_client_config(ca, alpn);
	let connector = TlsConnector::from(Arc::new(config));
	let server_name = rustls_pki_types::ServerName::try_from(sni.to_string()).unwrap();
	connector.connect(server_name, tcp).await.unwrap()
}

/// Waits until the recorder has seen `event`, or panics after ~2s.
pub async fn wait_for_event(recorder: &Recorder, event: &str) {
	for _ in 0..200 {
		if recorder.snapshot().iter().any(|e| e == event) {
			return;
		}
		tokio::time::sleep(std::time::Duration::from_millis(10)).await;
	}
	panic!("event {event:?} never fired; saw {:?}", recorder.snapshot());
}
