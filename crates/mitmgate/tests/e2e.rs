mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::BodyExt;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::*;
use mitmgate::http as hx;
use mitmgate::{Addon, Flow};

#[tokio::test]
async fn http_passthrough_with_event_order() -> anyhow::Result<()> {
	init_logging();
	let (origin, _accepts) = spawn_origin_http(ok_responder()).await;
	let recorder = Recorder::default();
	let rec = recorder.clone();
	let (proxy, _ca) = start_proxy(move |p| p.add_addon(Arc::new(rec.clone()))).await;

	let url = format!("http://{origin}/");
	let (status, _headers, body) = plain_proxy_roundtrip(proxy, "GET", &url, b"").await;
	assert!(status.contains("200"), "{status}");
	assert_eq!(body, b"ok");

	wait_for_event(&recorder, "client_disconnected").await;
	let events = recorder.snapshot();
	assert_eq!(
		events,
		vec![
			"client_connected",
			"request_headers",
			"request",
			"server_connected",
			"response_headers",
			"response",
			"server_disconnected",
			"client_disconnected",
		]
	);
	Ok(())
}

#[tokio::test]
async fn https_interception_presents_forged_cert() {
	init_logging();
	let (origin, _accepts) = spawn_origin_https(vec![b"http/1.1".to_vec()], ok_responder()).await;
	let recorder = Recorder::default();
	let rec = recorder.clone();
	let (proxy, ca) = start_proxy(move |p| p.add_addon(Arc::new(rec.clone()))).await;

	let authority = format!("localhost:{}", origin.port());
	let tls = open_intercepted_tls(proxy, &ca, &authority, "localhost", vec![b"http/1.1".to_vec()])
		.await;

	// The presented leaf must name the origin and chain to the proxy root
	// (the connector has already verified the chain; check the SAN).
	let presented = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
	let (_, parsed) = x509_parser::parse_x509_certificate(presented.as_ref()).unwrap();
	let san = parsed
		.subject_alternative_name()
		.unwrap()
		.expect("leaf has SAN extension");
	assert!(
		san
			.value
			.general_names
			.iter()
			.any(|n| format!("{n:?}").contains("localhost")),
		"SAN does not name origin: {:?}",
		san.value.general_names
	);
	let cn = parsed
		.subject()
		.iter_common_name()
		.next()
		.and_then(|cn| cn.as_str().ok())
		.unwrap();
	assert_eq!(cn, "localhost");

	// Drive a request through the decrypted channel.
	let (client, driver) = mitmgate::client::per_conn_client(tls, false).await.unwrap();
	tokio::spawn(driver);
	let req = http::Request::builder()
		.method(http::Method::GET)
		.uri("/")
		.header(http::header::HOST, &authority)
		.body(hx::empty())
		.unwrap();
	let resp = client.send(req).await.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(body, Bytes::from_static(b"ok"));

	wait_for_event(&recorder, "tls_established_server").await;
}

struct ShortCircuit;

#[async_trait]
impl Addon for ShortCircuit {
	async fn request(&self, flow: &mut Flow) {
		flow.response = Some(mitmgate::flow::Response::with_body(
			StatusCode::OK,
			"intercept-request",
		));
	}
}

#[tokio::test]
async fn request_short_circuit_skips_upstream() {
	init_logging();
	// An origin that must never be contacted.
	let (origin, accepts) = spawn_origin_http(ok_responder()).await;
	let recorder = Recorder::default();
	let rec = recorder.clone();
	let (proxy, _ca) = start_proxy(move |p| {
		p.add_addon(Arc::new(ShortCircuit));
		p.add_addon(Arc::new(rec.clone()));
	})
	.await;

	let url = format!("http://{origin}/");
	let (status, _headers, body) = plain_proxy_roundtrip(proxy, "GET", &url, b"").await;
	assert!(status.contains("200"), "{status}");
	assert_eq!(body, b"intercept-request");
	assert_eq!(accepts.count(), 0, "upstream socket must not be opened");

	// Response-phase hooks still ran for the synthetic response.
	wait_for_event(&recorder, "client_disconnected").await;
	let events = recorder.snapshot();
	assert!(events.contains(&"request_headers".to_string()));
	assert!(events.contains(&"response_headers".to_string()));
	assert!(events.contains(&"response".to_string()));
	assert!(!events.contains(&"server_connected".to_string()));
}

#[derive(Default, Clone)]
struct StreamObserver {
	at_response_headers: Arc<Mutex<Option<(bool, bool)>>>,
}

#[async_trait]
impl Addon for StreamObserver {
	async fn response_headers(&self, flow: &mut Flow) {
		*self.at_response_headers.lock() =
			Some((flow.stream, flow.request.body.is_some()));
	}
}

#[tokio::test]
async fn streaming_threshold_switches_without_data_loss() {
	init_logging();
	let (origin, seen) = spawn_body_sink_origin().await;
	let observer = StreamObserver::default();
	let obs = observer.clone();
	let mut opts = test_options();
	opts.stream_large_bodies = Some(1024);
	let (proxy, _ca) = start_proxy_opts(opts, move |p| {
		p.add_addon(Arc::new(obs.clone()));
	})
	.await;

	let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
	let url = format!("http://{origin}/upload");
	let (status, _headers, body) = plain_proxy_roundtrip(proxy, "POST", &url, &payload).await;
	assert!(status.contains("200"), "{status}");
	assert_eq!(body, b"5000");
	assert_eq!(seen.lock().as_slice(), payload.as_slice(), "bytes must arrive intact");

	let (stream_flag, had_buffered_body) = observer
		.at_response_headers
		.lock()
		.take()
		.expect("response_headers observed");
	assert!(stream_flag, "flow must be in streaming mode");
	assert!(!had_buffered_body, "no buffered request body past the threshold");
}

#[tokio::test]
async fn h2_interception_multiplexes_streams() {
	init_logging();
	let hits = Arc::new(AtomicUsize::new(0));
	let origin_hits = hits.clone();
	let responder: Arc<
		dyn Fn(http::Request<hyper::body::Incoming>) -> http::Response<hx::Body> + Send + Sync,
	> = Arc::new(move |req| {
		origin_hits.fetch_add(1, Ordering::SeqCst);
		let path = req.uri().path().to_string();
		http::Response::builder()
			.status(StatusCode::OK)
			.body(hx::full(path))
			.unwrap()
	});
	let (origin, _accepts) =
		spawn_origin_https(vec![b"h2".to_vec(), b"http/1.1".to_vec()], responder).await;
	let (proxy, ca) = start_proxy(|_p| {}).await;

	let authority = format!("localhost:{}", origin.port());
	let tls = open_intercepted_tls(
		proxy,
		&ca,
		&authority,
		"localhost",
		vec![b"h2".to_vec(), b"http/1.1".to_vec()],
	)
	.await;
	assert_eq!(
		tls.get_ref().1.alpn_protocol(),
		Some(b"h2".as_slice()),
		"client-side ALPN must follow the origin's h2"
	);

	let (client, driver) = mitmgate::client::per_conn_client(tls, true).await.unwrap();
	tokio::spawn(driver);
	let client = Arc::new(client);

	let mut tasks = Vec::new();
	for i in 0..10 {
		let client = client.clone();
		let authority = authority.clone();
		tasks.push(tokio::spawn(async move {
			let req = http::Request::builder()
				.method(http::Method::GET)
				.uri(format!("https://{authority}/stream/{i}"))
				.body(hx::empty())
				.unwrap();
			let resp = client.send(req).await.unwrap();
			assert_eq!(resp.status(), StatusCode::OK);
			let body = resp.into_body().collect().await.unwrap().to_bytes();
			assert_eq!(body, Bytes::from(format!("/stream/{i}")));
		}));
	}
	for task in tasks {
		task.await.unwrap();
	}
	assert_eq!(hits.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn direct_request_gets_static_refusal() {
	init_logging();
	let (proxy, _ca) = start_proxy(|_p| {}).await;
	let mut stream = tokio::net::TcpStream::connect(proxy).await.unwrap();
	stream
		.write_all(b"GET / HTTP/1.1\r\nHost: whatever\r\nConnection: close\r\n\r\n")
		.await
		.unwrap();
	let mut raw = Vec::new();
	stream.read_to_end(&mut raw).await.unwrap();
	let text = String::from_utf8_lossy(&raw);
	assert!(text.starts_with("HTTP/1.1 400"), "{text}");
	assert!(text.contains("此为代理服务器"), "{text}");
}

#[tokio::test]
async fn bypassed_connect_tunnels_verbatim() {
	init_logging();
	let (origin, _accepts) = spawn_origin_https(vec![b"http/1.1".to_vec()], ok_responder()).await;
	let recorder = Recorder::default();
	let rec = recorder.clone();
	let (proxy, ca) = start_proxy(move |p| {
		p.add_addon(Arc::new(rec.clone()));
		p.set_ignore_hosts(vec!["localhost".to_string()]);
	})
	.await;

	let authority = format!("localhost:{}", origin.port());
	let tcp = open_connect_tunnel(proxy, &authority).await;

	// The proxy root must NOT be able to vouch for the origin's real cert:
	// the tunnel is a plain splice, so the handshake against the proxy-root
	// trust anchor has to fail.
	let config = trusting_client_config(&ca, vec![]);
	let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
	let name = rustls_pki_types::ServerName::try_from("localhost".to_string()).unwrap();
	assert!(connector.connect(name, tcp).await.is_err());

	// And with the origin's own trust it works end to end, proving bytes
	// pass through untouched. (ssl verification skipped by using a fresh
	// plain TCP tunnel and a no-verify config is avoided; insecure client
	// config mirrors what curl -k would do.)
	let tcp = open_connect_tunnel(proxy, &authority).await;
	let mut config = rustls::ClientConfig::builder_with_provider(mitmgate::tls::provider())
		.with_protocol_versions(mitmgate::tls::ALL_TLS_VERSIONS)
		.unwrap()
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(mitmgate::tls::insecure::NoVerifier))
		.with_no_client_auth();
	config.alpn_protocols = vec![b"http/1.1".to_vec()];
	let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
	let name = rustls_pki_types::ServerName::try_from("localhost".to_string()).unwrap();
	let tls = connector.connect(name, tcp).await.unwrap();

	let (client, driver) = mitmgate::client::per_conn_client(tls, false).await.unwrap();
	tokio::spawn(driver);
	let req = http::Request::builder()
		.uri("/")
		.header(http::header::HOST, &authority)
		.body(hx::empty())
		.unwrap();
	let resp = client.send(req).await.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
}

struct RewriteHost(String);

#[async_trait]
impl Addon for RewriteHost {
	async fn request_headers(&self, flow: &mut Flow) {
		let mut parts = flow.request.url.clone().into_parts();
		parts.authority = Some(self.0.parse().unwrap());
		flow.request.url = http::Uri::from_parts(parts).unwrap();
	}
}

#[tokio::test]
async fn rewritten_host_routes_through_pooled_separate_client() {
	init_logging();
	let (origin_a, accepts_a) = spawn_origin_http(ok_responder()).await;
	let respond_b: Responder = Arc::new(|_req| {
		http::Response::builder()
			.status(StatusCode::OK)
			.body(hx::full("from-b"))
			.unwrap()
	});
	let (origin_b, accepts_b) = spawn_origin_http(respond_b).await;
	let (proxy, _ca) = start_proxy(move |p| {
		p.add_addon(Arc::new(RewriteHost(origin_b.to_string())));
	})
	.await;

	let url = format!("http://{origin_a}/");
	let (status, _headers, body) = plain_proxy_roundtrip(proxy, "GET", &url, b"").await;
	assert!(status.contains("200"), "{status}");
	assert_eq!(body, b"from-b");
	assert_eq!(accepts_a.count(), 0, "rewritten flows must not touch the old origin");

	// A second flow against the same rewritten target must reuse the pooled
	// connection instead of paying a fresh dial.
	tokio::time::sleep(std::time::Duration::from_millis(100)).await;
	let (status, _headers, body) = plain_proxy_roundtrip(proxy, "GET", &url, b"").await;
	assert!(status.contains("200"), "{status}");
	assert_eq!(body, b"from-b");
	assert_eq!(accepts_b.count(), 1, "separate client must pool connections");
}

struct CloseTagger;

#[async_trait]
impl Addon for CloseTagger {
	async fn response_headers(&self, flow: &mut Flow) {
		if let Some(resp) = flow.response.as_mut() {
			resp
				.headers
				.insert("x-intercepted", http::HeaderValue::from_static("1"));
		}
	}
}

#[tokio::test]
async fn addons_can_mutate_response_headers() {
	init_logging();
	let (origin, _accepts) = spawn_origin_http(ok_responder()).await;
	let (proxy, _ca) = start_proxy(|p| p.add_addon(Arc::new(CloseTagger))).await;

	let url = format!("http://{origin}/");
	let (status, headers, _body) = plain_proxy_roundtrip(proxy, "GET", &url, b"").await;
	assert!(status.contains("200"), "{status}");
	assert!(
		headers.to_ascii_lowercase().contains("x-intercepted: 1"),
		"{headers}"
	);
}

#[tokio::test]
async fn wss_upgrade_is_tunneled() {
	init_logging();
	// A TLS origin that accepts the upgrade and echoes one frame of bytes.
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let origin = listener.local_addr().unwrap();
	let ca = mitmgate::cert::CertAuthority::new_memory().unwrap();
	let leaf = ca.get_cert("localhost").await.unwrap();
	let mut config = rustls::ServerConfig::builder_with_provider(mitmgate::tls::provider())
		.with_protocol_versions(mitmgate::tls::ALL_TLS_VERSIONS)
		.unwrap()
		.with_no_client_auth()
		.with_single_cert(leaf.chain.clone(), leaf.key())
		.unwrap();
	config.alpn_protocols = vec![b"http/1.1".to_vec()];
	let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));
	tokio::spawn(async move {
		let (stream, _) = listener.accept().await.unwrap();
		let mut tls = acceptor.accept(stream).await.unwrap();
		let mut buf = vec![0u8; 2048];
		let n = tls.read(&mut buf).await.unwrap();
		let head = String::from_utf8_lossy(&buf[..n]).to_string();
		assert!(
			head.to_ascii_lowercase().contains("upgrade: websocket"),
			"{head}"
		);
		tls
			.write_all(
				b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
			)
			.await
			.unwrap();
		// Echo whatever arrives post-upgrade.
		let n = tls.read(&mut buf).await.unwrap();
		tls.write_all(&buf[..n]).await.unwrap();
		tls.flush().await.unwrap();
	});

	let (proxy, proxy_ca) = start_proxy(|_p| {}).await;
	let authority = format!("localhost:{}", origin.port());
	let mut inner = open_intercepted_tls(
		proxy,
		&proxy_ca,
		&authority,
		"localhost",
		vec![b"http/1.1".to_vec()],
	)
	.await;

	let upgrade = format!(
		"GET /socket HTTP/1.1\r\nHost: {authority}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGVzdA==\r\nSec-WebSocket-Version: 13\r\n\r\n"
	);
	inner.write_all(upgrade.as_bytes()).await.unwrap();
	let mut buf = vec![0u8; 2048];
	let mut read = 0;
	loop {
		let n = inner.read(&mut buf[read..]).await.unwrap();
		assert!(n > 0, "proxy closed during upgrade");
		read += n;
		if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
			break;
		}
	}
	let head = String::from_utf8_lossy(&buf[..read]).to_string();
	assert!(head.starts_with("HTTP/1.1 101"), "{head}");

	inner.write_all(b"frame-of-bytes").await.unwrap();
	inner.flush().await.unwrap();
	let mut echo = vec![0u8; 14];
	inner.read_exact(&mut echo).await.unwrap();
	assert_eq!(&echo, b"frame-of-bytes");
}
