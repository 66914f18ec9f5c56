use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info};
use url::Url;

use crate::addon::{Addon, Pipeline};
use crate::cert::CertAuthority;
use crate::client::SeparateClient;
use crate::upstream::{UpstreamFn, UpstreamResolver, match_host};

pub(crate) mod attacker;
pub(crate) mod entry;

/// Decides whether a CONNECT (or plain request) gets intercepted or tunneled
/// untouched. The default intercepts everything.
pub type ShouldInterceptFn = Arc<dyn Fn(&crate::flow::Request) -> bool + Send + Sync>;

/// Override constructor for the certificate authority, e.g. to inject an
/// already-trusted root.
pub type NewCaFn = Arc<dyn Fn() -> Result<Arc<CertAuthority>, crate::cert::Error> + Send + Sync>;

const DEFAULT_STREAM_LARGE_BODIES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
	#[error("dial failed: {0}")]
	Dial(String),
	#[error("tls handshake failed: {0}")]
	TlsHandshake(String),
	#[error("upstream request failed: {0}")]
	UpstreamSend(String),
	#[error("malformed upstream response: {0}")]
	UpstreamResponse(String),
	#[error("{0}")]
	Internal(String),
}

impl ProxyError {
	/// Teardown noise (peer resets, broken pipes, timeouts) is expected while
	/// connections wind down and logs at debug rather than info.
	pub fn is_benign_disconnect(&self) -> bool {
		let text = self.to_string();
		[
			"connection reset by peer",
			"broken pipe",
			"use of closed connection",
			"unexpected eof",
			"eof",
			"handshake timed out",
			"timed out",
			"connection closed",
			"operation was canceled",
		]
		.iter()
		.any(|s| text.to_ascii_lowercase().contains(s))
	}
}

/// The configuration the interception core consumes. The CLI/config loader
/// assembling this lives outside the crate.
#[derive(Clone, Default)]
pub struct Options {
	/// Listen address, e.g. `127.0.0.1:9080`. Required.
	pub addr: String,
	/// Request/response bodies beyond this many bytes stop being buffered and
	/// stream through the proxy instead. Defaults to 5 MiB.
	pub stream_large_bodies: Option<usize>,
	/// Skip verification of origin certificates.
	pub ssl_insecure: bool,
	/// Directory for the root CA files; defaults to `~/.mitmproxy`.
	pub ca_root_path: Option<PathBuf>,
	/// Static upstream proxy URL (`http`, `https`, or `socks5`).
	pub upstream: Option<Url>,
	/// Mirror the origin handshake before answering the client's (the eager
	/// path, required for h2 interception). Disable when no real origin
	/// exists and addons mock every response.
	pub upstream_cert: Option<bool>,
	/// Custom CA constructor.
	pub new_ca_fn: Option<NewCaFn>,
	/// Intercept predicate; intercept everything when unset.
	pub should_intercept: Option<ShouldInterceptFn>,
	/// Per-request dynamic upstream resolver; overrides `upstream` and the
	/// environment when present.
	pub upstream_proxy: Option<UpstreamFn>,
}

impl Options {
	pub fn new(addr: impl Into<String>) -> Self {
		Options {
			addr: addr.into(),
			..Default::default()
		}
	}
}

/// Everything the per-connection tasks need, resolved once at startup.
pub(crate) struct Shared {
	pub stream_large_bodies: usize,
	pub ssl_insecure: bool,
	pub upstream_cert: bool,
	pub ca: Arc<CertAuthority>,
	pub pipeline: Pipeline,
	pub resolver: UpstreamResolver,
	pub should_intercept: Option<ShouldInterceptFn>,
	pub separate: SeparateClient,
}

impl Shared {
	pub fn should_intercept(&self, req: &crate::flow::Request) -> bool {
		match &self.should_intercept {
			Some(f) => f(req),
			None => true,
		}
	}
}

/// The proxy instance: configure, add addons, then [`Proxy::start`] (or
/// [`Proxy::bind`] + [`BoundProxy::serve`] when the caller needs the port).
pub struct Proxy {
	opts: Options,
	ca: Arc<CertAuthority>,
	addons: Vec<Arc<dyn Addon>>,
	should_intercept: Option<ShouldInterceptFn>,
}

impl Proxy {
	pub fn new(opts: Options) -> Result<Self, crate::cert::Error> {
		let ca = match &opts.new_ca_fn {
			Some(f) => f()?,
			None => CertAuthority::load_or_create(opts.ca_root_path.as_deref())?,
		};
		let should_intercept = opts.should_intercept.clone();
		Ok(Proxy {
			opts,
			ca,
			addons: Vec::new(),
			should_intercept,
		})
	}

	pub fn add_addon(&mut self, addon: Arc<dyn Addon>) {
		self.addons.push(addon);
	}

	pub fn ca(&self) -> &Arc<CertAuthority> {
		&self.ca
	}

	/// Installs the intercept predicate. Calling any of the rule setters
	/// again replaces the previous rule outright (last writer wins); compose
	/// allow and ignore lists into one predicate before installing if both
	/// are needed.
	pub fn set_should_intercept_rule(&mut self, rule: ShouldInterceptFn) {
		self.should_intercept = Some(rule);
	}

	/// Intercept only hosts matching the list (wildcards like
	/// `*.example.com` and optional `:port` suffixes are understood).
	pub fn set_allow_hosts(&mut self, hosts: Vec<String>) {
		self.set_should_intercept_rule(Arc::new(move |req: &crate::flow::Request| {
			match_host(host_with_port(req), &hosts)
		}));
	}

	/// Tunnel hosts matching the list untouched, intercept the rest.
	pub fn set_ignore_hosts(&mut self, hosts: Vec<String>) {
		self.set_should_intercept_rule(Arc::new(move |req: &crate::flow::Request| {
			!match_host(host_with_port(req), &hosts)
		}));
	}

	pub async fn bind(self) -> std::io::Result<BoundProxy> {
		let listener = TcpListener::bind(&self.opts.addr).await?;
		info!(addr = %listener.local_addr()?, "proxy listening");
		let shared = Arc::new(Shared {
			stream_large_bodies: self
				.opts
				.stream_large_bodies
				.unwrap_or(DEFAULT_STREAM_LARGE_BODIES),
			ssl_insecure: self.opts.ssl_insecure,
			upstream_cert: self.opts.upstream_cert.unwrap_or(true),
			ca: self.ca,
			pipeline: Pipeline::new(self.addons),
			resolver: UpstreamResolver {
				dynamic: self.opts.upstream_proxy.clone(),
				static_url: self.opts.upstream.clone(),
			},
			should_intercept: self.should_intercept,
			separate: SeparateClient::new(
				UpstreamResolver {
					dynamic: self.opts.upstream_proxy,
					static_url: self.opts.upstream,
				},
				self.opts.ssl_insecure,
			),
		});
		Ok(BoundProxy { listener, shared })
	}

	/// Binds and serves forever.
	pub async fn start(self) -> std::io::Result<()> {
		self.bind().await?.serve().await
	}
}

pub struct BoundProxy {
	listener: TcpListener,
	shared: Arc<Shared>,
}

impl BoundProxy {
	pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
		self.listener.local_addr()
	}

	pub async fn serve(self) -> std::io::Result<()> {
		loop {
			let (stream, peer) = self.listener.accept().await?;
			debug!(%peer, "accepted");
			let shared = self.shared.clone();
			tokio::spawn(entry::handle_connection(shared, stream, peer));
		}
	}
}

fn host_with_port(req: &crate::flow::Request) -> &str {
	// CONNECT authorities already carry the port; flow URLs may not.
	req
		.url
		.authority()
		.map(|a| a.as_str())
		.unwrap_or_default()
}
