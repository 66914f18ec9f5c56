use std::net::SocketAddr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::addon::Pipeline;
use crate::client::{ConnDriver, SendClient};
use crate::proxy::ProxyError;
use crate::tls::ClientHelloCapture;

/// The client half of an accepted proxy connection.
#[derive(Debug)]
pub struct ClientConn {
	pub id: Uuid,
	pub peer_addr: SocketAddr,
	tls: AtomicBool,
	negotiated_alpn: OnceLock<Vec<u8>>,
	client_hello: OnceLock<ClientHelloCapture>,
}

impl ClientConn {
	fn new(peer_addr: SocketAddr) -> Self {
		ClientConn {
			id: Uuid::new_v4(),
			peer_addr,
			tls: AtomicBool::new(false),
			negotiated_alpn: OnceLock::new(),
			client_hello: OnceLock::new(),
		}
	}

	pub fn tls(&self) -> bool {
		self.tls.load(Ordering::Relaxed)
	}

	pub(crate) fn set_tls(&self) {
		self.tls.store(true, Ordering::Relaxed);
	}

	pub fn negotiated_alpn(&self) -> Option<&[u8]> {
		self.negotiated_alpn.get().map(|v| v.as_slice())
	}

	pub(crate) fn set_negotiated_alpn(&self, alpn: Vec<u8>) {
		let _ = self.negotiated_alpn.set(alpn);
	}

	pub fn client_hello(&self) -> Option<&ClientHelloCapture> {
		self.client_hello.get()
	}

	pub(crate) fn set_client_hello(&self, capture: ClientHelloCapture) {
		let _ = self.client_hello.set(capture);
	}
}

/// The origin half, bound to exactly one upstream socket and carrying the
/// per-connection HTTP client over it.
#[derive(Debug)]
pub struct ServerConn {
	pub id: Uuid,
	pub address: String,
	pub tls: bool,
	negotiated_alpn: OnceLock<Vec<u8>>,
	/// The HTTP client bound to this socket. Set once the (possibly TLS)
	/// handshake finishes; never set for raw tunnels.
	client: OnceLock<SendClient>,
	/// True when requests must go on the wire in absolute-form (plain HTTP
	/// relayed through an upstream HTTP proxy).
	pub(crate) absolute_form: bool,
}

impl ServerConn {
	pub(crate) fn new(address: String, tls: bool, absolute_form: bool) -> Arc<Self> {
		Arc::new(ServerConn {
			id: Uuid::new_v4(),
			address,
			tls,
			negotiated_alpn: OnceLock::new(),
			client: OnceLock::new(),
			absolute_form,
		})
	}

	pub fn negotiated_alpn(&self) -> Option<&[u8]> {
		self.negotiated_alpn.get().map(|v| v.as_slice())
	}

	pub(crate) fn set_negotiated_alpn(&self, alpn: Vec<u8>) {
		let _ = self.negotiated_alpn.set(alpn);
	}

	pub(crate) fn client(&self) -> Option<&SendClient> {
		self.client.get()
	}

	pub(crate) fn set_client(&self, client: SendClient) {
		let _ = self.client.set(client);
	}
}

/// A dial thunk records the server connection on the context itself and
/// reports success or failure; the gate below makes it one-shot.
pub(crate) type DialFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), ProxyError>> + Send>;

/// One accepted TCP connection and everything hanging off it. Owns both
/// connection halves so close operations route through the aggregate instead
/// of through pointer back-edges between the wrappers.
pub struct ConnContext {
	pub id: Uuid,
	pub client: ClientConn,

	/// Set at most once, by the dial thunk or the eager CONNECT path.
	server: OnceLock<Arc<ServerConn>>,
	/// Single-flight gate for the dial thunk; its outcome (including
	/// failure) is recorded and returned to every later caller.
	dial_gate: OnceCell<Result<(), ProxyError>>,
	dial_fn: Mutex<Option<DialFn>>,
	server_task: Mutex<Option<JoinHandle<()>>>,
	tunnel_task: Mutex<Option<JoinHandle<()>>>,

	intercept: AtomicBool,
	pub upstream_cert: bool,
	close_after_response: AtomicBool,
	flow_count: AtomicU64,

	close_token: CancellationToken,
	client_disconnected: AtomicBool,
	server_disconnected: AtomicBool,

	pub(crate) pipeline: Pipeline,
}

impl std::fmt::Debug for ConnContext {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConnContext")
			.field("id", &self.id)
			.field("client", &self.client)
			.finish()
	}
}

impl ConnContext {
	pub(crate) fn new(peer_addr: SocketAddr, upstream_cert: bool, pipeline: Pipeline) -> Arc<Self> {
		Arc::new(ConnContext {
			id: Uuid::new_v4(),
			client: ClientConn::new(peer_addr),
			server: OnceLock::new(),
			dial_gate: OnceCell::new(),
			dial_fn: Mutex::new(None),
			server_task: Mutex::new(None),
			tunnel_task: Mutex::new(None),
			intercept: AtomicBool::new(false),
			upstream_cert,
			close_after_response: AtomicBool::new(false),
			flow_count: AtomicU64::new(0),
			close_token: CancellationToken::new(),
			client_disconnected: AtomicBool::new(false),
			server_disconnected: AtomicBool::new(false),
			pipeline,
		})
	}

	pub fn intercept(&self) -> bool {
		self.intercept.load(Ordering::Relaxed)
	}

	pub(crate) fn set_intercept(&self, intercept: bool) {
		self.intercept.store(intercept, Ordering::Relaxed);
	}

	pub fn flow_count(&self) -> u64 {
		self.flow_count.load(Ordering::Relaxed)
	}

	pub(crate) fn count_flow(&self) {
		self.flow_count.fetch_add(1, Ordering::Relaxed);
	}

	pub fn close_after_response(&self) -> bool {
		self.close_after_response.load(Ordering::Relaxed)
	}

	/// An origin that said `Connection: close` (or went away) means the
	/// client connection cannot be reused; it closes once the in-flight
	/// response has been written.
	pub(crate) fn set_close_after_response(&self) {
		self.close_after_response.store(true, Ordering::Relaxed);
	}

	pub(crate) fn close_token(&self) -> CancellationToken {
		self.close_token.clone()
	}

	/// Installs the lazy "open the upstream" thunk. Only the first install
	/// before the thunk has run matters; the thunk itself runs at most once.
	pub(crate) fn set_dial_fn(&self, f: DialFn) {
		let mut slot = self.dial_fn.lock();
		if slot.is_none() {
			*slot = Some(f);
		}
	}

	/// Runs the dial thunk on first use; every concurrent and subsequent
	/// caller receives the recorded outcome.
	pub(crate) async fn open_server(&self) -> Result<Arc<ServerConn>, ProxyError> {
		if let Some(server) = self.server.get() {
			return Ok(server.clone());
		}
		let outcome = self
			.dial_gate
			.get_or_init(|| async {
				let f = self.dial_fn.lock().take();
				match f {
					Some(f) => f().await,
					None => Err(ProxyError::Dial("no upstream dial configured".to_string())),
				}
			})
			.await
			.clone();
		outcome?;
		self
			.server
			.get()
			.cloned()
			.ok_or_else(|| ProxyError::Internal("dial thunk recorded no server".to_string()))
	}

	pub fn server(&self) -> Option<Arc<ServerConn>> {
		self.server.get().cloned()
	}

	/// Records the server connection; first write wins.
	pub(crate) fn record_server(&self, server: Arc<ServerConn>) {
		let _ = self.server.set(server);
	}

	/// Drives the upstream hyper connection until it finishes or the client
	/// side goes away, then fires `server_disconnected` exactly once.
	pub(crate) fn spawn_server_driver(self: &Arc<Self>, driver: ConnDriver) {
		let ctx = self.clone();
		let handle = tokio::spawn(async move {
			tokio::select! {
				_ = driver => {},
				_ = ctx.close_token.cancelled() => {},
			}
			ctx.fire_server_disconnected().await;
		});
		*self.server_task.lock() = Some(handle);
	}

	/// A CONNECT turns the hyper-served connection into a tunnel (or a
	/// decrypted serving loop) running in its own task; the accept loop joins
	/// it before tearing the context down.
	pub(crate) fn set_tunnel_task(&self, task: JoinHandle<()>) {
		*self.tunnel_task.lock() = Some(task);
	}

	pub(crate) fn take_tunnel_task(&self) -> Option<JoinHandle<()>> {
		self.tunnel_task.lock().take()
	}

	pub(crate) async fn fire_server_disconnected(&self) {
		if self
			.server_disconnected
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_ok()
		{
			self.pipeline.server_disconnected(self).await;
			// A dead origin keep-alive means the client conn cannot be reused.
			self.set_close_after_response();
		}
	}

	/// Tears the aggregate down: origin socket first, then the client-side
	/// disconnect event, each exactly once.
	pub(crate) async fn shutdown(&self) {
		self.close_token.cancel();
		let task = self.server_task.lock().take();
		if let Some(task) = task {
			let _ = task.await;
		}
		if self.server().is_some() {
			self.fire_server_disconnected().await;
		}
		if self
			.client_disconnected
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_ok()
		{
			self.pipeline.client_disconnected(&self.client).await;
		}
	}
}
