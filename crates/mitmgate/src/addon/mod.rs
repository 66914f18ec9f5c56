use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{info, warn};

use crate::connection::{ClientConn, ConnContext};
use crate::flow::Flow;
use crate::http::Body;

/// The capability set an addon may implement. Every hook has a no-op default;
/// an addon overrides whichever subset it cares about.
///
/// Flow hooks receive `&mut Flow` and effect changes by mutating
/// `flow.request`, `flow.response`, `flow.stream`, and
/// `flow.use_separate_client`. Setting `flow.response` during the request
/// phase short-circuits the upstream entirely.
///
/// Hooks on different flows may run concurrently; shared addon state is the
/// addon's responsibility.
#[async_trait]
pub trait Addon: Send + Sync {
	/// A client opened a TCP connection to the proxy port. One connection can
	/// carry many flows.
	async fn client_connected(&self, _client: &ClientConn) {}

	/// The client connection closed (either side). Fires exactly once.
	async fn client_disconnected(&self, _client: &ClientConn) {}

	/// The proxy connected to an origin (or upstream hop) for this connection.
	async fn server_connected(&self, _ctx: &ConnContext) {}

	/// The origin-side socket closed.
	async fn server_disconnected(&self, _ctx: &ConnContext) {}

	/// The TLS handshake with the origin completed.
	async fn tls_established_server(&self, _ctx: &ConnContext) {}

	/// Request headers parsed; the body has not been read yet.
	async fn request_headers(&self, _flow: &mut Flow) {}

	/// The full request body is buffered in `flow.request.body`. Skipped for
	/// streaming flows.
	async fn request(&self, _flow: &mut Flow) {}

	/// Response status and headers are available; the body is not.
	async fn response_headers(&self, _flow: &mut Flow) {}

	/// The full response body is buffered. Skipped for streaming flows.
	async fn response(&self, _flow: &mut Flow) {}

	/// Wraps the outgoing request body when the flow streams. Modifiers chain
	/// in insertion order.
	fn stream_request_modifier(&self, _flow: &Flow, body: Body) -> Body {
		body
	}

	/// Wraps the response body on its way back to the client.
	fn stream_response_modifier(&self, _flow: &Flow, body: Body) -> Body {
		body
	}

	/// A request addressed to the proxy itself (origin-form, no host). The
	/// first addon returning a response claims it.
	async fn access_proxy_server(&self, _req: &mut crate::http::Request) -> Option<crate::http::Response> {
		None
	}
}

/// Runs one hook, converting an addon panic into a warning instead of tearing
/// down the connection task.
pub(crate) async fn guard<F, T>(hook: &'static str, fut: F) -> Option<T>
where
	F: Future<Output = T>,
{
	match AssertUnwindSafe(fut).catch_unwind().await {
		Ok(v) => Some(v),
		Err(_) => {
			warn!(hook, "addon panicked; flow continues");
			None
		},
	}
}

pub(crate) fn guard_sync<T>(hook: &'static str, f: impl FnOnce() -> T) -> Option<T> {
	match std::panic::catch_unwind(AssertUnwindSafe(f)) {
		Ok(v) => Some(v),
		Err(_) => {
			warn!(hook, "addon panicked; flow continues");
			None
		},
	}
}

/// The ordered addon chain. Lifecycle events fan out to every addon here;
/// flow hooks are driven by the dispatcher so it can check short-circuits
/// between addons.
#[derive(Default, Clone)]
pub struct Pipeline {
	addons: Vec<Arc<dyn Addon>>,
}

impl Pipeline {
	pub fn new(addons: Vec<Arc<dyn Addon>>) -> Self {
		Pipeline { addons }
	}

	pub fn push(&mut self, addon: Arc<dyn Addon>) {
		self.addons.push(addon);
	}

	pub fn addons(&self) -> &[Arc<dyn Addon>] {
		&self.addons
	}

	pub async fn client_connected(&self, client: &ClientConn) {
		for a in &self.addons {
			guard("client_connected", a.client_connected(client)).await;
		}
	}

	pub async fn client_disconnected(&self, client: &ClientConn) {
		for a in &self.addons {
			guard("client_disconnected", a.client_disconnected(client)).await;
		}
	}

	pub async fn server_connected(&self, ctx: &ConnContext) {
		for a in &self.addons {
			guard("server_connected", a.server_connected(ctx)).await;
		}
	}

	pub async fn server_disconnected(&self, ctx: &ConnContext) {
		for a in &self.addons {
			guard("server_disconnected", a.server_disconnected(ctx)).await;
		}
	}

	pub async fn tls_established_server(&self, ctx: &ConnContext) {
		for a in &self.addons {
			guard("tls_established_server", a.tls_established_server(ctx)).await;
		}
	}

	pub async fn access_proxy_server(
		&self,
		req: &mut crate::http::Request,
	) -> Option<crate::http::Response> {
		for a in &self.addons {
			if let Some(Some(resp)) = guard("access_proxy_server", a.access_proxy_server(req)).await {
				return Some(resp);
			}
		}
		None
	}
}

/// Logs connection lifecycle and one line per finished flow.
#[derive(Default)]
pub struct LogAddon;

#[async_trait]
impl Addon for LogAddon {
	async fn client_connected(&self, client: &ClientConn) {
		info!(peer = %client.peer_addr, "client connect");
	}

	async fn client_disconnected(&self, client: &ClientConn) {
		info!(peer = %client.peer_addr, "client disconnect");
	}

	async fn server_connected(&self, ctx: &ConnContext) {
		if let Some(server) = ctx.server() {
			info!(peer = %ctx.client.peer_addr, server = %server.address, "server connect");
		}
	}

	async fn server_disconnected(&self, ctx: &ConnContext) {
		if let Some(server) = ctx.server() {
			info!(
				peer = %ctx.client.peer_addr,
				server = %server.address,
				flows = ctx.flow_count(),
				"server disconnect"
			);
		}
	}

	async fn response_headers(&self, flow: &mut Flow) {
		let status = flow
			.response
			.as_ref()
			.map(|r| r.status.as_u16())
			.unwrap_or_default();
		info!(
			peer = %flow.conn.client.peer_addr,
			method = %flow.request.method,
			url = %flow.request.url,
			status,
			elapsed_ms = flow.elapsed().as_millis(),
			"flow"
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn panicking_hook_is_contained() {
		let out = guard("test", async {
			panic!("addon bug");
			#[allow(unreachable_code)]
			()
		})
		.await;
		assert!(out.is_none());
		assert_eq!(guard("test", async { 7 }).await, Some(7));
	}

	#[test]
	fn sync_guard_contains_panics() {
		assert!(guard_sync("test", || panic!("boom")).is_none());
		assert_eq!(guard_sync("test", || 3), Some(3));
	}
}
