use std::sync::Arc;

use url::Url;

/// Per-request upstream override, consulted before any static or environment
/// configuration. Returning `None` means "go direct".
pub type UpstreamFn = Arc<dyn Fn(&::http::Uri) -> Option<Url> + Send + Sync>;

/// Resolves the effective upstream for a request: a user-supplied dynamic
/// function wins outright, then the static `upstream` option, then the
/// `HTTPS_PROXY`/`NO_PROXY` environment.
#[derive(Clone, Default)]
pub struct UpstreamResolver {
	pub dynamic: Option<UpstreamFn>,
	pub static_url: Option<Url>,
}

impl std::fmt::Debug for UpstreamResolver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("UpstreamResolver")
			.field("dynamic", &self.dynamic.is_some())
			.field("static_url", &self.static_url)
			.finish()
	}
}

impl UpstreamResolver {
	pub fn resolve(&self, uri: &::http::Uri) -> Option<Url> {
		if let Some(f) = &self.dynamic {
			return f(uri);
		}
		if let Some(u) = &self.static_url {
			return Some(u.clone());
		}
		self.resolve_from_env(uri.host().unwrap_or_default())
	}

	fn resolve_from_env(&self, host: &str) -> Option<Url> {
		let raw = ["HTTPS_PROXY", "https_proxy"]
			.iter()
			.find_map(|k| std::env::var(k).ok().filter(|v| !v.is_empty()))?;
		if let Ok(no_proxy) = std::env::var("NO_PROXY").or_else(|_| std::env::var("no_proxy")) {
			let entries: Vec<String> = no_proxy
				.split(',')
				.map(|s| s.trim().to_string())
				.filter(|s| !s.is_empty())
				.collect();
			if match_host(host, &entries) {
				return None;
			}
		}
		Url::parse(&raw).ok()
	}
}

/// Default port for an upstream or origin scheme.
pub fn default_port(scheme: &str) -> u16 {
	match scheme {
		"https" => 443,
		"socks5" => 1080,
		_ => 80,
	}
}

/// Matches `address` (`host` or `host:port`) against a rule list. Rules may
/// carry a port and use `*` or `*.example.com` wildcards; a bare
/// `*.example.com` also matches `example.com` itself.
pub fn match_host(address: &str, hosts: &[String]) -> bool {
	let (hostname, port) = split_host_port(address);
	hosts.iter().any(|rule| {
		let (h, p) = split_host_port(rule);
		match_hostname(hostname, h) && (p.is_empty() || p == port)
	})
}

fn match_hostname(hostname: &str, pattern: &str) -> bool {
	if pattern == "*" {
		return true;
	}
	if let Some(suffix) = pattern.strip_prefix("*.") {
		return hostname == suffix || hostname.ends_with(&pattern[1..]);
	}
	pattern == hostname
}

fn split_host_port(address: &str) -> (&str, &str) {
	match address.rfind(':') {
		Some(idx) => (&address[..idx], &address[idx + 1..]),
		None => (address, ""),
	}
}
