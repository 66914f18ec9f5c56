use std::net::IpAddr;
use std::sync::Arc;

use itertools::Itertools;
use rustls_pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::client::BoxedStream;
use crate::proxy::ProxyError;
use crate::tls::ClientHelloCapture;

/// Drives the TLS handshake with the origin using the captured ClientHello:
/// SNI, ALPN, and cipher suites come from the intercepted client. Returns the
/// stream plus the protocol the origin negotiated.
pub async fn handshake(
	tcp: BoxedStream,
	capture: &ClientHelloCapture,
	fallback_host: &str,
	insecure: bool,
) -> Result<(TlsStream<BoxedStream>, Option<Vec<u8>>), ProxyError> {
	let sni = capture
		.server_name
		.clone()
		.unwrap_or_else(|| fallback_host.to_string());
	let server_name = server_name(&sni)?;

	debug!(
		hostname = %sni,
		alpn = ?capture
			.alpn
			.iter()
			.map(|p| String::from_utf8_lossy(p).into_owned())
			.collect_vec(),
		"connecting tls to origin"
	);

	let config = crate::tls::mirror_client_config(capture, insecure)
		.map_err(|e| ProxyError::TlsHandshake(e.to_string()))?;
	let tls = TlsConnector::from(Arc::new(config))
		.connect(server_name, tcp)
		.await
		.map_err(|e| ProxyError::TlsHandshake(e.to_string()))?;
	let alpn = tls.get_ref().1.alpn_protocol().map(|p| p.to_vec());
	Ok((tls, alpn))
}

pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, ProxyError> {
	match host.parse::<IpAddr>() {
		Ok(ip) => Ok(ServerName::IpAddress(ip.into())),
		Err(_) => ServerName::try_from(host.to_string())
			.map_err(|_| ProxyError::TlsHandshake(format!("invalid server name {host:?}"))),
	}
}
