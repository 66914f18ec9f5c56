use std::time::Duration;

use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::proxy::ProxyError;

/// How long the textual CONNECT exchange with an upstream proxy may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Issues `CONNECT dest` over an established connection to an upstream
/// HTTP(S) proxy and waits for its 200. Any other status is surfaced as a
/// dial error carrying the proxy's textual reason.
pub async fn handshake<S>(
	conn: &mut S,
	dest: &str,
	basic_auth: Option<(&str, Option<&str>)>,
) -> Result<(), ProxyError>
where
	S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
	tokio::time::timeout(CONNECT_TIMEOUT, exchange(conn, dest, basic_auth))
		.await
		.map_err(|_| ProxyError::Dial("upstream proxy CONNECT timed out".to_string()))?
}

async fn exchange<S>(
	conn: &mut S,
	dest: &str,
	basic_auth: Option<(&str, Option<&str>)>,
) -> Result<(), ProxyError>
where
	S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
	let mut req = format!("CONNECT {dest} HTTP/1.1\r\nHost: {dest}\r\n");
	if let Some((user, pass)) = basic_auth {
		let credentials = format!("{user}:{}", pass.unwrap_or_default());
		let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
		req.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
	}
	req.push_str("\r\n");

	conn
		.write_all(req.as_bytes())
		.await
		.map_err(|e| ProxyError::Dial(format!("write CONNECT: {e}")))?;

	let mut buf = [0u8; 8192];
	let mut pos = 0;
	loop {
		let n = conn
			.read(&mut buf[pos..])
			.await
			.map_err(|e| ProxyError::Dial(format!("read CONNECT response: {e}")))?;
		if n == 0 {
			return Err(ProxyError::Dial("tunnel unexpected eof".to_string()));
		}
		pos += n;

		let received = &buf[..pos];
		if !received.contains(&b'\n') {
			if pos == buf.len() {
				return Err(ProxyError::Dial("tunnel response headers too long".to_string()));
			}
			continue;
		}
		let status_line = status_line(received);
		let (code, reason) = parse_status_line(status_line)
			.ok_or_else(|| ProxyError::Dial(format!("malformed tunnel status: {status_line:?}")))?;
		if code != 200 {
			return Err(ProxyError::Dial(format!("upstream proxy: {reason}")));
		}
		if received.ends_with(b"\r\n\r\n") {
			return Ok(());
		}
		if pos == buf.len() {
			return Err(ProxyError::Dial("tunnel response headers too long".to_string()));
		}
	}
}

fn status_line(received: &[u8]) -> &str {
	let end = received
		.iter()
		.position(|b| *b == b'\n')
		.unwrap_or(received.len());
	std::str::from_utf8(&received[..end])
		.unwrap_or_default()
		.trim_end()
}

fn parse_status_line(line: &str) -> Option<(u16, &str)> {
	let rest = line.strip_prefix("HTTP/1.1 ").or_else(|| line.strip_prefix("HTTP/1.0 "))?;
	let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
	Some((code.parse().ok()?, reason))
}
