use std::sync::Arc;

use once_cell::sync::Lazy;
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, KeyLogFile, RootCertStore, ServerConfig, SupportedProtocolVersion};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

pub mod insecure;

pub static ALL_TLS_VERSIONS: &[&SupportedProtocolVersion] =
	&[&rustls::version::TLS12, &rustls::version::TLS13];

pub fn provider() -> Arc<CryptoProvider> {
	static PROVIDER: Lazy<Arc<CryptoProvider>> =
		Lazy::new(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));
	PROVIDER.clone()
}

/// Process-wide `SSLKEYLOGFILE` writer, initialized exactly once and shared by
/// every client- and server-side handshake. An unset variable is a no-op.
pub fn key_log() -> Arc<KeyLogFile> {
	static KEY_LOG: Lazy<Arc<KeyLogFile>> = Lazy::new(|| Arc::new(KeyLogFile::new()));
	KEY_LOG.clone()
}

static SYSTEM_ROOTS: Lazy<Arc<RootCertStore>> = Lazy::new(|| {
	let mut roots = RootCertStore::empty();
	let result = rustls_native_certs::load_native_certs();
	roots.add_parsable_certificates(result.certs);
	Arc::new(roots)
});

pub fn system_roots() -> Arc<RootCertStore> {
	SYSTEM_ROOTS.clone()
}

/// TLS record magic: handshake content type over a TLS 1.x record version.
pub fn is_tls_record(buf: &[u8]) -> bool {
	buf.len() >= 3 && buf[0] == 0x16 && buf[1] == 0x03 && buf[2] <= 0x03
}

/// What the intercepted client advertised, captured before any certificate is
/// committed. Drives the upstream handshake so the origin sees the same offer.
#[derive(Debug, Clone, Default)]
pub struct ClientHelloCapture {
	pub server_name: Option<String>,
	pub alpn: Vec<Vec<u8>>,
	pub cipher_suites: Vec<rustls::CipherSuite>,
}

impl ClientHelloCapture {
	pub fn from_accepted(hello: &rustls::server::ClientHello<'_>) -> Self {
		ClientHelloCapture {
			server_name: hello.server_name().map(|s| s.to_string()),
			alpn: hello
				.alpn()
				.map(|protos| protos.map(|p| p.to_vec()).collect())
				.unwrap_or_default(),
			cipher_suites: hello.cipher_suites().to_vec(),
		}
	}

	/// The protocol versions implied by the offered suites. The ClientHello
	/// surface does not expose the supported_versions extension, so 1.3 is
	/// offered iff a 1.3 suite was, and likewise for 1.2.
	fn supported_versions(&self) -> Vec<&'static SupportedProtocolVersion> {
		let offers_13 = self.cipher_suites.iter().any(|s| is_tls13_suite(*s));
		let offers_12 = self.cipher_suites.iter().any(|s| !is_tls13_suite(*s));
		let mut versions = Vec::with_capacity(2);
		if offers_12 {
			versions.push(&rustls::version::TLS12);
		}
		if offers_13 {
			versions.push(&rustls::version::TLS13);
		}
		if versions.is_empty() {
			versions.extend_from_slice(ALL_TLS_VERSIONS);
		}
		versions
	}

	/// Cipher suites we can actually drive, in the client's preference order.
	fn mirrored_suites(&self) -> Vec<rustls::SupportedCipherSuite> {
		let base = provider();
		let mirrored: Vec<_> = self
			.cipher_suites
			.iter()
			.filter_map(|offered| {
				base
					.cipher_suites
					.iter()
					.find(|supported| supported.suite() == *offered)
					.copied()
			})
			.collect();
		if mirrored.is_empty() {
			base.cipher_suites.clone()
		} else {
			mirrored
		}
	}
}

fn is_tls13_suite(suite: rustls::CipherSuite) -> bool {
	u16::from(suite) & 0xff00 == 0x1300
}

/// Builds the upstream TLS client config from a captured ClientHello: SNI,
/// ALPN, and cipher suites mirrored verbatim, versions derived from the
/// suites. Supported curves are deliberately not mirrored (forwarding them
/// literally is known to break interop).
pub fn mirror_client_config(
	capture: &ClientHelloCapture,
	insecure: bool,
) -> Result<ClientConfig, rustls::Error> {
	let mirrored = Arc::new(CryptoProvider {
		cipher_suites: capture.mirrored_suites(),
		..provider().as_ref().clone()
	});
	let builder = ClientConfig::builder_with_provider(mirrored)
		.with_protocol_versions(&capture.supported_versions())?;
	let mut config = if insecure {
		builder
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(insecure::NoVerifier))
			.with_no_client_auth()
	} else {
		builder
			.with_root_certificates(system_roots())
			.with_no_client_auth()
	};
	config.alpn_protocols = capture.alpn.clone();
	config.key_log = key_log();
	Ok(config)
}

/// TLS client config for upstream hops that are not mirrored (HTTPS proxies,
/// the separate client): system trust, h2 + http/1.1.
pub fn plain_client_config(insecure: bool) -> ClientConfig {
	let builder = ClientConfig::builder_with_provider(provider())
		.with_protocol_versions(ALL_TLS_VERSIONS)
		.expect("default versions are valid");
	let mut config = if insecure {
		builder
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(insecure::NoVerifier))
			.with_no_client_auth()
	} else {
		builder
			.with_root_certificates(system_roots())
			.with_no_client_auth()
	};
	config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	config.key_log = key_log();
	config
}

/// Server config presenting a forged leaf to the intercepted client.
pub fn forged_server_config(
	chain: Vec<CertificateDer<'static>>,
	key: PrivateKeyDer<'static>,
	alpn: Vec<Vec<u8>>,
) -> Result<ServerConfig, rustls::Error> {
	let mut config = ServerConfig::builder_with_provider(provider())
		.with_protocol_versions(ALL_TLS_VERSIONS)?
		.with_no_client_auth()
		.with_single_cert(chain, key)?;
	config.alpn_protocols = alpn;
	config.key_log = key_log();
	Ok(config)
}
