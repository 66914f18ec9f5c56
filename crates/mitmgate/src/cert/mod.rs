use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use parking_lot::Mutex;
use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
	Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};
use tokio::sync::OnceCell;
use tracing::debug;

const CA_FILE: &str = "mitmproxy-ca.pem";
const CA_CERT_FILE: &str = "mitmproxy-ca-cert.pem";
const CA_CERT_CER_FILE: &str = "mitmproxy-ca-cert.cer";

const CACHE_CAPACITY: usize = 100;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	#[error("key generation failed: {0}")]
	KeyGen(String),
	#[error("certificate parse failed: {0}")]
	Parse(String),
	#[error("certificate store: {0}")]
	Io(String),
}

impl From<rcgen::Error> for Error {
	fn from(e: rcgen::Error) -> Self {
		Error::Parse(e.to_string())
	}
}

/// A minted leaf, ready to hand to rustls. All leaves share the root's key
/// pair; only the certificate differs per hostname.
#[derive(Debug)]
pub struct LeafCert {
	pub chain: Vec<CertificateDer<'static>>,
	key_der: Vec<u8>,
}

impl LeafCert {
	pub fn key(&self) -> PrivateKeyDer<'static> {
		PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
	}
}

type MintCell = Arc<OnceCell<Result<Arc<LeafCert>, Error>>>;

/// The root certificate authority plus the per-hostname leaf cache.
///
/// Loaded from (or persisted to) `<store>/mitmproxy-ca.pem` on first use; the
/// in-memory constructor mints a fresh root per process instead.
pub struct CertAuthority {
	key: KeyPair,
	issuer: Issuer<'static, KeyPair>,
	root_der: CertificateDer<'static>,
	root_pem: String,
	store_path: Option<PathBuf>,

	serial: AtomicU64,
	minted: AtomicU64,
	cache: Mutex<LruCache<String, Arc<LeafCert>>>,
	inflight: Mutex<HashMap<String, MintCell>>,
}

impl std::fmt::Debug for CertAuthority {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CertAuthority")
			.field("store_path", &self.store_path)
			.finish()
	}
}

impl CertAuthority {
	/// Loads the root from `store_path` (defaulting to `~/.mitmproxy`),
	/// generating and persisting a new one if none exists yet.
	pub fn load_or_create(store_path: Option<&Path>) -> Result<Arc<Self>, Error> {
		let store = resolve_store_path(store_path)?;
		let ca_file = store.join(CA_FILE);
		if ca_file.exists() {
			let pem = std::fs::read_to_string(&ca_file)
				.map_err(|e| Error::Io(format!("read {}: {e}", ca_file.display())))?;
			let (key_pem, cert_pem) = split_combined_pem(&pem)?;
			debug!(path = %store.display(), "loaded root ca");
			Self::from_pem(&key_pem, &cert_pem, Some(store))
		} else {
			let ca = Self::generate(Some(store))?;
			ca.persist()?;
			debug!("created root ca");
			Ok(ca)
		}
	}

	/// A fresh root that lives only as long as the process. Used by tests and
	/// by callers that manage trust out of band.
	pub fn new_memory() -> Result<Arc<Self>, Error> {
		Self::generate(None)
	}

	/// Builds a CA from an existing key + certificate, e.g. a root already
	/// trusted by the fleet. `store_path` is only recorded, never written.
	pub fn from_pem(
		key_pem: &str,
		cert_pem: &str,
		store_path: Option<PathBuf>,
	) -> Result<Arc<Self>, Error> {
		let key = parse_private_key(key_pem)?;
		let issuer_key = parse_private_key(key_pem)?;
		let issuer = Issuer::from_ca_cert_pem(cert_pem, issuer_key)
			.map_err(|e| Error::Parse(format!("ca certificate: {e}")))?;
		let root_der = root_der_from_pem(cert_pem)?;
		Ok(Arc::new(Self::assemble(
			key, issuer, root_der, store_path,
		)))
	}

	fn generate(store_path: Option<PathBuf>) -> Result<Arc<Self>, Error> {
		let key = KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, rcgen::RsaKeySize::_2048)
			.map_err(|e| Error::KeyGen(e.to_string()))?;
		let issuer_key = parse_private_key(&key.serialize_pem())?;

		let mut params = CertificateParams::default();
		params.serial_number = Some(SerialNumber::from(timestamp_serial()));
		params.distinguished_name = distinguished_name("mitmproxy");
		params.not_before = OffsetDateTime::now_utc() - Duration::hours(48);
		params.not_after = OffsetDateTime::now_utc() + Duration::days(3 * 365);
		params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
		params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
		params.extended_key_usages = vec![
			ExtendedKeyUsagePurpose::ServerAuth,
			ExtendedKeyUsagePurpose::ClientAuth,
			ExtendedKeyUsagePurpose::EmailProtection,
			ExtendedKeyUsagePurpose::TimeStamping,
			ExtendedKeyUsagePurpose::CodeSigning,
		];

		let cert = params.self_signed(&key)?;
		let root_der = cert.der().clone();
		let issuer = Issuer::from_ca_cert_pem(&cert.pem(), issuer_key)
			.map_err(|e| Error::Parse(format!("ca certificate: {e}")))?;
		Ok(Arc::new(Self::assemble(
			key, issuer, root_der, store_path,
		)))
	}

	fn assemble(
		key: KeyPair,
		issuer: Issuer<'static, KeyPair>,
		root_der: CertificateDer<'static>,
		store_path: Option<PathBuf>,
	) -> Self {
		let root_pem = pem_encode_cert(&root_der);
		CertAuthority {
			key,
			issuer,
			root_der,
			root_pem,
			store_path,
			serial: AtomicU64::new(timestamp_serial()),
			minted: AtomicU64::new(0),
			cache: Mutex::new(LruCache::new(
				NonZeroUsize::new(CACHE_CAPACITY).expect("capacity is non-zero"),
			)),
			inflight: Mutex::new(HashMap::new()),
		}
	}

	pub fn root_cert(&self) -> &CertificateDer<'static> {
		&self.root_der
	}

	pub fn root_cert_pem(&self) -> &str {
		&self.root_pem
	}

	/// How many leaves have actually been minted (cache misses).
	pub fn minted(&self) -> u64 {
		self.minted.load(Ordering::Relaxed)
	}

	/// Returns a leaf valid for `common_name` (a DNS name or IP literal),
	/// minting one on first use. Concurrent callers for the same name wait on
	/// a single mint and all receive the same leaf; a failed mint is returned
	/// to every waiter and not cached.
	pub async fn get_cert(&self, common_name: &str) -> Result<Arc<LeafCert>, Error> {
		if let Some(hit) = self.cache.lock().get(common_name).cloned() {
			debug!(%common_name, "leaf cache hit");
			return Ok(hit);
		}

		let cell = self
			.inflight
			.lock()
			.entry(common_name.to_string())
			.or_insert_with(|| Arc::new(OnceCell::new()))
			.clone();

		let result = cell
			.get_or_init(|| async {
				let minted = self.mint(common_name);
				if let Ok(leaf) = &minted {
					self
						.cache
						.lock()
						.put(common_name.to_string(), leaf.clone());
				}
				minted
			})
			.await
			.clone();

		self.inflight.lock().remove(common_name);
		result
	}

	fn mint(&self, common_name: &str) -> Result<Arc<LeafCert>, Error> {
		debug!(%common_name, "minting leaf");
		self.minted.fetch_add(1, Ordering::Relaxed);

		let mut params = CertificateParams::default();
		params.serial_number = Some(SerialNumber::from(self.next_serial()));
		params.distinguished_name = distinguished_name(common_name);
		params.not_before = OffsetDateTime::now_utc() - Duration::hours(48);
		params.not_after = OffsetDateTime::now_utc() + Duration::days(365);
		params.extended_key_usages = vec![
			ExtendedKeyUsagePurpose::ServerAuth,
			ExtendedKeyUsagePurpose::ClientAuth,
		];
		match common_name.parse::<IpAddr>() {
			Ok(ip) => params.subject_alt_names.push(SanType::IpAddress(ip)),
			Err(_) => params.subject_alt_names.push(SanType::DnsName(
				common_name
					.try_into()
					.map_err(|e| Error::Parse(format!("subject alt name {common_name:?}: {e}")))?,
			)),
		}

		let cert = params.signed_by(&self.key, &self.issuer)?;
		Ok(Arc::new(LeafCert {
			chain: vec![cert.der().clone()],
			key_der: self.key.serialize_der(),
		}))
	}

	/// Serial numbers stay monotonic even when two mints share a timestamp.
	fn next_serial(&self) -> u64 {
		let now = timestamp_serial();
		self
			.serial
			.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
				Some(now.max(prev + 1))
			})
			.unwrap_or(now)
	}

	fn persist(&self) -> Result<(), Error> {
		let Some(store) = &self.store_path else {
			return Ok(());
		};
		let write = |path: PathBuf, contents: &[u8]| {
			std::fs::write(&path, contents)
				.map_err(|e| Error::Io(format!("write {}: {e}", path.display())))
		};
		let combined = format!("{}{}", self.key.serialize_pem(), self.root_pem);
		write(store.join(CA_FILE), combined.as_bytes())?;
		write(store.join(CA_CERT_FILE), self.root_pem.as_bytes())?;
		write(store.join(CA_CERT_CER_FILE), self.root_der.as_ref())?;
		Ok(())
	}
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, common_name);
	dn.push(DnType::OrganizationName, "mitmproxy");
	dn
}

fn timestamp_serial() -> u64 {
	let nanos = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_nanos();
	(nanos / 100_000) as u64
}

fn resolve_store_path(configured: Option<&Path>) -> Result<PathBuf, Error> {
	let path = match configured {
		Some(p) => p.to_path_buf(),
		None => {
			#[allow(deprecated)]
			let home = std::env::home_dir().ok_or_else(|| Error::Io("no home directory".into()))?;
			home.join(".mitmproxy")
		},
	};
	match std::fs::metadata(&path) {
		Ok(meta) if meta.is_dir() => Ok(path),
		Ok(_) => Err(Error::Io(format!(
			"{} exists and is not a directory",
			path.display()
		))),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			std::fs::create_dir_all(&path)
				.map_err(|e| Error::Io(format!("create {}: {e}", path.display())))?;
			#[cfg(unix)]
			{
				use std::os::unix::fs::PermissionsExt;
				std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
					.map_err(|e| Error::Io(format!("chmod {}: {e}", path.display())))?;
			}
			Ok(path)
		},
		Err(e) => Err(Error::Io(format!("stat {}: {e}", path.display()))),
	}
}

/// Splits the combined store file into its key and certificate PEM blocks.
fn split_combined_pem(pem: &str) -> Result<(String, String), Error> {
	let cert_start = pem
		.find("-----BEGIN CERTIFICATE-----")
		.ok_or_else(|| Error::Parse("no CERTIFICATE block in ca file".into()))?;
	let key_pem = pem[..cert_start].trim();
	if !key_pem.contains("PRIVATE KEY") {
		return Err(Error::Parse("no PRIVATE KEY block in ca file".into()));
	}
	Ok((key_pem.to_string(), pem[cert_start..].to_string()))
}

/// Accepts a PKCS#8 key first, falling back to PKCS#1 by rewrapping the DER.
fn parse_private_key(key_pem: &str) -> Result<KeyPair, Error> {
	let mut reader = std::io::Cursor::new(key_pem.as_bytes());
	let item = rustls_pemfile::read_one(&mut reader)
		.map_err(|e| Error::Parse(format!("private key pem: {e}")))?
		.ok_or_else(|| Error::Parse("empty private key pem".into()))?;
	let pkcs8 = match item {
		rustls_pemfile::Item::Pkcs8Key(key) => key.secret_pkcs8_der().to_vec(),
		rustls_pemfile::Item::Pkcs1Key(key) => pkcs1_to_pkcs8(key.secret_pkcs1_der()),
		_ => return Err(Error::Parse("unsupported private key type".into())),
	};
	let der = PrivatePkcs8KeyDer::from(pkcs8);
	KeyPair::try_from(&der).map_err(|e| Error::Parse(format!("private key: {e}")))
}

/// Wraps a PKCS#1 RSAPrivateKey in the PKCS#8 PrivateKeyInfo envelope
/// (version 0 + rsaEncryption AlgorithmIdentifier + OCTET STRING payload).
fn pkcs1_to_pkcs8(pkcs1: &[u8]) -> Vec<u8> {
	const RSA_ALG_ID: &[u8] = &[
		0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01, 0x05, 0x00,
	];
	let octet = der_tlv(0x04, pkcs1);
	let mut body = vec![0x02, 0x01, 0x00];
	body.extend_from_slice(RSA_ALG_ID);
	body.extend_from_slice(&octet);
	der_tlv(0x30, &body)
}

fn der_tlv(tag: u8, value: &[u8]) -> Vec<u8> {
	let mut out = vec![tag];
	let len = value.len();
	if len < 0x80 {
		out.push(len as u8);
	} else {
		let bytes = len.to_be_bytes();
		let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
		out.push(0x80 | (bytes.len() - first) as u8);
		out.extend_from_slice(&bytes[first..]);
	}
	out.extend_from_slice(value);
	out
}

fn root_der_from_pem(cert_pem: &str) -> Result<CertificateDer<'static>, Error> {
	let mut reader = std::io::Cursor::new(cert_pem.as_bytes());
	rustls_pemfile::certs(&mut reader)
		.next()
		.transpose()
		.map_err(|e| Error::Parse(format!("ca certificate pem: {e}")))?
		.ok_or_else(|| Error::Parse("no certificate in pem".into()))
}

fn pem_encode_cert(der: &CertificateDer<'_>) -> String {
	use base64::Engine;
	let encoded = base64::engine::general_purpose::STANDARD.encode(der.as_ref());
	let mut out = String::from("-----BEGIN CERTIFICATE-----\n");
	for chunk in encoded.as_bytes().chunks(64) {
		out.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
		out.push('\n');
	}
	out.push_str("-----END CERTIFICATE-----\n");
	out
}
