use async_compression::tokio::bufread::{
	BrotliDecoder, BrotliEncoder, GzipDecoder, GzipEncoder, ZlibDecoder, ZlibEncoder, ZstdDecoder,
	ZstdEncoder,
};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

pub const GZIP: &str = "gzip";
pub const DEFLATE: &str = "deflate";
pub const BR: &str = "br";
pub const ZSTD: &str = "zstd";

#[derive(Debug, Clone, thiserror::Error)]
pub enum EncodingError {
	#[error("content-encoding not supported: {0}")]
	NotSupported(String),
	#[error("decode failed: {0}")]
	Decode(String),
}

/// Decodes a whole buffered body by Content-Encoding token.
pub async fn decode(encoding: &str, body: &[u8]) -> Result<Bytes, EncodingError> {
	let reader = BufReader::new(body);
	let decoder: Box<dyn AsyncRead + Unpin + Send> = match encoding {
		GZIP => Box::new(GzipDecoder::new(reader)),
		DEFLATE => Box::new(ZlibDecoder::new(reader)),
		BR => Box::new(BrotliDecoder::new(reader)),
		ZSTD => Box::new(ZstdDecoder::new(reader)),
		other => return Err(EncodingError::NotSupported(other.to_string())),
	};
	read_to_bytes(decoder)
		.await
		.map_err(|e| EncodingError::Decode(e.to_string()))
}

/// Compresses a body; the inverse of [`decode`], used by addons that rewrite
/// bodies and by tests.
pub async fn encode(encoding: &str, body: &[u8]) -> Result<Bytes, EncodingError> {
	let reader = BufReader::new(body);
	let encoder: Box<dyn AsyncRead + Unpin + Send> = match encoding {
		GZIP => Box::new(GzipEncoder::new(reader)),
		DEFLATE => Box::new(ZlibEncoder::new(reader)),
		BR => Box::new(BrotliEncoder::new(reader)),
		ZSTD => Box::new(ZstdEncoder::new(reader)),
		other => return Err(EncodingError::NotSupported(other.to_string())),
	};
	read_to_bytes(encoder)
		.await
		.map_err(|e| EncodingError::Decode(e.to_string()))
}

async fn read_to_bytes<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<Bytes> {
	let mut buffer = bytes::BytesMut::with_capacity(8192);
	loop {
		let n = reader.read_buf(&mut buffer).await?;
		if n == 0 {
			return Ok(buffer.freeze());
		}
	}
}
