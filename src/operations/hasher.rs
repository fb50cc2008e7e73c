//! Streaming SHA-256
//!
//! Memory use is bounded by one 1 MiB buffer regardless of file size.
//! Hashes are serialized as lowercase hex.

use crate::shared::Result;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Chunk size shared by the hasher and the copier
pub const BUFFER_SIZE: usize = 1024 * 1024;

/// SHA-256 of the empty input, useful as a test fixture
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Hash an async reader to lowercase hex
pub async fn hash_stream<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
	let mut hasher = Sha256::new();
	let mut buffer = vec![0u8; BUFFER_SIZE];

	loop {
		let bytes_read = reader.read(&mut buffer).await?;
		if bytes_read == 0 {
			break;
		}
		hasher.update(&buffer[..bytes_read]);
	}

	Ok(hex::encode(hasher.finalize()))
}

/// Hash a file on disk
pub async fn hash_file(path: &Path) -> Result<String> {
	let mut file = fs::File::open(path)
		.await
		.map_err(|e| crate::shared::ReplicatorError::from_io(e, path))?;
	hash_stream(&mut file).await
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Cursor;

	#[tokio::test]
	async fn empty_input_hashes_to_known_value() {
		let mut reader = Cursor::new(Vec::<u8>::new());
		let hash = hash_stream(&mut reader).await.unwrap();
		assert_eq!(hash, EMPTY_SHA256);
	}

	#[tokio::test]
	async fn known_vector() {
		// sha256("abc")
		let mut reader = Cursor::new(b"abc".to_vec());
		let hash = hash_stream(&mut reader).await.unwrap();
		assert_eq!(
			hash,
			"ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
		);
	}

	#[tokio::test]
	async fn input_longer_than_buffer_is_chunked() {
		let data = vec![0x5au8; BUFFER_SIZE * 2 + 17];
		let mut reader = Cursor::new(data.clone());
		let chunked = hash_stream(&mut reader).await.unwrap();

		let mut hasher = Sha256::new();
		hasher.update(&data);
		assert_eq!(chunked, hex::encode(hasher.finalize()));
	}

	#[tokio::test]
	async fn hash_is_lowercase_hex() {
		let mut reader = Cursor::new(b"scan".to_vec());
		let hash = hash_stream(&mut reader).await.unwrap();
		assert_eq!(hash.len(), 64);
		assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
	}
}
