use std::io;

use bytes::Bytes;
use ring::rand::{SecureRandom, SystemRandom};

pub mod file_decrypt;
pub mod file_encrypt;

pub use file_decrypt::{decrypt_stream_bytes, AeadDecryptionSession, AeadMediaCrypto};
pub use file_encrypt::{encrypt_stream_bytes, encrypt_whole, StreamEncryptor};

/// Default plaintext size of one stream chunk when the decryption header does not carry one.
pub const CHUNK_SIZE: usize = 1024 * 1024;
pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
/// Nonce followed by a little endian u32 plaintext chunk size.
pub const STREAM_HEADER_LEN: usize = NONCE_LEN + 4;

#[derive(Debug)]
pub enum CryptoError {
    Io(io::Error),
    Ring(ring::error::Unspecified),
    InvalidHeader,
    InvalidKey,
    /// A ciphertext chunk shorter than its authentication tag.
    TruncatedChunk(usize),
}

impl From<io::Error> for CryptoError {
    fn from(err: io::Error) -> Self {
        CryptoError::Io(err)
    }
}

impl From<ring::error::Unspecified> for CryptoError {
    fn from(err: ring::error::Unspecified) -> Self {
        CryptoError::Ring(err)
    }
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CryptoError::Io(err) => write!(f, "IO Error: {}", err),
            CryptoError::Ring(err) => write!(f, "Ring Error: {}", err),
            CryptoError::InvalidHeader => write!(f, "Invalid decryption header"),
            CryptoError::InvalidKey => write!(f, "Invalid key length"),
            CryptoError::TruncatedChunk(len) => write!(f, "Chunk of {} bytes is too short", len),
        }
    }
}

/// The cryptographic collaborator of the download manager. Whole blob decryption is used for
/// thumbnails and playlists, stream sessions for file contents.
pub trait MediaCrypto: Send + Sync {
    fn decrypt_whole(&self, ciphertext: &[u8], header: &[u8], key: &[u8]) -> Result<Bytes, CryptoError>;

    fn init_stream_decryption(
        &self,
        header: &[u8],
        key: &[u8],
    ) -> Result<Box<dyn DecryptionSession>, CryptoError>;
}

/// State of one streaming decrypt. Chunks are chained through the session, so they have to be
/// fed in the order they were encrypted and a failed chunk poisons the rest of the stream.
pub trait DecryptionSession: Send {
    /// Size of one ciphertext chunk. Only the last chunk of a stream may be shorter.
    fn chunk_size(&self) -> usize;

    fn decrypt_chunk(&mut self, chunk: &[u8]) -> Result<Bytes, CryptoError>;
}

/// Splits a decryption header into the base nonce and the plaintext chunk size.
pub fn parse_header(header: &[u8]) -> Result<([u8; NONCE_LEN], usize), CryptoError> {
    let nonce: [u8; NONCE_LEN] = header
        .get(0..NONCE_LEN)
        .and_then(|n| n.try_into().ok())
        .ok_or(CryptoError::InvalidHeader)?;

    let chunk_size = match header.len() {
        NONCE_LEN => CHUNK_SIZE,
        STREAM_HEADER_LEN => {
            let mut size = [0u8; 4];
            size.copy_from_slice(&header[NONCE_LEN..]);
            u32::from_le_bytes(size) as usize
        }
        _ => return Err(CryptoError::InvalidHeader),
    };

    if chunk_size == 0 {
        return Err(CryptoError::InvalidHeader);
    }

    Ok((nonce, chunk_size))
}

pub fn build_header(nonce: &[u8; NONCE_LEN], chunk_size: usize) -> Vec<u8> {
    [nonce.as_slice(), &(chunk_size as u32).to_le_bytes()].concat()
}

/*
Every chunk of a stream gets its own nonce: the base nonce with the chunk counter XOR-ed into its
last 8 bytes. A chunk decrypted at the wrong position fails authentication.
*/
pub fn generate_counter_nonce(base: &[u8; NONCE_LEN], counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = *base;
    for (n, c) in nonce[NONCE_LEN - 8..].iter_mut().zip(counter.to_be_bytes()) {
        *n ^= c;
    }
    nonce
}

pub fn generate_rand_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    SystemRandom::new().fill(&mut nonce)?;
    Ok(nonce)
}

pub fn generate_rand_key() -> Result<[u8; KEY_LEN], CryptoError> {
    let mut key = [0u8; KEY_LEN];
    SystemRandom::new().fill(&mut key)?;
    Ok(key)
}

pub(crate) fn opening_key(key: &[u8]) -> Result<ring::aead::LessSafeKey, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKey);
    }
    let unbound = ring::aead::UnboundKey::new(&ring::aead::AES_256_GCM, key)?;
    Ok(ring::aead::LessSafeKey::new(unbound))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_rand_key() {
        let key = generate_rand_key().unwrap();
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn test_generate_counter_nonce() {
        let base = [0u8; NONCE_LEN];
        assert_eq!(generate_counter_nonce(&base, 0), base);

        let nonce = generate_counter_nonce(&base, 1);
        assert_eq!(nonce[11], 1);
        assert_eq!(&nonce[..11], &[0u8; 11]);

        let base = [0xffu8; NONCE_LEN];
        let nonce = generate_counter_nonce(&base, 0x0102);
        assert_eq!(&nonce[..4], &[0xff; 4]);
        assert_eq!(nonce[10], 0xfe);
        assert_eq!(nonce[11], 0xfd);
    }

    #[test]
    fn test_parse_header() {
        let nonce = [7u8; NONCE_LEN];
        assert_eq!(parse_header(&nonce).unwrap(), (nonce, CHUNK_SIZE));

        let header = build_header(&nonce, 4096);
        assert_eq!(parse_header(&header).unwrap(), (nonce, 4096));

        assert!(matches!(parse_header(&[1, 2, 3]), Err(CryptoError::InvalidHeader)));
        assert!(matches!(parse_header(&build_header(&nonce, 0)), Err(CryptoError::InvalidHeader)));
    }
}
