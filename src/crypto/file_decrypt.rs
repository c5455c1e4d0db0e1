use bytes::Bytes;
use ring::aead;

use super::{
    generate_counter_nonce, opening_key, parse_header, CryptoError, DecryptionSession, MediaCrypto,
    NONCE_LEN, TAG_LEN,
};

/// AES-256-GCM implementation of [`MediaCrypto`] built on ring.
#[derive(Debug, Default, Clone, Copy)]
pub struct AeadMediaCrypto;

impl MediaCrypto for AeadMediaCrypto {
    fn decrypt_whole(&self, ciphertext: &[u8], header: &[u8], key: &[u8]) -> Result<Bytes, CryptoError> {
        let (nonce, _) = parse_header(header)?;
        let key = opening_key(key)?;

        let mut data = ciphertext.to_vec();
        let plain_len = open(&key, nonce, &mut data)?;
        data.truncate(plain_len);

        Ok(Bytes::from(data))
    }

    fn init_stream_decryption(
        &self,
        header: &[u8],
        key: &[u8],
    ) -> Result<Box<dyn DecryptionSession>, CryptoError> {
        Ok(Box::new(AeadDecryptionSession::new(header, key)?))
    }
}

pub struct AeadDecryptionSession {
    key: aead::LessSafeKey,
    base_nonce: [u8; NONCE_LEN],
    counter: u64,
    chunk_size: usize,
}

impl AeadDecryptionSession {
    pub fn new(header: &[u8], key: &[u8]) -> Result<Self, CryptoError> {
        let (base_nonce, plain_chunk_size) = parse_header(header)?;

        Ok(Self {
            key: opening_key(key)?,
            base_nonce,
            counter: 0,
            chunk_size: plain_chunk_size + TAG_LEN,
        })
    }
}

impl DecryptionSession for AeadDecryptionSession {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn decrypt_chunk(&mut self, chunk: &[u8]) -> Result<Bytes, CryptoError> {
        if chunk.len() < TAG_LEN || chunk.len() > self.chunk_size {
            return Err(CryptoError::TruncatedChunk(chunk.len()));
        }

        let nonce = generate_counter_nonce(&self.base_nonce, self.counter);
        let mut data = chunk.to_vec();
        let plain_len = open(&self.key, nonce, &mut data)?;
        data.truncate(plain_len);

        self.counter += 1;
        Ok(Bytes::from(data))
    }
}

fn open(key: &aead::LessSafeKey, nonce: [u8; NONCE_LEN], data: &mut [u8]) -> Result<usize, CryptoError> {
    let nonce = aead::Nonce::assume_unique_for_key(nonce);
    let plain = key.open_in_place(nonce, aead::Aad::empty(), data)?;
    Ok(plain.len())
}

/// Decrypts a fully downloaded stream-encrypted buffer by feeding it chunk by chunk through a
/// session. Used for images and live photos which are fetched whole.
pub fn decrypt_stream_bytes(
    crypto: &dyn MediaCrypto,
    ciphertext: &[u8],
    header: &[u8],
    key: &[u8],
) -> Result<Bytes, CryptoError> {
    let mut session = crypto.init_stream_decryption(header, key)?;
    let chunk_size = session.chunk_size();

    let mut plaintext = Vec::with_capacity(ciphertext.len());
    for chunk in ciphertext.chunks(chunk_size) {
        plaintext.extend_from_slice(&session.decrypt_chunk(chunk)?);
    }

    Ok(Bytes::from(plaintext))
}
