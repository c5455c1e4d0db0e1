use ring::aead;

use super::{
    build_header, generate_counter_nonce, generate_rand_nonce, CryptoError, CHUNK_SIZE, KEY_LEN,
    NONCE_LEN, TAG_LEN,
};

/*
Producer side of the formats understood by AeadMediaCrypto. The download path never encrypts, but
uploaders and tests need to build ciphertext in exactly the layout the decryptor expects.
*/

fn sealing_key(key: &[u8]) -> Result<aead::LessSafeKey, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKey);
    }
    Ok(aead::LessSafeKey::new(aead::UnboundKey::new(&aead::AES_256_GCM, key)?))
}

/// Encrypts a small blob in one go. Returns the decryption header (the nonce) and the
/// ciphertext with the tag appended.
pub fn encrypt_whole(plaintext: &[u8], key: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let key = sealing_key(key)?;
    let nonce_bytes = generate_rand_nonce()?;

    let mut data = plaintext.to_vec();
    key.seal_in_place_append_tag(
        aead::Nonce::assume_unique_for_key(nonce_bytes),
        aead::Aad::empty(),
        &mut data,
    )?;

    Ok((nonce_bytes.to_vec(), data))
}

pub struct StreamEncryptor {
    key: aead::LessSafeKey,
    base_nonce: [u8; NONCE_LEN],
    counter: u64,
    chunk_size: usize,
}

impl StreamEncryptor {
    /// Starts a new stream with a random base nonce. The returned header has to travel with the
    /// ciphertext.
    pub fn new(key: &[u8], chunk_size: usize) -> Result<(Self, Vec<u8>), CryptoError> {
        if chunk_size == 0 || chunk_size > u32::MAX as usize {
            return Err(CryptoError::InvalidHeader);
        }

        let base_nonce = generate_rand_nonce()?;
        let header = build_header(&base_nonce, chunk_size);

        Ok((
            Self {
                key: sealing_key(key)?,
                base_nonce,
                counter: 0,
                chunk_size,
            },
            header,
        ))
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn encrypt_chunk(&mut self, chunk: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if chunk.len() > self.chunk_size {
            return Err(CryptoError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Input data too large",
            )));
        }

        let nonce = generate_counter_nonce(&self.base_nonce, self.counter);
        let mut data = Vec::with_capacity(chunk.len() + TAG_LEN);
        data.extend_from_slice(chunk);
        self.key.seal_in_place_append_tag(
            aead::Nonce::assume_unique_for_key(nonce),
            aead::Aad::empty(),
            &mut data,
        )?;

        self.counter += 1;
        Ok(data)
    }
}

/// Encrypts a whole buffer as a chunked stream. An empty plaintext produces no chunks.
pub fn encrypt_stream_bytes(
    plaintext: &[u8],
    key: &[u8],
    chunk_size: usize,
) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let chunk_size = if chunk_size == 0 { CHUNK_SIZE } else { chunk_size };
    let (mut encryptor, header) = StreamEncryptor::new(key, chunk_size)?;

    let chunks = plaintext.len().div_ceil(chunk_size);
    let mut ciphertext = Vec::with_capacity(plaintext.len() + chunks * TAG_LEN);
    for chunk in plaintext.chunks(chunk_size) {
        ciphertext.extend_from_slice(&encryptor.encrypt_chunk(chunk)?);
    }

    Ok((header, ciphertext))
}
