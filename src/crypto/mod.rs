use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};
use aes::Aes128;

use sha1::{Digest, Sha1};

pub const AES_BLOCK_SIZE: usize = 16;

// Retail images encrypt their session key under the all-zero key.
pub const RETAIL_KEY: [u8; 16] = [0u8; 16];

// Single-block AES-128-ECB decrypt of the embedded session key.
pub fn decrypt_session_key(encrypted: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(&RETAIL_KEY));

    let mut block = GenericArray::clone_from_slice(encrypted);
    cipher.decrypt_block(&mut block);

    let mut key = [0u8; 16];
    key.copy_from_slice(&block);
    key
}

// AES-128-CBC decryption with the IV held as explicit state, so one chain
// can span any number of `decrypt_blocks` calls. The payload cipher stream
// of a container is continuous over all of its blocks.
pub struct CbcDecryptor {
    cipher: Aes128,
    iv: [u8; AES_BLOCK_SIZE],
}

impl CbcDecryptor {
    // IV starts at all zero for every extraction.
    pub fn new(key: &[u8; 16]) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(key)),
            iv: [0u8; AES_BLOCK_SIZE],
        }
    }

    // Decrypts every complete 16-byte block of `data` in place. A trailing
    // partial block is left untouched; callers pass those bytes through.
    pub fn decrypt_blocks(&mut self, data: &mut [u8]) {
        for chunk in data.chunks_exact_mut(AES_BLOCK_SIZE) {
            let mut next_iv = [0u8; AES_BLOCK_SIZE];
            next_iv.copy_from_slice(chunk);

            let block = GenericArray::from_mut_slice(chunk);
            self.cipher.decrypt_block(block);

            for (b, v) in chunk.iter_mut().zip(self.iv.iter()) {
                *b ^= v;
            }

            self.iv = next_iv;
        }
    }
}

pub fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);

    let mut out = [0u8; 20];
    out.copy_from_slice(&hasher.finalize());
    out
}
