//! Authenticated symmetric seal used inside every onion layer and for the
//! envelope payload.
//!
//! From a 32-byte shared secret and a 24-byte nonce, two 16-byte subkeys
//! are derived with HKDF-SHA-256 (the nonce is the salt). The message is
//! encrypted with AES-128-CTR using the first 16 nonce bytes as the initial
//! counter block, and a 32-byte HMAC-SHA-256 tag over the ciphertext is
//! appended. Opening verifies the tag in constant time before decrypting.

use aes::cipher::{generic_array::GenericArray, KeyIvInit, StreamCipher};
use aes::Aes128;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::point::{Nonce, SHARED_KEY_SIZE};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Bytes added by one seal: the HMAC tag.
pub const SEAL_OVERHEAD: usize = 32;
const SUBKEY_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SealError {
    #[error("message authentication failed")]
    MacMismatch,
    #[error("sealed blob is shorter than its tag")]
    Truncated,
}

fn derive_subkeys(key: &[u8; SHARED_KEY_SIZE], nonce: &Nonce) -> ([u8; SUBKEY_SIZE], [u8; SUBKEY_SIZE]) {
    let hk = Hkdf::<Sha256>::new(Some(nonce.as_bytes()), key);
    let mut okm = [0u8; 2 * SUBKEY_SIZE];
    hk.expand(&[], &mut okm)
        .expect("okm length is valid for hkdf-sha256");
    let mut aes_key = [0u8; SUBKEY_SIZE];
    let mut mac_key = [0u8; SUBKEY_SIZE];
    aes_key.copy_from_slice(&okm[..SUBKEY_SIZE]);
    mac_key.copy_from_slice(&okm[SUBKEY_SIZE..]);
    (aes_key, mac_key)
}

fn keystream(aes_key: &[u8; SUBKEY_SIZE], nonce: &Nonce, data: &mut [u8]) {
    let iv = GenericArray::clone_from_slice(&nonce.as_bytes()[..16]);
    let mut cipher = Aes128Ctr::new(GenericArray::from_slice(aes_key), &iv);
    cipher.apply_keystream(data);
}

/// Seal `msg` under `key` and `nonce`. Output is `ciphertext || tag`.
pub fn seal(msg: &[u8], nonce: &Nonce, key: &[u8; SHARED_KEY_SIZE]) -> Vec<u8> {
    let (aes_key, mac_key) = derive_subkeys(key, nonce);

    let mut out = Vec::with_capacity(msg.len() + SEAL_OVERHEAD);
    out.extend_from_slice(msg);
    keystream(&aes_key, nonce, &mut out);

    let mut mac = HmacSha256::new_from_slice(&mac_key).expect("hmac accepts any key length");
    mac.update(&out);
    out.extend_from_slice(&mac.finalize().into_bytes());
    out
}

/// Open a blob produced by [`seal`].
pub fn open(blob: &[u8], nonce: &Nonce, key: &[u8; SHARED_KEY_SIZE]) -> Result<Vec<u8>, SealError> {
    if blob.len() < SEAL_OVERHEAD {
        return Err(SealError::Truncated);
    }
    let (ciphertext, tag) = blob.split_at(blob.len() - SEAL_OVERHEAD);
    let (aes_key, mac_key) = derive_subkeys(key, nonce);

    let mut mac = HmacSha256::new_from_slice(&mac_key).expect("hmac accepts any key length");
    mac.update(ciphertext);
    mac.verify_slice(tag).map_err(|_| SealError::MacMismatch)?;

    let mut out = ciphertext.to_vec();
    keystream(&aes_key, nonce, &mut out);
    Ok(out)
}
