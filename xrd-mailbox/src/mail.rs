//! Mail records: the plaintexts recovered by the last server of a cascade.
//!
//! A record is the 32-byte recipient NaCl-box public key followed by a
//! sealed message body. The body carries a fresh sender key and nonce, so
//! only the recipient can open it and opening under a wrong key fails.

use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::{Aead, AeadCore};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand::rngs::OsRng;

pub const USER_KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum MailError {
    #[error("mail record is truncated")]
    Truncated,
    #[error("mail body failed to open")]
    OpenFailed,
}

/// A delivered message addressed to one user key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub user_key: [u8; USER_KEY_SIZE],
    pub message: Vec<u8>,
}

impl Mail {
    /// Flatten into the wire form `user_key || body`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(USER_KEY_SIZE + self.message.len());
        out.extend_from_slice(&self.user_key);
        out.extend_from_slice(&self.message);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MailError> {
        if bytes.len() < USER_KEY_SIZE {
            return Err(MailError::Truncated);
        }
        let mut user_key = [0u8; USER_KEY_SIZE];
        user_key.copy_from_slice(&bytes[..USER_KEY_SIZE]);
        Ok(Self {
            user_key,
            message: bytes[USER_KEY_SIZE..].to_vec(),
        })
    }
}

/// Seal `msg` to `recipient`. The body is
/// `sender_pk (32) || nonce (24) || box(msg)` under a fresh sender key.
pub fn seal_mail(recipient: &PublicKey, msg: &[u8]) -> Mail {
    let sender = SecretKey::generate(&mut OsRng);
    let nonce = SalsaBox::generate_nonce(&mut OsRng);
    let sealed = SalsaBox::new(recipient, &sender)
        .encrypt(&nonce, msg)
        .expect("salsa-box encryption is infallible");

    let mut message = Vec::with_capacity(USER_KEY_SIZE + NONCE_SIZE + sealed.len());
    message.extend_from_slice(sender.public_key().as_bytes());
    message.extend_from_slice(&nonce);
    message.extend_from_slice(&sealed);

    Mail {
        user_key: *recipient.as_bytes(),
        message,
    }
}

/// Open a mail body with the recipient's secret key.
pub fn open_mail(secret: &SecretKey, body: &[u8]) -> Result<Vec<u8>, MailError> {
    if body.len() < USER_KEY_SIZE + NONCE_SIZE {
        return Err(MailError::Truncated);
    }
    let mut sender_pk = [0u8; USER_KEY_SIZE];
    sender_pk.copy_from_slice(&body[..USER_KEY_SIZE]);
    let sender = PublicKey::from(sender_pk);
    let nonce = GenericArray::clone_from_slice(&body[USER_KEY_SIZE..USER_KEY_SIZE + NONCE_SIZE]);

    SalsaBox::new(&sender, secret)
        .decrypt(&nonce, &body[USER_KEY_SIZE + NONCE_SIZE..])
        .map_err(|_| MailError::OpenFailed)
}
