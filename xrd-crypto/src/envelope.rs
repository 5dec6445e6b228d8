//! Aggregate-ElGamal envelope cipher.
//!
//! The innermost plaintext of every onion is an inner ciphertext addressed
//! to a group's aggregate inner key `Z_agg = Σ Z_i`, the sum of one
//! per-round key per server in the cascade. A ciphertext is
//! `R (64) || seal(msg)` with `R = r·G` and the seal keyed by `(r·Z_agg).x`.
//! Decryption requires the aggregate private scalar `Σ z_i`, which servers
//! release only after every shuffle proof of the round has been accepted.

use ark_ec::PrimeGroup;
use ark_std::UniformRand;
use rand::rngs::OsRng;

use crate::onion::OnionError;
use crate::point::{decode_point, encode_point, identity, shared_x, Nonce, Point, Scalar, POINT_SIZE};
use crate::seal;

/// Sum a set of inner public keys into the aggregate encryption key.
pub fn aggregate_key<'a, I>(keys: I) -> Point
where
    I: IntoIterator<Item = &'a Point>,
{
    keys.into_iter().fold(identity(), |acc, k| acc + k)
}

/// Encrypt `msg` to the aggregate key.
pub fn encrypt(agg: &Point, nonce: &Nonce, msg: &[u8]) -> Vec<u8> {
    let r = Scalar::rand(&mut OsRng);
    let header = Point::generator() * r;
    let key = shared_x(agg, &r);

    let mut out = Vec::with_capacity(POINT_SIZE + msg.len() + seal::SEAL_OVERHEAD);
    out.extend_from_slice(&encode_point(&header));
    out.extend_from_slice(&seal::seal(msg, nonce, &key));
    out
}

/// Decrypt an inner ciphertext under the aggregate private scalar.
pub fn decrypt(agg_secret: &Scalar, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, OnionError> {
    if ciphertext.len() < POINT_SIZE + seal::SEAL_OVERHEAD {
        return Err(OnionError::Truncated);
    }
    let header = decode_point(&ciphertext[..POINT_SIZE])?;
    let key = shared_x(&header, agg_secret);
    Ok(seal::open(&ciphertext[POINT_SIZE..], nonce, &key)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::generate_keypair;
    use crate::seal::SealError;

    #[test]
    fn aggregate_round_trip() {
        let parties: Vec<_> = (0..5).map(|_| generate_keypair()).collect();
        let agg_pub = aggregate_key(parties.iter().map(|(_, p)| p));
        let agg_sec: Scalar = parties.iter().map(|(s, _)| *s).sum();

        let nonce = Nonce::envelope(3);
        let ct = encrypt(&agg_pub, &nonce, b"inner payload");
        assert_eq!(decrypt(&agg_sec, &nonce, &ct).unwrap(), b"inner payload");
    }

    #[test]
    fn partial_key_sum_fails() {
        let parties: Vec<_> = (0..3).map(|_| generate_keypair()).collect();
        let agg_pub = aggregate_key(parties.iter().map(|(_, p)| p));
        let partial: Scalar = parties.iter().take(2).map(|(s, _)| *s).sum();

        let nonce = Nonce::envelope(0);
        let ct = encrypt(&agg_pub, &nonce, b"inner payload");
        assert!(matches!(
            decrypt(&partial, &nonce, &ct),
            Err(OnionError::Seal(SealError::MacMismatch))
        ));
    }

    #[test]
    fn corrupted_mac_fails() {
        let (s, p) = generate_keypair();
        let nonce = Nonce::envelope(1);
        let mut ct = encrypt(&p, &nonce, b"inner payload");
        let last = ct.len() - 1;
        ct[last] ^= 1;
        assert!(matches!(
            decrypt(&s, &nonce, &ct),
            Err(OnionError::Seal(SealError::MacMismatch))
        ));
    }
}
