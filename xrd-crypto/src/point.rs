//! P-256 group element and scalar handling.
//!
//! Points cross the wire as 64 bytes, `X || Y`, each coordinate big-endian
//! and left-padded with zeros. Scalars are 32 bytes big-endian, reduced
//! modulo the group order.

use ark_ec::{AffineRepr, CurveGroup, PrimeGroup};
use ark_ff::{BigInteger, PrimeField};
use ark_std::UniformRand;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

pub type Point = ark_secp256r1::Projective;
pub type Scalar = ark_secp256r1::Fr;

pub const POINT_SIZE: usize = 64;
pub const SCALAR_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const SHARED_KEY_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PointError {
    #[error("encoding is not a point on the curve")]
    NotOnCurve,
    #[error("point encoding is truncated")]
    Truncated,
}

/// Serialize a point as `X || Y`, 32 bytes each, big-endian.
pub fn encode_point(p: &Point) -> [u8; POINT_SIZE] {
    let affine = p.into_affine();
    let mut out = [0u8; POINT_SIZE];
    if !affine.infinity {
        out[..32].copy_from_slice(&affine.x.into_bigint().to_bytes_be());
        out[32..].copy_from_slice(&affine.y.into_bigint().to_bytes_be());
    }
    out
}

/// Deserialize a 64-byte `X || Y` encoding, validating curve membership.
pub fn decode_point(bytes: &[u8]) -> Result<Point, PointError> {
    if bytes.len() < POINT_SIZE {
        return Err(PointError::Truncated);
    }
    let x = ark_secp256r1::Fq::from_be_bytes_mod_order(&bytes[..32]);
    let y = ark_secp256r1::Fq::from_be_bytes_mod_order(&bytes[32..POINT_SIZE]);
    let affine = ark_secp256r1::Affine::new_unchecked(x, y);
    if !affine.is_on_curve() || !affine.is_in_correct_subgroup_assuming_on_curve() {
        return Err(PointError::NotOnCurve);
    }
    Ok(affine.into_group())
}

/// Serialize a scalar as 32 bytes big-endian.
pub fn encode_scalar(s: &Scalar) -> [u8; SCALAR_SIZE] {
    let mut out = [0u8; SCALAR_SIZE];
    out.copy_from_slice(&s.into_bigint().to_bytes_be());
    out
}

/// Deserialize a big-endian scalar, reducing modulo the group order.
pub fn decode_scalar(bytes: &[u8]) -> Scalar {
    Scalar::from_be_bytes_mod_order(bytes)
}

/// The group generator `G`.
pub fn generator() -> Point {
    Point::generator()
}

/// The identity element, the neutral starting value for point sums.
pub fn identity() -> Point {
    use ark_ff::Zero;
    Point::zero()
}

/// Generate a fresh keypair `(x, x·G)`.
pub fn generate_keypair() -> (Scalar, Point) {
    keypair_with_base(&Point::generator())
}

/// Generate a keypair over an arbitrary base point: `(x, x·B)`.
pub fn keypair_with_base(base: &Point) -> (Scalar, Point) {
    let secret = Scalar::rand(&mut OsRng);
    let public = *base * secret;
    (secret, public)
}

/// The x-coordinate of `scalar · point`, left-padded to 32 bytes. This is
/// the raw ECDH value both sides of an onion layer derive.
pub fn shared_x(point: &Point, scalar: &Scalar) -> [u8; SHARED_KEY_SIZE] {
    let affine = (*point * scalar).into_affine();
    let mut out = [0u8; SHARED_KEY_SIZE];
    out.copy_from_slice(&affine.x.into_bigint().to_bytes_be());
    out
}

/// Hash arbitrary transcript bytes to a challenge scalar.
pub(crate) fn challenge_scalar(parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    Scalar::from_be_bytes_mod_order(&hasher.finalize())
}

/// 24-byte nonce carrying `(round, row, index)` as little-endian u64s.
/// Every party derives the same nonce for a given onion layer; the envelope
/// layer uses `Nonce::envelope(round)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    pub fn new(round: u64, row: u64, index: u64) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        bytes[..8].copy_from_slice(&round.to_le_bytes());
        bytes[8..16].copy_from_slice(&row.to_le_bytes());
        bytes[16..].copy_from_slice(&index.to_le_bytes());
        Self(bytes)
    }

    pub fn envelope(round: u64) -> Self {
        Self::new(round, 0, 0)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_round_trip() {
        for _ in 0..16 {
            let (_, p) = generate_keypair();
            let bytes = encode_point(&p);
            assert_eq!(decode_point(&bytes).unwrap(), p);
        }
    }

    #[test]
    fn reject_off_curve_encoding() {
        let (_, p) = generate_keypair();
        let mut bytes = encode_point(&p);
        bytes[63] ^= 1;
        assert_eq!(decode_point(&bytes), Err(PointError::NotOnCurve));
        assert_eq!(decode_point(&bytes[..32]), Err(PointError::Truncated));
    }

    #[test]
    fn scalar_round_trip() {
        let (s, _) = generate_keypair();
        assert_eq!(decode_scalar(&encode_scalar(&s)), s);
    }

    #[test]
    fn shared_secret_agreement() {
        let (a, pa) = generate_keypair();
        let (b, pb) = generate_keypair();
        assert_eq!(shared_x(&pb, &a), shared_x(&pa, &b));
    }

    #[test]
    fn nonce_fields_disjoint() {
        assert_ne!(Nonce::new(1, 0, 0), Nonce::new(0, 1, 0));
        assert_ne!(Nonce::new(0, 1, 0), Nonce::new(0, 0, 1));
        assert_eq!(Nonce::envelope(3), Nonce::new(3, 0, 0));
    }
}
