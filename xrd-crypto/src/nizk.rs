//! Non-interactive zero-knowledge proofs over P-256.
//!
//! Two sigma protocols made non-interactive with SHA-256 Fiat-Shamir
//! challenges:
//!
//! - PoKDL: Schnorr proof of knowledge of a discrete log. 96 bytes,
//!   `R (64) || s (32)` with `c = H(X || R)` and `s = r − c·x mod n`.
//! - LogEq: Chaum-Pedersen proof that two points share one discrete log
//!   over two bases. 160 bytes, `R1 || R2 || s` with
//!   `c = H(B1 || X1 || B2 || X2 || R1 || R2 [|| binding])`.
//!
//! The optional `binding` argument folds caller-chosen bytes into the
//! challenge; the mix engine uses it to bind a shuffle proof to the exact
//! byte order of its outgoing header list.

use ark_ec::PrimeGroup;
use ark_std::UniformRand;
use rand::rngs::OsRng;

use crate::point::{
    challenge_scalar, decode_point, decode_scalar, encode_point, encode_scalar, Point, Scalar,
    POINT_SIZE, SCALAR_SIZE,
};

pub const POKDL_SIZE: usize = POINT_SIZE + SCALAR_SIZE;
pub const LOGEQ_SIZE: usize = 2 * POINT_SIZE + SCALAR_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum NizkError {
    #[error("proof has the wrong length")]
    Malformed,
    #[error("proof does not verify")]
    NotValid,
}

/// Prove knowledge of `x` such that `public = x·G`.
pub fn pokdl_prove(x: &Scalar, public: &Point) -> Vec<u8> {
    let r = Scalar::rand(&mut OsRng);
    let commitment = Point::generator() * r;
    let commitment_bytes = encode_point(&commitment);
    let c = challenge_scalar(&[&encode_point(public), &commitment_bytes]);
    let s = r - c * x;

    let mut proof = Vec::with_capacity(POKDL_SIZE);
    proof.extend_from_slice(&commitment_bytes);
    proof.extend_from_slice(&encode_scalar(&s));
    proof
}

/// Verify a PoKDL proof against `public`.
pub fn pokdl_verify(public: &Point, proof: &[u8]) -> Result<(), NizkError> {
    if proof.len() != POKDL_SIZE {
        return Err(NizkError::Malformed);
    }
    let commitment = decode_point(&proof[..POINT_SIZE]).map_err(|_| NizkError::NotValid)?;
    let s = decode_scalar(&proof[POINT_SIZE..]);
    let c = challenge_scalar(&[&encode_point(public), &proof[..POINT_SIZE]]);

    if Point::generator() * s + *public * c == commitment {
        Ok(())
    } else {
        Err(NizkError::NotValid)
    }
}

/// Prove that `x1 = x·b1` and `x2 = x·b2` for one witness `x`.
pub fn logeq_prove(
    x: &Scalar,
    b1: &Point,
    x1: &Point,
    b2: &Point,
    x2: &Point,
    binding: &[u8],
) -> Vec<u8> {
    let r = Scalar::rand(&mut OsRng);
    let r1 = encode_point(&(*b1 * r));
    let r2 = encode_point(&(*b2 * r));
    let c = logeq_challenge(b1, x1, b2, x2, &r1, &r2, binding);
    let s = r - c * x;

    let mut proof = Vec::with_capacity(LOGEQ_SIZE);
    proof.extend_from_slice(&r1);
    proof.extend_from_slice(&r2);
    proof.extend_from_slice(&encode_scalar(&s));
    proof
}

/// Verify a LogEq proof for `(b1, x1, b2, x2)` under the same `binding`
/// bytes the prover used.
pub fn logeq_verify(
    b1: &Point,
    x1: &Point,
    b2: &Point,
    x2: &Point,
    binding: &[u8],
    proof: &[u8],
) -> Result<(), NizkError> {
    if proof.len() != LOGEQ_SIZE {
        return Err(NizkError::Malformed);
    }
    let r1_bytes = &proof[..POINT_SIZE];
    let r2_bytes = &proof[POINT_SIZE..2 * POINT_SIZE];
    let r1 = decode_point(r1_bytes).map_err(|_| NizkError::NotValid)?;
    let r2 = decode_point(r2_bytes).map_err(|_| NizkError::NotValid)?;
    let s = decode_scalar(&proof[2 * POINT_SIZE..]);
    let c = logeq_challenge(b1, x1, b2, x2, r1_bytes, r2_bytes, binding);

    let ok1 = *b1 * s + *x1 * c == r1;
    let ok2 = *b2 * s + *x2 * c == r2;
    if ok1 && ok2 {
        Ok(())
    } else {
        Err(NizkError::NotValid)
    }
}

fn logeq_challenge(
    b1: &Point,
    x1: &Point,
    b2: &Point,
    x2: &Point,
    r1: &[u8],
    r2: &[u8],
    binding: &[u8],
) -> Scalar {
    challenge_scalar(&[
        &encode_point(b1),
        &encode_point(x1),
        &encode_point(b2),
        &encode_point(x2),
        r1,
        r2,
        binding,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::generate_keypair;

    #[test]
    fn pokdl_accepts_valid_proofs() {
        for _ in 0..100 {
            let (x, public) = generate_keypair();
            let proof = pokdl_prove(&x, &public);
            assert!(pokdl_verify(&public, &proof).is_ok());
        }
    }

    #[test]
    fn pokdl_rejects_perturbed_proofs() {
        let (x, public) = generate_keypair();
        let proof = pokdl_prove(&x, &public);
        for i in [0, POINT_SIZE / 2, POINT_SIZE, POKDL_SIZE - 1] {
            let mut bad = proof.clone();
            bad[i] ^= 1;
            assert!(pokdl_verify(&public, &bad).is_err());
        }
        assert_eq!(
            pokdl_verify(&public, &proof[..POKDL_SIZE - 1]),
            Err(NizkError::Malformed)
        );
    }

    #[test]
    fn pokdl_rejects_wrong_statement() {
        let (x, public) = generate_keypair();
        let (_, other) = generate_keypair();
        let proof = pokdl_prove(&x, &public);
        assert!(pokdl_verify(&other, &proof).is_err());
    }

    #[test]
    fn logeq_accepts_valid_proofs() {
        for _ in 0..100 {
            let (_, b1) = generate_keypair();
            let (_, b2) = generate_keypair();
            let (x, _) = generate_keypair();
            let (x1, x2) = (b1 * x, b2 * x);
            let proof = logeq_prove(&x, &b1, &x1, &b2, &x2, &[]);
            assert!(logeq_verify(&b1, &x1, &b2, &x2, &[], &proof).is_ok());
        }
    }

    #[test]
    fn logeq_rejects_perturbed_proofs() {
        let (_, b1) = generate_keypair();
        let (_, b2) = generate_keypair();
        let (x, _) = generate_keypair();
        let (x1, x2) = (b1 * x, b2 * x);
        let proof = logeq_prove(&x, &b1, &x1, &b2, &x2, &[]);
        for i in [0, POINT_SIZE, 2 * POINT_SIZE, LOGEQ_SIZE - 1] {
            let mut bad = proof.clone();
            bad[i] ^= 1;
            assert!(logeq_verify(&b1, &x1, &b2, &x2, &[], &bad).is_err());
        }
    }

    #[test]
    fn logeq_rejects_unequal_logs() {
        let (_, b1) = generate_keypair();
        let (_, b2) = generate_keypair();
        let (x, _) = generate_keypair();
        let (y, _) = generate_keypair();
        let (x1, x2) = (b1 * x, b2 * y);
        let proof = logeq_prove(&x, &b1, &x1, &b2, &x2, &[]);
        assert!(logeq_verify(&b1, &x1, &b2, &x2, &[], &proof).is_err());
    }

    #[test]
    fn logeq_challenge_binds_aux_bytes() {
        let (_, b1) = generate_keypair();
        let (_, b2) = generate_keypair();
        let (x, _) = generate_keypair();
        let (x1, x2) = (b1 * x, b2 * x);
        let proof = logeq_prove(&x, &b1, &x1, &b2, &x2, b"records");
        assert!(logeq_verify(&b1, &x1, &b2, &x2, b"records", &proof).is_ok());
        assert!(logeq_verify(&b1, &x1, &b2, &x2, b"reorder", &proof).is_err());
    }
}
