//! ECIES-style onion codec.
//!
//! A ciphertext carries a single ephemeral point `E = e·G` as its 64-byte
//! header, shared by every layer. Layer `i` (outermost first) consists of
//! `aux_i` bytes, opaque to the codec, followed by a sealed blob under the
//! shared secret `(e·P_i).x`, where `P_i` is the mix public key at cascade
//! position `i`. Peeling a layer strips the aux bytes and one seal, and
//! rewrites the header to `b·E` for the server's blinding exponent `b`; the
//! mix public keys of a verifiable cascade are pre-multiplied by the
//! accumulated blinding of their predecessors, so decryption commutes with
//! re-blinding.

use ark_ec::PrimeGroup;
use ark_std::UniformRand;
use rand::rngs::OsRng;

use crate::nizk::pokdl_prove;
use crate::point::{
    decode_point, encode_point, shared_x, Nonce, Point, PointError, Scalar, POINT_SIZE,
};
use crate::seal::{self, SealError, SEAL_OVERHEAD};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum OnionError {
    #[error("onion record is truncated")]
    Truncated,
    #[error(transparent)]
    Header(#[from] PointError),
    #[error(transparent)]
    Seal(#[from] SealError),
}

/// Result of peeling one layer: the incoming header point (used by shuffle
/// proofs) and the outgoing record `b·E || inner`.
pub struct Peeled {
    pub incoming: Point,
    pub record: Vec<u8>,
}

/// Total ciphertext size for a `msg_len`-byte payload under `layers` seals
/// with `aux` bytes each.
pub fn overhead(layers: usize, aux: usize) -> usize {
    POINT_SIZE + layers * (aux + SEAL_OVERHEAD)
}

/// Encrypt `msg` under the cascade `keys` (traversal order, outermost
/// first). `auxs` and `nonces` must have one entry per key. When
/// `with_proof` is set, a PoKDL over the ephemeral header is returned for
/// client verifiability.
pub fn encrypt(
    msg: &[u8],
    auxs: &[Vec<u8>],
    nonces: &[Nonce],
    keys: &[Point],
    with_proof: bool,
) -> (Vec<u8>, Option<Vec<u8>>) {
    assert_eq!(keys.len(), nonces.len());
    assert_eq!(keys.len(), auxs.len());

    let e = Scalar::rand(&mut OsRng);
    let header = Point::generator() * e;

    let mut body = msg.to_vec();
    for i in (0..keys.len()).rev() {
        let shared = shared_x(&keys[i], &e);
        let sealed = seal::seal(&body, &nonces[i], &shared);
        let mut layer = Vec::with_capacity(auxs[i].len() + sealed.len());
        layer.extend_from_slice(&auxs[i]);
        layer.extend_from_slice(&sealed);
        body = layer;
    }

    let mut ciphertext = Vec::with_capacity(POINT_SIZE + body.len());
    ciphertext.extend_from_slice(&encode_point(&header));
    ciphertext.extend_from_slice(&body);

    let proof = with_proof.then(|| pokdl_prove(&e, &header));
    (ciphertext, proof)
}

/// Peel one layer at cascade position holding `mix_secret`, re-blinding the
/// header by `blind`. `aux_size` bytes after the header are skipped.
pub fn peel(
    record: &[u8],
    mix_secret: &Scalar,
    blind: &Scalar,
    aux_size: usize,
    nonce: &Nonce,
) -> Result<Peeled, OnionError> {
    if record.len() < POINT_SIZE + aux_size + SEAL_OVERHEAD {
        return Err(OnionError::Truncated);
    }
    let incoming = decode_point(&record[..POINT_SIZE])?;
    let shared = shared_x(&incoming, mix_secret);
    let opened = seal::open(&record[POINT_SIZE + aux_size..], nonce, &shared)?;

    let outgoing = incoming * blind;
    let mut out = Vec::with_capacity(POINT_SIZE + opened.len());
    out.extend_from_slice(&encode_point(&outgoing));
    out.extend_from_slice(&opened);
    Ok(Peeled {
        incoming,
        record: out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nizk::pokdl_verify;
    use crate::point::{generate_keypair, keypair_with_base};
    use ark_ff::One;

    fn nonces(k: usize) -> Vec<Nonce> {
        (0..k).map(|i| Nonce::new(0, 0, i as u64)).collect()
    }

    #[test]
    fn full_cascade_peel() {
        let k = 10;
        let keypairs: Vec<_> = (0..k).map(|_| generate_keypair()).collect();
        let keys: Vec<_> = keypairs.iter().map(|(_, p)| *p).collect();
        let auxs = vec![Vec::new(); k];
        let ns = nonces(k);
        let msg = vec![0x5au8; 100];

        let (ct, proof) = encrypt(&msg, &auxs, &ns, &keys, false);
        assert!(proof.is_none());
        assert_eq!(ct.len(), msg.len() + overhead(k, 0));

        let one = Scalar::one();
        let mut record = ct;
        for i in 0..k {
            record = peel(&record, &keypairs[i].0, &one, 0, &ns[i]).unwrap().record;
        }
        assert_eq!(&record[POINT_SIZE..], &msg[..]);
    }

    #[test]
    fn client_proof_verifies() {
        let (_, p) = generate_keypair();
        let (ct, proof) = encrypt(b"msg", &[vec![]], &nonces(1), &[p], true);
        let header = decode_point(&ct[..POINT_SIZE]).unwrap();
        assert!(pokdl_verify(&header, &proof.unwrap()).is_ok());
    }

    #[test]
    fn aux_bytes_surface_in_order() {
        let k = 3;
        let keypairs: Vec<_> = (0..k).map(|_| generate_keypair()).collect();
        let keys: Vec<_> = keypairs.iter().map(|(_, p)| *p).collect();
        let auxs: Vec<Vec<u8>> = (0..k).map(|i| vec![i as u8; 4]).collect();
        let ns = nonces(k);

        let (ct, _) = encrypt(b"payload", &auxs, &ns, &keys, false);
        let one = Scalar::one();
        let mut record = ct;
        for i in 0..k {
            assert_eq!(&record[POINT_SIZE..POINT_SIZE + 4], &[i as u8; 4]);
            record = peel(&record, &keypairs[i].0, &one, 4, &ns[i]).unwrap().record;
        }
        assert_eq!(&record[POINT_SIZE..], b"payload");
    }

    #[test]
    fn blinded_cascade_with_chained_keys() {
        // Chained key generation: P_i and the accumulated blind point both
        // over the predecessor's accumulated base.
        let k = 4;
        let mut base = Point::generator();
        let mut mix = Vec::new();
        let mut blind = Vec::new();
        for _ in 0..k {
            let (m, p) = keypair_with_base(&base);
            let (b, bp) = keypair_with_base(&base);
            mix.push((m, p));
            blind.push(b);
            base = bp;
        }
        let keys: Vec<_> = mix.iter().map(|(_, p)| *p).collect();
        let ns = nonces(k);
        let auxs = vec![Vec::new(); k];
        let msg = vec![9u8; 32];

        let (ct, _) = encrypt(&msg, &auxs, &ns, &keys, false);
        let mut record = ct;
        for i in 0..k {
            record = peel(&record, &mix[i].0, &blind[i], 0, &ns[i]).unwrap().record;
        }
        assert_eq!(&record[POINT_SIZE..], &msg[..]);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let (_, p) = generate_keypair();
        let (wrong, _) = generate_keypair();
        let (ct, _) = encrypt(b"msg", &[vec![]], &nonces(1), &[p], false);
        let one = Scalar::one();
        assert!(matches!(
            peel(&ct, &wrong, &one, 0, &nonces(1)[0]),
            Err(OnionError::Seal(SealError::MacMismatch))
        ));
    }
}
