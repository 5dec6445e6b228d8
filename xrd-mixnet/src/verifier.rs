//! Envelope verifier: one per logical server identity.
//!
//! Each round the verifier draws a fresh inner ElGamal keypair
//! `(z_i, Z_i = z_i·G)`. Clients encrypt their innermost payload to the
//! group's aggregate key `Σ Z_i`; after the cascade completes and every
//! shuffle proof has been accepted, the group's private scalars are
//! collected, summed and used to decrypt every buffered inner ciphertext in
//! parallel. The release gate itself is owned by the round controller, so
//! this component never reaches into the mix engine.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tracing::debug;
use zeroize::Zeroize;

use xrd_crypto::envelope;
use xrd_crypto::point::{self, Nonce, Point, Scalar, POINT_SIZE, SCALAR_SIZE};

use crate::error::MixError;

struct VerifierRound {
    secret: Scalar,
    public: Point,
    pool: rayon::ThreadPool,
    inner: Mutex<VerifierInner>,
}

#[derive(Default)]
struct VerifierInner {
    ciphertexts: Vec<Vec<u8>>,
    done: bool,
}

impl Drop for VerifierRound {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Holds the per-round inner key material and inner-ciphertext buffer of
/// one cascade member.
pub struct Verifier {
    index: usize,
    group_size: usize,
    states: RwLock<HashMap<u64, Arc<VerifierRound>>>,
}

impl Verifier {
    pub fn new(index: usize, group_size: usize) -> Self {
        Self {
            index,
            group_size,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn new_round(&self, round: u64) -> Result<(), MixError> {
        let mut states = self.states.write();
        if states.contains_key(&round) {
            return Err(MixError::RoundExists(round));
        }
        let (secret, public) = point::generate_keypair();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(2)
                    * 2,
            )
            .build()
            .map_err(|_| MixError::Pool)?;
        states.insert(
            round,
            Arc::new(VerifierRound {
                secret,
                public,
                pool,
                inner: Mutex::new(VerifierInner::default()),
            }),
        );
        Ok(())
    }

    fn state(&self, round: u64) -> Result<Arc<VerifierRound>, MixError> {
        self.states
            .read()
            .get(&round)
            .cloned()
            .ok_or(MixError::RoundNotInitialized(round))
    }

    /// This round's inner public key `Z_i`.
    pub fn public_key(&self, round: u64) -> Result<[u8; POINT_SIZE], MixError> {
        Ok(point::encode_point(&self.state(round)?.public))
    }

    /// This round's inner private scalar `z_i`. The caller gates its
    /// release on the round's shuffle barrier.
    pub fn private_key(&self, round: u64) -> Result<[u8; SCALAR_SIZE], MixError> {
        Ok(point::encode_scalar(&self.state(round)?.secret))
    }

    /// Buffer the inner ciphertexts recovered by the last-in-cascade mix.
    pub fn add_inner_ciphertexts(&self, round: u64, msgs: Vec<Vec<u8>>) -> Result<(), MixError> {
        let state = self.state(round)?;
        state.inner.lock().ciphertexts.extend(msgs);
        Ok(())
    }

    /// Sum the collected private scalars and decrypt every buffered inner
    /// ciphertext in parallel, in input order. Any authentication failure
    /// aborts the round.
    pub fn finalize(
        &self,
        round: u64,
        private_keys: &[[u8; SCALAR_SIZE]],
    ) -> Result<Vec<Vec<u8>>, MixError> {
        if private_keys.len() != self.group_size {
            return Err(MixError::KeyUnavailable(round));
        }
        let state = self.state(round)?;
        let ciphertexts = {
            let inner = state.inner.lock();
            if inner.ciphertexts.is_empty() {
                return Err(MixError::StateViolation(
                    "finalize without inner ciphertexts",
                ));
            }
            inner.ciphertexts.clone()
        };

        let mut aggregate = Scalar::from(0u64);
        for key in private_keys {
            aggregate += point::decode_scalar(key);
        }

        let nonce = Nonce::envelope(round);
        let plaintexts: Result<Vec<Vec<u8>>, _> = state.pool.install(|| {
            ciphertexts
                .par_iter()
                .map(|ct| envelope::decrypt(&aggregate, &nonce, ct))
                .collect()
        });
        aggregate.zeroize();
        let plaintexts = plaintexts.map_err(|_| MixError::InnerOpenFailed)?;

        state.inner.lock().done = true;
        debug!(round, index = self.index, count = plaintexts.len(), "envelope finalized");
        Ok(plaintexts)
    }

    /// Purge a finished round; the private scalar is erased on drop.
    pub fn end_round(&self, round: u64) -> Result<(), MixError> {
        let mut states = self.states.write();
        let state = states
            .get(&round)
            .ok_or(MixError::RoundNotInitialized(round))?;
        if !state.inner.lock().done {
            return Err(MixError::StateViolation("round has not finished"));
        }
        states.remove(&round);
        Ok(())
    }

    /// Purge a round regardless of completion; used when the round failed
    /// so its worker pool is not leaked.
    pub fn abort_round(&self, round: u64) {
        self.states.write().remove(&round);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xrd_crypto::point::decode_point;

    fn group(k: usize, round: u64) -> (Vec<Verifier>, Point) {
        let verifiers: Vec<_> = (0..k).map(|i| Verifier::new(i, k)).collect();
        for v in &verifiers {
            v.new_round(round).unwrap();
        }
        let agg = verifiers
            .iter()
            .map(|v| decode_point(&v.public_key(round).unwrap()).unwrap())
            .fold(point::identity(), |acc, p| acc + p);
        (verifiers, agg)
    }

    #[test]
    fn finalize_recovers_plaintexts_in_order() {
        let k = 4;
        let (verifiers, agg) = group(k, 0);
        let nonce = Nonce::envelope(0);
        let msgs: Vec<Vec<u8>> = (0..50u8).map(|i| vec![i; 64]).collect();
        let cts: Vec<_> = msgs
            .iter()
            .map(|m| envelope::encrypt(&agg, &nonce, m))
            .collect();

        let last = &verifiers[k - 1];
        last.add_inner_ciphertexts(0, cts).unwrap();

        let keys: Vec<_> = verifiers
            .iter()
            .map(|v| v.private_key(0).unwrap())
            .collect();
        let plaintexts = last.finalize(0, &keys).unwrap();
        assert_eq!(plaintexts, msgs);
    }

    #[test]
    fn corrupted_inner_ciphertext_aborts() {
        let k = 3;
        let (verifiers, agg) = group(k, 1);
        let nonce = Nonce::envelope(1);
        let mut cts = vec![envelope::encrypt(&agg, &nonce, b"payload")];
        let len = cts[0].len();
        cts[0][len - 1] ^= 1;

        let last = &verifiers[k - 1];
        last.add_inner_ciphertexts(1, cts).unwrap();
        let keys: Vec<_> = verifiers
            .iter()
            .map(|v| v.private_key(1).unwrap())
            .collect();
        assert!(matches!(
            last.finalize(1, &keys),
            Err(MixError::InnerOpenFailed)
        ));
    }

    #[test]
    fn missing_keys_are_rejected() {
        let (verifiers, _) = group(3, 2);
        let last = &verifiers[2];
        last.add_inner_ciphertexts(2, vec![vec![0u8; 128]]).unwrap();
        assert!(matches!(
            last.finalize(2, &[[0u8; SCALAR_SIZE]; 2]),
            Err(MixError::KeyUnavailable(2))
        ));
    }

    #[test]
    fn end_round_requires_completion() {
        let v = Verifier::new(0, 1);
        v.new_round(5).unwrap();
        assert!(matches!(
            v.end_round(5),
            Err(MixError::StateViolation(_))
        ));
        v.add_inner_ciphertexts(5, vec![envelope::encrypt(
            &decode_point(&v.public_key(5).unwrap()).unwrap(),
            &Nonce::envelope(5),
            b"m",
        )])
        .unwrap();
        let key = v.private_key(5).unwrap();
        v.finalize(5, &[key]).unwrap();
        v.end_round(5).unwrap();
        assert!(matches!(
            v.public_key(5),
            Err(MixError::RoundNotInitialized(5))
        ));
    }

    #[test]
    fn fresh_keys_per_round() {
        let v = Verifier::new(0, 1);
        v.new_round(1).unwrap();
        v.new_round(2).unwrap();
        assert_ne!(v.public_key(1).unwrap(), v.public_key(2).unwrap());
    }
}
