//! Per-server, per-round mix engine.
//!
//! A round moves through `Init → Keyed → Ingesting → Proven/Mixed →
//! Verified` and is purged on `end_round`. Client ciphertexts are submitted
//! to every server of a group: the first server mixes them, the others keep
//! only the running header sum they need to verify the first shuffle proof.
//! Records between servers enter through `add_messages`.
//!
//! Mixing peels one onion layer off every record in parallel, re-blinds the
//! headers with this round's blinding exponent, shuffles, and (except for
//! the last server) emits a LogEq proof that one common exponent maps the
//! incoming header sum to the outgoing one, with the exact outgoing header
//! list bound into the challenge. Proofs are verified by every peer in
//! cascade order against its own running sum; a single bad proof, MAC
//! failure, or negative confirmation aborts the round for every waiter.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use xrd_crypto::nizk;
use xrd_crypto::onion::{self, Peeled};
use xrd_crypto::point::{self, Nonce, Point, Scalar, POINT_SIZE};
use xrd_crypto::shuffle::Shuffler;
use xrd_util::gate::Gate;

use crate::error::MixError;

/// Static description of one server's role in a cascade for one round.
#[derive(Debug, Clone, Copy)]
pub struct RoundConfig {
    pub client_verifiable: bool,
    pub verifiable: bool,
    pub row: u32,
    pub index: usize,
    pub first: bool,
    pub last: bool,
    pub aux_size: usize,
    pub group_size: usize,
}

impl RoundConfig {
    /// Number of shuffle proofs produced in this cascade (the last server
    /// does not prove).
    fn prover_count(&self) -> usize {
        self.group_size.saturating_sub(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Keyed,
    Ingesting,
    Proven,
    Mixed,
    Verified,
}

struct RoundInner {
    phase: Phase,
    mix_secret: Option<Scalar>,
    blind_secret: Scalar,
    blind_publics: Vec<Point>,
    ciphertexts: Vec<Vec<u8>>,
    messages: Vec<Vec<u8>>,
    /// Header sum of the records entering the cascade position whose proof
    /// is verified next.
    incoming_sum: Point,
    /// Cascade position whose proof this engine verifies next; advanced by
    /// our own `prove_mix` when it reaches our position.
    next_verify: usize,
    aborted: bool,
}

struct RoundState {
    cfg: RoundConfig,
    /// Opens after `group_size - 1` positive confirmations.
    confirmations: Gate,
    pool: rayon::ThreadPool,
    inner: Mutex<RoundInner>,
}

impl RoundState {
    fn abort(&self) {
        self.inner.lock().aborted = true;
        self.confirmations.abort();
    }
}

/// The mix engine of one logical server identity.
#[derive(Default)]
pub struct MixEngine {
    states: RwLock<HashMap<u64, Arc<RoundState>>>,
}

fn pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        * 2
}

impl MixEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_round(&self, round: u64, cfg: RoundConfig) -> Result<(), MixError> {
        let mut states = self.states.write();
        if states.contains_key(&round) {
            return Err(MixError::RoundExists(round));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(pool_size())
            .build()
            .map_err(|_| MixError::Pool)?;
        let confirmations = if cfg.verifiable {
            Gate::new(cfg.group_size.saturating_sub(1))
        } else {
            Gate::new(0)
        };
        states.insert(
            round,
            Arc::new(RoundState {
                cfg,
                confirmations,
                pool,
                inner: Mutex::new(RoundInner {
                    phase: Phase::Init,
                    mix_secret: None,
                    blind_secret: Scalar::from(1u64),
                    blind_publics: Vec::new(),
                    ciphertexts: Vec::new(),
                    messages: Vec::new(),
                    incoming_sum: point::identity(),
                    next_verify: 0,
                    aborted: false,
                }),
            }),
        );
        Ok(())
    }

    pub fn round_config(&self, round: u64) -> Result<RoundConfig, MixError> {
        Ok(self.state(round)?.cfg)
    }

    fn state(&self, round: u64) -> Result<Arc<RoundState>, MixError> {
        self.states
            .read()
            .get(&round)
            .cloned()
            .ok_or(MixError::RoundNotInitialized(round))
    }

    /// Install the round's mix keypair. `Init → Keyed`.
    pub fn set_round_key(&self, round: u64, _public: &[u8], secret: &[u8]) -> Result<(), MixError> {
        let state = self.state(round)?;
        let mut inner = state.inner.lock();
        if inner.phase != Phase::Init {
            return Err(MixError::StateViolation("round key already set"));
        }
        inner.mix_secret = Some(point::decode_scalar(secret));
        inner.phase = Phase::Keyed;
        Ok(())
    }

    /// Install the group's accumulated blind points and this server's blind
    /// exponent. Required in verifiable mode.
    pub fn set_blind_key(
        &self,
        round: u64,
        peer_publics: &[[u8; POINT_SIZE]],
        secret: &[u8],
    ) -> Result<(), MixError> {
        let state = self.state(round)?;
        let mut inner = state.inner.lock();
        if inner.phase == Phase::Init {
            return Err(MixError::StateViolation("blind key before round key"));
        }
        let publics = peer_publics
            .iter()
            .map(|b| point::decode_point(b))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| MixError::KeyUnavailable(round))?;
        inner.blind_publics = publics;
        inner.blind_secret = point::decode_scalar(secret);
        Ok(())
    }

    /// Ingest a batch of client ciphertexts with their PoKDL proofs. Every
    /// server of the group receives the same batch; only the first mixes
    /// it, the others keep the header sum for proof verification.
    pub fn add_ciphertexts(
        &self,
        round: u64,
        ciphertexts: Vec<Vec<u8>>,
        proofs: Vec<Vec<u8>>,
    ) -> Result<(), MixError> {
        let state = self.state(round)?;
        let cfg = state.cfg;

        let headers = if cfg.verifiable || cfg.client_verifiable {
            let decoded: Result<Vec<Point>, MixError> = state.pool.install(|| {
                ciphertexts
                    .par_iter()
                    .map(|ct| {
                        point::decode_point(ct.get(..POINT_SIZE).ok_or(MixError::OpenFailed)?)
                            .map_err(|_| MixError::OpenFailed)
                    })
                    .collect()
            });
            Some(decoded?)
        } else {
            None
        };

        if cfg.client_verifiable {
            let headers = headers.as_ref().expect("headers decoded above");
            if proofs.len() != ciphertexts.len() {
                return Err(MixError::BadClientProof);
            }
            state
                .pool
                .install(|| {
                    headers
                        .par_iter()
                        .zip(proofs.par_iter())
                        .try_for_each(|(header, proof)| nizk::pokdl_verify(header, proof))
                })
                .map_err(|_| MixError::BadClientProof)?;
        }

        let mut inner = state.inner.lock();
        match inner.phase {
            Phase::Keyed => inner.phase = Phase::Ingesting,
            Phase::Ingesting => {}
            _ => return Err(MixError::StateViolation("ciphertexts after mixing began")),
        }
        if let Some(headers) = headers {
            for h in &headers {
                inner.incoming_sum += h;
            }
        }
        if cfg.first {
            inner.ciphertexts.extend(ciphertexts);
        }
        Ok(())
    }

    /// Ingest records forwarded by the preceding server of the cascade.
    pub fn add_messages(&self, round: u64, messages: Vec<Vec<u8>>) -> Result<(), MixError> {
        let state = self.state(round)?;
        let mut inner = state.inner.lock();
        match inner.phase {
            Phase::Keyed => inner.phase = Phase::Ingesting,
            Phase::Ingesting => {}
            _ => return Err(MixError::StateViolation("messages after mixing began")),
        }
        inner.messages.extend(messages);
        Ok(())
    }

    /// Mark the round started; valid from `Ingesting` onward. Mixing
    /// itself additionally waits for the peer confirmations of the
    /// preceding layer in verifiable mode.
    pub fn start_round(&self, round: u64) -> Result<(), MixError> {
        let state = self.state(round)?;
        let inner = state.inner.lock();
        if inner.aborted {
            return Err(MixError::RoundAborted);
        }
        match inner.phase {
            Phase::Init | Phase::Keyed => Err(MixError::StateViolation("no input to mix")),
            _ => Ok(()),
        }
    }

    /// Decrypt-and-blind one layer, shuffle, and emit the shuffle proof.
    /// Blocks until every peer has confirmed the preceding layer.
    pub async fn prove_mix(&self, round: u64) -> Result<(Vec<Vec<u8>>, Vec<u8>), MixError> {
        let state = self.state(round)?;
        let cfg = state.cfg;
        if !cfg.verifiable {
            return Err(MixError::StateViolation("prove_mix in non-verifiable round"));
        }
        if cfg.last {
            return Err(MixError::StateViolation("last server does not prove"));
        }
        state.confirmations.wait().await?;

        let (records, secret, blind, sum_check) = self.take_input(&state, round)?;
        let nonce = Nonce::new(round, cfg.row.into(), cfg.index as u64);
        let (mut out, sum_in) = decrypt_records(&state, records, &secret, &blind, &nonce)?;
        debug_assert!(sum_check.is_none() || sum_check == Some(sum_in));
        Shuffler::new(OsRng).shuffle(&mut out);

        let sum_out = sum_in * blind;
        let binding = bind_headers(out.iter().map(|r| &r[..POINT_SIZE]));

        let (base, accumulated) = {
            let inner = state.inner.lock();
            (blind_base(&inner, cfg.index)?, blind_point(&inner, cfg.index)?)
        };
        let proof = nizk::logeq_prove(&blind, &base, &accumulated, &sum_in, &sum_out, &binding);

        let mut inner = state.inner.lock();
        if inner.aborted {
            return Err(MixError::RoundAborted);
        }
        inner.phase = Phase::Proven;
        if inner.next_verify == cfg.index {
            inner.incoming_sum = sum_out;
            inner.next_verify += 1;
        }
        maybe_verified(&mut inner, &cfg);
        debug!(round, index = cfg.index, records = out.len(), "proved mix");
        Ok((out, proof))
    }

    /// Decrypt-and-blind one layer and shuffle without proving. The last
    /// server of a verifiable cascade uses this; in non-verifiable rounds
    /// any position may.
    pub async fn mix(&self, round: u64) -> Result<Vec<Vec<u8>>, MixError> {
        let state = self.state(round)?;
        let cfg = state.cfg;
        if cfg.verifiable {
            if !cfg.last {
                return Err(MixError::StateViolation("only the last server skips proving"));
            }
            state.confirmations.wait().await?;
        }

        let (records, secret, blind, _) = self.take_input(&state, round)?;
        let nonce = Nonce::new(round, cfg.row.into(), cfg.index as u64);
        let (mut out, _) = decrypt_records(&state, records, &secret, &blind, &nonce)?;
        Shuffler::new(OsRng).shuffle(&mut out);

        let mut inner = state.inner.lock();
        if inner.aborted {
            return Err(MixError::RoundAborted);
        }
        inner.phase = Phase::Mixed;
        maybe_verified(&mut inner, &cfg);
        debug!(round, index = cfg.index, records = out.len(), "mixed");
        Ok(out)
    }

    fn take_input(
        &self,
        state: &RoundState,
        round: u64,
    ) -> Result<(Vec<Vec<u8>>, Scalar, Scalar, Option<Point>), MixError> {
        let cfg = state.cfg;
        let mut inner = state.inner.lock();
        if inner.aborted {
            return Err(MixError::RoundAborted);
        }
        if inner.phase != Phase::Ingesting {
            return Err(MixError::StateViolation("nothing ingested for this round"));
        }
        let secret = inner.mix_secret.ok_or(MixError::KeyUnavailable(round))?;
        let blind = inner.blind_secret;
        let records = if cfg.first {
            std::mem::take(&mut inner.ciphertexts)
        } else {
            std::mem::take(&mut inner.messages)
        };
        let sum_check = cfg.verifiable.then_some(inner.incoming_sum);
        Ok((records, secret, blind, sum_check))
    }

    /// Verify the shuffle proof of the peer at `index` against its claimed
    /// outgoing headers. Proofs must arrive in cascade order.
    pub fn verify_proof(
        &self,
        round: u64,
        index: usize,
        keys: &[Vec<u8>],
        proof: &[u8],
    ) -> Result<(), MixError> {
        let state = self.state(round)?;
        let cfg = state.cfg;
        if !cfg.verifiable {
            return Err(MixError::StateViolation("proof in non-verifiable round"));
        }
        if index == cfg.index {
            return Err(MixError::StateViolation("own proof needs no verification"));
        }
        if index >= cfg.prover_count() {
            return Err(MixError::StateViolation("position does not prove"));
        }

        // decode the claimed outgoing headers outside the state lock
        let decoded: Result<Vec<Point>, MixError> = state.pool.install(|| {
            keys.par_iter()
                .map(|k| point::decode_point(k).map_err(|_| MixError::BadShuffleProof(index)))
                .collect()
        });
        let outgoing = decoded?;
        let sum_out = outgoing
            .iter()
            .fold(point::identity(), |acc, p| acc + p);
        let binding = bind_headers(keys.iter().map(|k| k.as_slice()));

        let mut inner = state.inner.lock();
        if inner.aborted {
            return Err(MixError::RoundAborted);
        }
        if index != inner.next_verify {
            return Err(MixError::StateViolation(
                "shuffle proofs must be verified in cascade order",
            ));
        }
        let base = blind_base(&inner, index)?;
        let accumulated = blind_point(&inner, index)?;
        let sum_in = inner.incoming_sum;

        if nizk::logeq_verify(&base, &accumulated, &sum_in, &sum_out, &binding, proof).is_err() {
            inner.aborted = true;
            drop(inner);
            state.confirmations.abort();
            warn!(round, index, "shuffle proof rejected");
            return Err(MixError::BadShuffleProof(index));
        }

        inner.incoming_sum = sum_out;
        inner.next_verify += 1;
        maybe_verified(&mut inner, &cfg);
        debug!(round, index, "shuffle proof accepted");
        Ok(())
    }

    /// A peer's verdict on the preceding layer. `false` aborts the round.
    pub fn confirm_verification(&self, round: u64, verified: bool) -> Result<(), MixError> {
        let state = self.state(round)?;
        if verified {
            state.confirmations.arrive();
            Ok(())
        } else {
            state.abort();
            Err(MixError::RoundAborted)
        }
    }

    /// Abort the round: every blocked operation observes `RoundAborted`.
    pub fn abort_round(&self, round: u64) {
        if let Ok(state) = self.state(round) {
            state.abort();
        }
    }

    /// Purge the round and free its worker pool. Unfinished rounds are
    /// aborted first so no waiter is left behind.
    pub fn end_round(&self, round: u64) -> Result<(), MixError> {
        let state = self
            .states
            .write()
            .remove(&round)
            .ok_or(MixError::RoundNotInitialized(round))?;
        let inner = state.inner.lock();
        if !matches!(inner.phase, Phase::Mixed | Phase::Proven | Phase::Verified) && !inner.aborted
        {
            warn!(round, "ending an unfinished round");
        }
        drop(inner);
        state.abort();
        Ok(())
    }
}

/// LogEq base for the prover at `index`: the predecessor's accumulated
/// blind point, or `G` for the head of the cascade.
fn blind_base(inner: &RoundInner, index: usize) -> Result<Point, MixError> {
    if index == 0 {
        Ok(point::generator())
    } else {
        inner
            .blind_publics
            .get(index - 1)
            .copied()
            .ok_or(MixError::StateViolation("blind keys not set"))
    }
}

fn blind_point(inner: &RoundInner, index: usize) -> Result<Point, MixError> {
    inner
        .blind_publics
        .get(index)
        .copied()
        .ok_or(MixError::StateViolation("blind keys not set"))
}

fn maybe_verified(inner: &mut RoundInner, cfg: &RoundConfig) {
    if cfg.verifiable
        && inner.next_verify >= cfg.prover_count()
        && matches!(inner.phase, Phase::Proven | Phase::Mixed)
    {
        inner.phase = Phase::Verified;
    }
}

/// Digest of an outgoing header list in its exact byte order; folded into
/// the shuffle proof challenge.
fn bind_headers<'a>(headers: impl Iterator<Item = &'a [u8]>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for h in headers {
        hasher.update(h);
    }
    hasher.finalize().into()
}

fn decrypt_records(
    state: &RoundState,
    records: Vec<Vec<u8>>,
    secret: &Scalar,
    blind: &Scalar,
    nonce: &Nonce,
) -> Result<(Vec<Vec<u8>>, Point), MixError> {
    let aux = state.cfg.aux_size;
    let peeled: Result<Vec<Peeled>, _> = state.pool.install(|| {
        records
            .par_iter()
            .map(|record| onion::peel(record, secret, blind, aux, nonce))
            .collect()
    });
    let peeled = peeled.map_err(|_| MixError::OpenFailed)?;
    let sum_in = peeled
        .iter()
        .fold(point::identity(), |acc, p| acc + p.incoming);
    Ok((peeled.into_iter().map(|p| p.record).collect(), sum_in))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(index: usize, k: usize) -> RoundConfig {
        RoundConfig {
            client_verifiable: false,
            verifiable: false,
            row: 0,
            index,
            first: index == 0,
            last: index + 1 == k,
            aux_size: 0,
            group_size: k,
        }
    }

    #[test]
    fn duplicate_round_rejected() {
        let engine = MixEngine::new();
        engine.new_round(0, cfg(0, 2)).unwrap();
        assert!(matches!(
            engine.new_round(0, cfg(0, 2)),
            Err(MixError::RoundExists(0))
        ));
    }

    #[test]
    fn operations_require_round() {
        let engine = MixEngine::new();
        assert!(matches!(
            engine.add_messages(3, vec![]),
            Err(MixError::RoundNotInitialized(3))
        ));
    }

    #[test]
    fn key_must_precede_ingest() {
        let engine = MixEngine::new();
        engine.new_round(0, cfg(1, 2)).unwrap();
        assert!(matches!(
            engine.add_messages(0, vec![vec![0u8; 96]]),
            Err(MixError::StateViolation(_))
        ));
    }

    #[tokio::test]
    async fn mix_requires_input() {
        let engine = MixEngine::new();
        engine.new_round(0, cfg(0, 1)).unwrap();
        let (_, public) = point::generate_keypair();
        engine
            .set_round_key(0, &point::encode_point(&public), &[1u8; 32])
            .unwrap();
        assert!(matches!(
            engine.mix(0).await,
            Err(MixError::StateViolation(_))
        ));
    }

    #[tokio::test]
    async fn negative_confirmation_aborts() {
        let k = 3;
        let mut c = cfg(1, k);
        c.verifiable = true;
        let engine = MixEngine::new();
        engine.new_round(0, c).unwrap();
        let (secret, public) = point::generate_keypair();
        engine
            .set_round_key(0, &point::encode_point(&public), &point::encode_scalar(&secret))
            .unwrap();
        engine.add_messages(0, vec![vec![0u8; 200]]).unwrap();

        assert!(matches!(
            engine.confirm_verification(0, false),
            Err(MixError::RoundAborted)
        ));
        assert!(matches!(engine.prove_mix(0).await, Err(MixError::RoundAborted)));
    }
}
