//! Per-address mix node: hosts the mix engines and envelope verifiers of
//! every logical server identity at one address and runs the group
//! choreography between them.
//!
//! Clients stream identical ciphertext batches to every member of a group.
//! On round start the first server of each cascade proves-and-forwards;
//! every subsequent server verifies the incoming proof, confirms it to the
//! next position, and mixes once all peers have confirmed the preceding
//! layer. The last server's plaintext buffer feeds the envelope protocol,
//! whose private keys release only after the server's shuffle gate has
//! counted every accepted proof. Recovered mail records are streamed to
//! their recipients' mailboxes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use xrd_config::{Group, ServerInfo, STREAM_SIZE};
use xrd_crypto::point::{POINT_SIZE, SCALAR_SIZE};
use xrd_mailbox::{Mail, MailError, Mailbox, MailboxError, USER_KEY_SIZE};
use xrd_mixnet::{MixEngine, MixError, RoundConfig, Verifier};
use xrd_util::gate::{Gate, Signal};
use xrd_util::span;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum NodeError {
    #[error("unknown identity {0}")]
    UnknownId(String),
    #[error("no node at address {0}")]
    UnknownAddress(String),
    #[error("recipient key has no mailbox")]
    UnknownRecipient,
    #[error("directory not wired")]
    NoDirectory,
    #[error("round task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Mix(#[from] MixError),
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error(transparent)]
    Mail(#[from] MailError),
}

/// Origin of an ingest batch; server-to-server traffic drains ahead of
/// competing client batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Client,
    Server,
}

/// Mode switches for a deployment.
#[derive(Debug, Clone, Copy)]
pub struct NodeOptions {
    pub verifiable: bool,
    pub client_verifiable: bool,
    pub aux_size: usize,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            verifiable: true,
            client_verifiable: false,
            aux_size: 0,
        }
    }
}

/// In-process stand-in for the RPC surface: resolves server addresses to
/// nodes and mailbox ids to mailbox servers.
#[derive(Clone, Default)]
pub struct Directory {
    nodes: Arc<HashMap<String, MixNode>>,
    mailboxes: Arc<HashMap<String, Arc<Mailbox>>>,
}

impl Directory {
    pub fn new(nodes: HashMap<String, MixNode>, mailboxes: HashMap<String, Arc<Mailbox>>) -> Self {
        Self {
            nodes: Arc::new(nodes),
            mailboxes: Arc::new(mailboxes),
        }
    }

    pub fn node(&self, address: &str) -> Result<MixNode, NodeError> {
        self.nodes
            .get(address)
            .cloned()
            .ok_or_else(|| NodeError::UnknownAddress(address.to_string()))
    }

    pub fn mailbox(&self, mid: &str) -> Result<Arc<Mailbox>, NodeError> {
        self.mailboxes
            .get(mid)
            .cloned()
            .ok_or_else(|| NodeError::UnknownAddress(mid.to_string()))
    }

    pub fn mailbox_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.mailboxes.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Per-(identity, round) choreography state: the one-shot plaintext result
/// of a last-in-cascade mix and the barrier counting accepted shuffle
/// proofs, on which envelope key release waits.
struct CascadeState {
    result: Signal<Vec<Vec<u8>>>,
    shuffle: Gate,
}

struct NodeInner {
    address: String,
    servers: Arc<HashMap<String, ServerInfo>>,
    part_of: HashMap<String, Group>,
    configs: HashMap<String, RoundConfig>,
    mixes: HashMap<String, MixEngine>,
    verifiers: HashMap<String, Verifier>,
    /// Serializes server-source ingest so an inter-server batch mixes
    /// ahead of competing client traffic.
    ingest_lock: tokio::sync::Mutex<()>,
    states: RwLock<HashMap<(String, u64), Arc<CascadeState>>>,
    deliveries: Mutex<HashMap<u64, Vec<tokio::task::JoinHandle<Result<(), NodeError>>>>>,
    directory: OnceLock<Directory>,
}

/// Cheap-to-clone handle on one mix node.
#[derive(Clone)]
pub struct MixNode {
    inner: Arc<NodeInner>,
}

impl MixNode {
    pub fn new(
        address: impl Into<String>,
        servers: Arc<HashMap<String, ServerInfo>>,
        groups: &HashMap<String, Group>,
        opts: NodeOptions,
    ) -> Self {
        let address = address.into();
        let mut part_of = HashMap::new();
        let mut configs = HashMap::new();
        let mut mixes = HashMap::new();
        let mut verifiers = HashMap::new();

        for group in groups.values() {
            for (index, sid) in group.servers.iter().enumerate() {
                if servers[sid].address != address {
                    continue;
                }
                let cfg = RoundConfig {
                    client_verifiable: opts.client_verifiable,
                    verifiable: opts.verifiable,
                    row: group.row,
                    index,
                    first: index == 0,
                    last: index + 1 == group.servers.len(),
                    aux_size: opts.aux_size,
                    group_size: group.servers.len(),
                };
                part_of.insert(sid.clone(), group.clone());
                configs.insert(sid.clone(), cfg);
                mixes.insert(sid.clone(), MixEngine::new());
                verifiers.insert(sid.clone(), Verifier::new(index, group.servers.len()));
            }
        }

        Self {
            inner: Arc::new(NodeInner {
                address,
                servers,
                part_of,
                configs,
                mixes,
                verifiers,
                ingest_lock: tokio::sync::Mutex::new(()),
                states: RwLock::new(HashMap::new()),
                deliveries: Mutex::new(HashMap::new()),
                directory: OnceLock::new(),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Wire the node into its deployment. Must be called before the first
    /// round.
    pub fn set_directory(&self, directory: Directory) {
        let _ = self.inner.directory.set(directory);
    }

    fn directory(&self) -> Result<&Directory, NodeError> {
        self.inner.directory.get().ok_or(NodeError::NoDirectory)
    }

    fn engine(&self, id: &str) -> Result<&MixEngine, NodeError> {
        self.inner
            .mixes
            .get(id)
            .ok_or_else(|| NodeError::UnknownId(id.to_string()))
    }

    fn verifier(&self, id: &str) -> Result<&Verifier, NodeError> {
        self.inner
            .verifiers
            .get(id)
            .ok_or_else(|| NodeError::UnknownId(id.to_string()))
    }

    fn config(&self, id: &str) -> Result<RoundConfig, NodeError> {
        self.inner
            .configs
            .get(id)
            .copied()
            .ok_or_else(|| NodeError::UnknownId(id.to_string()))
    }

    fn group(&self, id: &str) -> Result<Group, NodeError> {
        self.inner
            .part_of
            .get(id)
            .cloned()
            .ok_or_else(|| NodeError::UnknownId(id.to_string()))
    }

    fn peer(&self, sid: &str) -> Result<MixNode, NodeError> {
        let info = self
            .inner
            .servers
            .get(sid)
            .ok_or_else(|| NodeError::UnknownId(sid.to_string()))?;
        self.directory()?.node(&info.address)
    }

    fn cascade_state(&self, id: &str, round: u64) -> Result<Arc<CascadeState>, NodeError> {
        self.inner
            .states
            .read()
            .get(&(id.to_string(), round))
            .cloned()
            .ok_or(NodeError::Mix(MixError::RoundNotInitialized(round)))
    }

    /// Set up every hosted identity for the round and arm one delivery
    /// task per last-in-cascade identity.
    pub async fn new_round(&self, round: u64) -> Result<(), NodeError> {
        for (id, engine) in &self.inner.mixes {
            let cfg = self.inner.configs[id];
            let info = &self.inner.servers[id];
            let group = &self.inner.part_of[id];

            self.inner.verifiers[id].new_round(round)?;
            engine.new_round(round, cfg)?;
            engine.set_round_key(round, &info.mix_public, &info.mix_secret)?;
            if cfg.verifiable {
                let blinds = xrd_config::group_blind_keys(self.inner.servers.as_ref(), group);
                engine.set_blind_key(round, &blinds, &info.blind_secret)?;
            }

            let proofs_to_count = if !cfg.verifiable {
                0
            } else if cfg.last {
                cfg.group_size - 1
            } else {
                cfg.group_size.saturating_sub(2)
            };
            self.inner.states.write().insert(
                (id.clone(), round),
                Arc::new(CascadeState {
                    result: Signal::new(),
                    shuffle: Gate::new(proofs_to_count),
                }),
            );
        }

        // recipient key -> mailbox id, from every mailbox's roster
        let directory = self.directory()?.clone();
        let mut mailbox_map = HashMap::new();
        for mid in directory.mailbox_ids() {
            let mailbox = directory.mailbox(&mid)?;
            for key in mailbox.registered_users(round)? {
                mailbox_map.insert(key, mid.clone());
            }
        }
        let mailbox_map = Arc::new(mailbox_map);

        let mut handles = Vec::new();
        for (id, cfg) in &self.inner.configs {
            if !cfg.last {
                continue;
            }
            let node = self.clone();
            let id = id.clone();
            let map = mailbox_map.clone();
            handles.push(tokio::spawn(async move {
                node.handle_round(&id, round, map).await
            }));
        }
        self.inner.deliveries.lock().insert(round, handles);
        Ok(())
    }

    /// Ingest a batch of client ciphertexts for one hosted identity.
    pub fn submit_ciphertexts(
        &self,
        id: &str,
        round: u64,
        ciphertexts: Vec<Vec<u8>>,
        proofs: Vec<Vec<u8>>,
    ) -> Result<(), NodeError> {
        Ok(self.engine(id)?.add_ciphertexts(round, ciphertexts, proofs)?)
    }

    /// Ingest records for one hosted identity. A server-source batch locks
    /// the node's ingest mutex and immediately mixes-and-forwards.
    pub async fn add_messages(
        &self,
        id: &str,
        round: u64,
        source: Source,
        messages: Vec<Vec<u8>>,
    ) -> Result<(), NodeError> {
        match source {
            Source::Client => Ok(self.engine(id)?.add_messages(round, messages)?),
            Source::Server => {
                let _serialize = self.inner.ingest_lock.lock().await;
                self.engine(id)?.add_messages(round, messages)?;
                if let Err(err) = self.mix_and_forward(id, round).await {
                    self.abort_cascade(id, round);
                    return Err(err);
                }
                Ok(())
            }
        }
    }

    /// Start the round on every hosted identity. First-in-cascade
    /// identities mix as soon as their peers have confirmed readiness;
    /// everyone else confirms readiness to the head of their cascade.
    pub async fn start_round(&self, round: u64) -> Result<(), NodeError> {
        let mut tasks: JoinSet<Result<(), NodeError>> = JoinSet::new();
        for id in self.inner.mixes.keys() {
            let node = self.clone();
            let id = id.clone();
            tasks.spawn(async move {
                let cfg = node.config(&id)?;
                node.engine(&id)?.start_round(round)?;
                if cfg.first {
                    if let Err(err) = node.mix_and_forward(&id, round).await {
                        node.abort_cascade(&id, round);
                        return Err(err);
                    }
                } else if cfg.verifiable {
                    let group = node.group(&id)?;
                    let head = &group.servers[0];
                    node.peer(head)?.confirm_verification(head, round, true)?;
                }
                Ok(())
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|e| NodeError::Task(e.to_string()))??;
        }
        Ok(())
    }

    /// Mix the identity's buffered input and hand the output onward:
    /// records to the successor, the proof to every peer, or the plaintext
    /// buffer to the round's result signal for the last server.
    fn mix_and_forward<'a>(
        &'a self,
        id: &'a str,
        round: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), NodeError>> + Send + 'a>> {
        Box::pin(async move {
            let cfg = self.config(id)?;
            let engine = self.engine(id)?;

            if cfg.last {
                let records = engine.mix(round).await?;
                let inner: Vec<Vec<u8>> = records
                    .into_iter()
                    .map(|r| r[POINT_SIZE..].to_vec())
                    .collect();
                debug!(id, round, count = inner.len(), "cascade complete");
                self.cascade_state(id, round)?.result.set(inner);
                return Ok(());
            }

            let (records, proof) = if cfg.verifiable {
                let (records, proof) = engine.prove_mix(round).await?;
                (records, Some(proof))
            } else {
                (engine.mix(round).await?, None)
            };

            // the caller may hold the ingest lock: forward from a task so no
            // lock is held while talking to peers
            let node = self.clone();
            let id_owned = id.to_string();
            tokio::spawn(async move {
                if let Err(err) = node.dispatch(&id_owned, round, records, proof).await {
                    error!(id = %id_owned, round, %err, "forwarding failed, aborting round");
                    node.abort_cascade(&id_owned, round);
                }
            });
            Ok(())
        })
    }

    /// Send mixed records to the cascade successor and, in verifiable
    /// mode, the shuffle proof to every peer.
    async fn dispatch(
        &self,
        id: &str,
        round: u64,
        records: Vec<Vec<u8>>,
        proof: Option<Vec<u8>>,
    ) -> Result<(), NodeError> {
        let cfg = self.config(id)?;
        let group = self.group(id)?;
        let next_id = group.servers[cfg.index + 1].clone();

        let headers: Vec<Vec<u8>> = records
            .iter()
            .map(|r| r[..POINT_SIZE].to_vec())
            .collect();

        let mut tasks: JoinSet<Result<(), NodeError>> = JoinSet::new();

        {
            let node = self.clone();
            let next = next_id.clone();
            tasks.spawn(async move {
                let peer = node.peer(&next)?;
                peer.add_messages(&next, round, Source::Server, records).await
            });
        }

        if let Some(proof) = proof {
            for (peer_index, sid) in group.servers.iter().enumerate() {
                if peer_index == cfg.index {
                    continue;
                }
                let node = self.clone();
                let sid = sid.clone();
                let headers = headers.clone();
                let proof = proof.clone();
                let prover = cfg.index;
                tasks.spawn(async move {
                    let peer = node.peer(&sid)?;
                    peer.verify_proof(&sid, round, prover, headers, proof).await
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|e| NodeError::Task(e.to_string()))??;
        }
        Ok(())
    }

    /// Verify a peer's shuffle proof for one hosted identity, count it on
    /// the shuffle gate and relay the verdict to the next cascade
    /// position.
    pub async fn verify_proof(
        &self,
        id: &str,
        round: u64,
        index: usize,
        keys: Vec<Vec<u8>>,
        proof: Vec<u8>,
    ) -> Result<(), NodeError> {
        let cfg = self.config(id)?;
        let group = self.group(id)?;
        let verdict = self.engine(id)?.verify_proof(round, index, &keys, &proof);

        let next = (index + 1 < cfg.group_size).then(|| group.servers[index + 1].clone());
        match verdict {
            Ok(()) => {
                self.cascade_state(id, round)?.shuffle.arrive();
                if let Some(next) = next {
                    self.peer(&next)?.confirm_verification(&next, round, true)?;
                }
                Ok(())
            }
            Err(err) => {
                warn!(id, round, index, %err, "rejecting shuffle proof");
                self.abort_cascade(id, round);
                if let Some(next) = next {
                    if let Ok(peer) = self.peer(&next) {
                        let _ = peer.confirm_verification(&next, round, false);
                    }
                }
                Err(err.into())
            }
        }
    }

    /// A peer's verdict on the preceding layer for one hosted identity.
    pub fn confirm_verification(
        &self,
        id: &str,
        round: u64,
        verified: bool,
    ) -> Result<(), NodeError> {
        if verified {
            self.engine(id)?.confirm_verification(round, true)?;
        } else {
            let _ = self.engine(id)?.confirm_verification(round, false);
            self.abort_cascade(id, round);
        }
        Ok(())
    }

    /// The plaintext inner ciphertexts of a completed cascade; blocks
    /// until the last server has mixed.
    pub async fn get_messages(&self, id: &str, round: u64) -> Result<Vec<Vec<u8>>, NodeError> {
        if !self.config(id)?.last {
            return Err(NodeError::Mix(MixError::StateViolation(
                "messages live on the last server",
            )));
        }
        let state = self.cascade_state(id, round)?;
        Ok(state.result.wait().await.map_err(MixError::from)?)
    }

    /// The identity's inner public key for the round.
    pub fn get_inner_key(&self, id: &str, round: u64) -> Result<[u8; POINT_SIZE], NodeError> {
        Ok(self.verifier(id)?.public_key(round)?)
    }

    pub fn add_inner_ciphertexts(
        &self,
        id: &str,
        round: u64,
        msgs: Vec<Vec<u8>>,
    ) -> Result<(), NodeError> {
        Ok(self.verifier(id)?.add_inner_ciphertexts(round, msgs)?)
    }

    /// The identity's inner private key, released only after its shuffle
    /// gate has counted every accepted proof of the round.
    pub async fn get_private_inner_key(
        &self,
        id: &str,
        round: u64,
    ) -> Result<[u8; SCALAR_SIZE], NodeError> {
        let state = self.cascade_state(id, round)?;
        state.shuffle.wait().await.map_err(MixError::from)?;
        Ok(self.verifier(id)?.private_key(round)?)
    }

    /// Collect every group member's inner private key and decrypt the
    /// buffered inner ciphertexts.
    pub async fn finalize(&self, id: &str, round: u64) -> Result<Vec<Vec<u8>>, NodeError> {
        let group = self.group(id)?;
        let mut tasks: JoinSet<Result<(usize, [u8; SCALAR_SIZE]), NodeError>> = JoinSet::new();
        for (i, sid) in group.servers.iter().enumerate() {
            let node = self.clone();
            let sid = sid.clone();
            tasks.spawn(async move {
                let key = node.peer(&sid)?.get_private_inner_key(&sid, round).await?;
                Ok((i, key))
            });
        }
        let mut keys = vec![[0u8; SCALAR_SIZE]; group.servers.len()];
        while let Some(joined) = tasks.join_next().await {
            let (i, key) = joined.map_err(|e| NodeError::Task(e.to_string()))??;
            keys[i] = key;
        }
        Ok(self.verifier(id)?.finalize(round, &keys)?)
    }

    /// Delivery task of one last-in-cascade identity: wait for the cascade
    /// result, run the envelope protocol, and stream the recovered mail
    /// records to their mailboxes.
    async fn handle_round(
        &self,
        id: &str,
        round: u64,
        mailbox_map: Arc<HashMap<[u8; USER_KEY_SIZE], String>>,
    ) -> Result<(), NodeError> {
        let inners = self.get_messages(id, round).await?;
        self.add_inner_ciphertexts(id, round, inners)?;
        let plaintexts = self.finalize(id, round).await?;

        let mut per_mailbox: HashMap<String, Vec<Mail>> = HashMap::new();
        for plaintext in &plaintexts {
            let mail = Mail::decode(plaintext)?;
            let mid = mailbox_map
                .get(&mail.user_key)
                .ok_or(NodeError::UnknownRecipient)?;
            per_mailbox.entry(mid.clone()).or_default().push(mail);
        }

        let directory = self.directory()?.clone();
        for (mid, mails) in per_mailbox {
            let mailbox = directory.mailbox(&mid)?;
            let record_size = mails
                .first()
                .map(|m| m.message.len() + USER_KEY_SIZE)
                .unwrap_or(1);
            for chunk in span::stream_spans(mails.len(), STREAM_SIZE, record_size) {
                mailbox.deliver_mails(round, mails[chunk.start..chunk.end].to_vec())?;
            }
        }
        debug!(id, round, count = plaintexts.len(), "mail delivery complete");
        Ok(())
    }

    fn abort_cascade(&self, id: &str, round: u64) {
        if let Ok(engine) = self.engine(id) {
            engine.abort_round(round);
        }
        if let Ok(state) = self.cascade_state(id, round) {
            state.shuffle.abort();
            state.result.abort();
        }
    }

    /// Join the round's delivery tasks and purge every per-round resource.
    pub async fn end_round(&self, round: u64) -> Result<(), NodeError> {
        let handles = self.inner.deliveries.lock().remove(&round).unwrap_or_default();
        let mut first_err = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(round, %err, "delivery task failed");
                    first_err.get_or_insert(err);
                }
                Err(err) => {
                    first_err.get_or_insert(NodeError::Task(err.to_string()));
                }
            }
        }

        for (id, engine) in &self.inner.mixes {
            if let Err(err) = engine.end_round(round) {
                warn!(id, round, %err, "mix round cleanup");
            }
            let verifier = &self.inner.verifiers[id];
            if verifier.end_round(round).is_err() {
                // unfinished round: free the pool regardless
                verifier.abort_round(round);
            }
        }
        self.inner.states.write().retain(|(_, r), _| *r != round);

        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
