//! Client-side message synthesizer.
//!
//! One client instance drives a population of virtual users: per round it
//! draws fresh NaCl-box keypairs, assigns users to group templates with
//! the load-balancing LP, registers them (and their expected delivery
//! counts) with their mailboxes, builds one onion + envelope ciphertext
//! per assigned group, submits each group's batch to every server of that
//! group, and finally downloads and opens the delivered mail.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use crypto_box::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use rayon::prelude::*;
use tracing::{debug, info};

use xrd_config::{
    assignment, group_onion_keys, simplex, Group, ServerInfo, STREAM_SIZE,
};
use xrd_crypto::envelope;
use xrd_crypto::onion;
use xrd_crypto::point::{decode_point, Nonce, Point};
use xrd_mailbox::{mail, USER_KEY_SIZE};
use xrd_util::span;

use crate::node::Directory;

struct UserState {
    secret: SecretKey,
    public: [u8; USER_KEY_SIZE],
    groups: Vec<String>,
    mailbox: String,
    message: Vec<u8>,
}

struct ClientRound {
    round: u64,
    users: Vec<UserState>,
    by_key: HashMap<[u8; USER_KEY_SIZE], usize>,
    ciphertexts: HashMap<String, Vec<Vec<u8>>>,
    proofs: HashMap<String, Vec<Vec<u8>>>,
    /// `⌈M·N⌉ + 1`: capacity hint for per-group submission batches.
    max_load: usize,
}

pub struct Client {
    servers: Arc<HashMap<String, ServerInfo>>,
    groups: Arc<HashMap<String, Group>>,
    directory: Directory,
    verifiable: bool,
    state: parking_lot::Mutex<Option<ClientRound>>,
}

impl Client {
    pub fn new(
        servers: Arc<HashMap<String, ServerInfo>>,
        groups: Arc<HashMap<String, Group>>,
        directory: Directory,
        verifiable: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            servers,
            groups,
            directory,
            verifiable,
            state: parking_lot::Mutex::new(None),
        })
    }

    /// Create `num_users` virtual users for the round, assign them to
    /// group templates and register them with their mailboxes.
    pub async fn register_users(&self, round: u64, num_users: usize) -> anyhow::Result<()> {
        let templates = assignment::assignments(self.groups.as_ref());
        let (division, min_load) = simplex::optimal_division(self.groups.as_ref(), &templates)
            .context("load balancing failed")?;

        let mailbox_ids = self.directory.mailbox_ids();
        if mailbox_ids.is_empty() {
            bail!("no mailboxes configured");
        }
        let mailbox_spans = span::n_spans(num_users, mailbox_ids.len());

        let mut users = Vec::with_capacity(num_users);
        let mut by_key = HashMap::with_capacity(num_users);

        // partition the user list over templates in template order
        let mut end = 0usize;
        let mut template_of = vec![0usize; num_users];
        for (a, fraction) in division.iter().enumerate() {
            let start = end;
            let mut offset = (fraction * num_users as f64).ceil() as usize;
            if start + offset > num_users || a + 1 == division.len() {
                offset = num_users - start;
            }
            end = start + offset;
            for slot in template_of.iter_mut().take(end).skip(start) {
                *slot = a;
            }
        }

        for (i, slot) in template_of.iter().enumerate() {
            let secret = SecretKey::generate(&mut OsRng);
            let public = *secret.public_key().as_bytes();
            let mailbox = mailbox_spans
                .iter()
                .position(|s| i >= s.start && i < s.end)
                .map(|m| mailbox_ids[m].clone())
                .expect("mailbox spans cover all users");
            by_key.insert(public, i);
            users.push(UserState {
                secret,
                public,
                groups: templates[*slot].clone(),
                mailbox,
                message: Vec::new(),
            });
        }

        // register each mailbox's span with an independent key buffer
        for (m, s) in mailbox_spans.iter().enumerate() {
            let keys: Vec<[u8; USER_KEY_SIZE]> =
                users[s.start..s.end].iter().map(|u| u.public).collect();
            let expected: Vec<u64> = users[s.start..s.end]
                .iter()
                .map(|u| u.groups.len() as u64)
                .collect();
            let mailbox = self.directory.mailbox(&mailbox_ids[m])?;
            for chunk in span::stream_spans(keys.len(), STREAM_SIZE, USER_KEY_SIZE) {
                mailbox.register_users(
                    round,
                    &keys[chunk.start..chunk.end],
                    &expected[chunk.start..chunk.end],
                )?;
            }
        }

        let max_load = (min_load * num_users as f64).ceil() as usize + 1;
        info!(round, num_users, max_load, "users registered");
        *self.state.lock() = Some(ClientRound {
            round,
            users,
            by_key,
            ciphertexts: HashMap::new(),
            proofs: HashMap::new(),
            max_load,
        });
        Ok(())
    }

    /// Fetch each group's aggregate inner key and build every user's
    /// onion + envelope ciphertexts in parallel.
    pub async fn generate_messages(&self, round: u64, msg_size: usize) -> anyhow::Result<()> {
        let aggregates = self.aggregate_inner_keys(round)?;

        let onion_keys: HashMap<String, Vec<Point>> = self
            .groups
            .iter()
            .map(|(gid, group)| (gid.clone(), group_onion_keys(self.servers.as_ref(), group)))
            .collect();
        let rows: HashMap<String, u32> = self
            .groups
            .iter()
            .map(|(gid, group)| (gid.clone(), group.row))
            .collect();

        let mut state = self.state.lock();
        let state = state.as_mut().context("no users registered")?;
        if state.round != round {
            bail!("round mismatch");
        }

        for user in state.users.iter_mut() {
            let mut message = vec![0u8; msg_size];
            OsRng.fill_bytes(&mut message);
            user.message = message;
        }

        let verifiable = self.verifiable;
        let built: Vec<Vec<(String, Vec<u8>, Vec<u8>)>> = state
            .users
            .par_iter()
            .map(|user| {
                let recipient = PublicKey::from(user.public);
                user.groups
                    .iter()
                    .map(|gid| {
                        let sealed = mail::seal_mail(&recipient, &user.message).encode();
                        let inner =
                            envelope::encrypt(&aggregates[gid], &Nonce::envelope(round), &sealed);

                        let keys = &onion_keys[gid];
                        let auxs = vec![Vec::new(); keys.len()];
                        let nonces: Vec<Nonce> = (0..keys.len())
                            .map(|i| Nonce::new(round, rows[gid].into(), i as u64))
                            .collect();
                        let (ciphertext, proof) =
                            onion::encrypt(&inner, &auxs, &nonces, keys, verifiable);
                        (gid.clone(), ciphertext, proof.unwrap_or_default())
                    })
                    .collect()
            })
            .collect();

        let mut ciphertexts: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
        let mut proofs: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
        for per_user in built {
            for (gid, ciphertext, proof) in per_user {
                ciphertexts
                    .entry(gid.clone())
                    .or_insert_with(|| Vec::with_capacity(state.max_load))
                    .push(ciphertext);
                proofs
                    .entry(gid)
                    .or_insert_with(|| Vec::with_capacity(state.max_load))
                    .push(proof);
            }
        }
        state.ciphertexts = ciphertexts;
        state.proofs = proofs;
        debug!(round, "messages generated");
        Ok(())
    }

    fn aggregate_inner_keys(&self, round: u64) -> anyhow::Result<HashMap<String, Point>> {
        let mut aggregates = HashMap::new();
        for (gid, group) in self.groups.iter() {
            let mut keys = Vec::with_capacity(group.servers.len());
            for sid in &group.servers {
                let address = &self.servers[sid].address;
                let node = self.directory.node(address)?;
                let bytes = node.get_inner_key(sid, round)?;
                keys.push(decode_point(&bytes).context("inner key is not a curve point")?);
            }
            aggregates.insert(gid.clone(), envelope::aggregate_key(keys.iter()));
        }
        Ok(aggregates)
    }

    /// Submit each group's batch to every server of that group.
    pub async fn submit_messages(&self, round: u64) -> anyhow::Result<()> {
        let (ciphertexts, proofs) = {
            let mut state = self.state.lock();
            let state = state.as_mut().context("no users registered")?;
            if state.ciphertexts.is_empty() {
                bail!("messages not generated yet");
            }
            (
                std::mem::take(&mut state.ciphertexts),
                std::mem::take(&mut state.proofs),
            )
        };

        for (gid, batch) in &ciphertexts {
            let group = &self.groups[gid];
            let batch_proofs = &proofs[gid];
            let record_size = batch[0].len() + batch_proofs[0].len();

            for sid in &group.servers {
                let node = self.directory.node(&self.servers[sid].address)?;
                for chunk in span::stream_spans(batch.len(), STREAM_SIZE, record_size) {
                    node.submit_ciphertexts(
                        sid,
                        round,
                        batch[chunk.start..chunk.end].to_vec(),
                        batch_proofs[chunk.start..chunk.end].to_vec(),
                    )?;
                }
            }
        }
        debug!(round, "ciphertexts submitted");
        Ok(())
    }

    /// Download every user's inbox, verify counts and contents, and return
    /// the total number of delivered messages. Both the request and the
    /// response half of each mailbox exchange must succeed.
    pub async fn download_messages(&self, round: u64) -> anyhow::Result<usize> {
        let (keys_by_mailbox, expectations) = {
            let state = self.state.lock();
            let state = state.as_ref().context("no users registered")?;
            let mut keys_by_mailbox: HashMap<String, Vec<[u8; USER_KEY_SIZE]>> = HashMap::new();
            for user in &state.users {
                keys_by_mailbox
                    .entry(user.mailbox.clone())
                    .or_default()
                    .push(user.public);
            }
            let expectations: HashMap<[u8; USER_KEY_SIZE], usize> = state
                .users
                .iter()
                .map(|u| (u.public, u.groups.len()))
                .collect();
            (keys_by_mailbox, expectations)
        };

        let mut total = 0usize;
        for (mid, keys) in keys_by_mailbox {
            let mailbox = self.directory.mailbox(&mid)?;
            let chunks = mailbox.get_mails(round, &keys, STREAM_SIZE).await?;
            let inboxes: Vec<_> = chunks.into_iter().flatten().collect();
            if inboxes.len() != keys.len() {
                bail!("mailbox {mid} returned {} of {} inboxes", inboxes.len(), keys.len());
            }

            let state = self.state.lock();
            let state = state.as_ref().context("no users registered")?;
            for inbox in inboxes {
                let expected = expectations[&inbox.user_key];
                if inbox.messages.len() != expected {
                    bail!(
                        "user received {} of {} expected messages",
                        inbox.messages.len(),
                        expected
                    );
                }
                let user = &state.users[state.by_key[&inbox.user_key]];
                for body in &inbox.messages {
                    let opened = mail::open_mail(&user.secret, body)
                        .context("delivered mail failed to open")?;
                    if opened != user.message {
                        bail!("delivered mail does not match the sent message");
                    }
                    total += 1;
                }
            }
        }
        info!(round, total, "mail download complete");
        Ok(total)
    }

    /// Per-user expected delivery count, summed over the population.
    pub fn expected_deliveries(&self) -> usize {
        self.state
            .lock()
            .as_ref()
            .map(|s| s.users.iter().map(|u| u.groups.len()).sum())
            .unwrap_or(0)
    }
}
