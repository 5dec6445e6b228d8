//! Per-round recipient mailboxes.
//!
//! A round registers every user key together with the number of deliveries
//! to expect (one per group the user was assigned to). Deliveries append to
//! the user's inbox and count down; reads block until the expected count is
//! reached. The countdown is the only synchronization between deliverers
//! and readers; inboxes are multisets, no ordering is promised.

pub mod mail;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;
use xrd_util::gate::{Aborted, Gate};

pub use mail::{open_mail, seal_mail, Mail, MailError, USER_KEY_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum MailboxError {
    #[error("round {0} not initialized")]
    RoundNotInitialized(u64),
    #[error("round {0} already exists")]
    RoundExists(u64),
    #[error("user key not registered")]
    UserNotRegistered,
    #[error("round aborted")]
    RoundAborted,
}

impl From<Aborted> for MailboxError {
    fn from(_: Aborted) -> Self {
        MailboxError::RoundAborted
    }
}

/// One user's inbox together with the requesting key.
#[derive(Debug, Clone)]
pub struct Inbox {
    pub user_key: [u8; USER_KEY_SIZE],
    pub messages: Vec<Vec<u8>>,
}

#[derive(Default)]
struct UserSlot {
    messages: Vec<Vec<u8>>,
    expected: Option<Arc<Gate>>,
}

struct RoundState {
    inboxes: RwLock<HashMap<[u8; USER_KEY_SIZE], UserSlot>>,
}

/// A mailbox server hosting one inbox map per round.
#[derive(Default)]
pub struct Mailbox {
    states: RwLock<HashMap<u64, Arc<RoundState>>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_round(&self, round: u64) -> Result<(), MailboxError> {
        let mut states = self.states.write();
        if states.contains_key(&round) {
            return Err(MailboxError::RoundExists(round));
        }
        states.insert(
            round,
            Arc::new(RoundState {
                inboxes: RwLock::new(HashMap::new()),
            }),
        );
        Ok(())
    }

    /// Drop the round. Blocked readers of unfinished inboxes observe
    /// `RoundAborted`.
    pub fn end_round(&self, round: u64) -> Result<(), MailboxError> {
        let state = self
            .states
            .write()
            .remove(&round)
            .ok_or(MailboxError::RoundNotInitialized(round))?;
        for slot in state.inboxes.read().values() {
            if let Some(gate) = &slot.expected {
                gate.abort();
            }
        }
        Ok(())
    }

    fn state(&self, round: u64) -> Result<Arc<RoundState>, MailboxError> {
        self.states
            .read()
            .get(&round)
            .cloned()
            .ok_or(MailboxError::RoundNotInitialized(round))
    }

    /// Register user keys with their expected delivery counts.
    pub fn register_users(
        &self,
        round: u64,
        keys: &[[u8; USER_KEY_SIZE]],
        expected: &[u64],
    ) -> Result<(), MailboxError> {
        debug_assert_eq!(keys.len(), expected.len());
        let state = self.state(round)?;
        let mut inboxes = state.inboxes.write();
        for (key, count) in keys.iter().zip(expected) {
            inboxes.insert(
                *key,
                UserSlot {
                    messages: Vec::with_capacity(*count as usize),
                    expected: Some(Arc::new(Gate::new(*count as usize))),
                },
            );
        }
        Ok(())
    }

    /// The roster of registered user keys for the round.
    pub fn registered_users(&self, round: u64) -> Result<Vec<[u8; USER_KEY_SIZE]>, MailboxError> {
        let state = self.state(round)?;
        let keys = state.inboxes.read().keys().copied().collect();
        Ok(keys)
    }

    /// Append deliveries. Each mail counts against its recipient's expected
    /// count; unknown recipients fail the batch.
    pub fn deliver_mails(&self, round: u64, mails: Vec<Mail>) -> Result<(), MailboxError> {
        let state = self.state(round)?;
        let mut inboxes = state.inboxes.write();
        for mail in mails {
            let slot = inboxes
                .get_mut(&mail.user_key)
                .ok_or(MailboxError::UserNotRegistered)?;
            slot.messages.push(mail.message);
            if let Some(gate) = &slot.expected {
                gate.arrive();
            }
        }
        Ok(())
    }

    /// Fetch the inboxes for `keys`, blocking per key until its expected
    /// count has been delivered. The result is framed into chunks bounded
    /// by `stream_size` bytes; chunk sizes are derived from each inbox's
    /// actual size.
    pub async fn get_mails(
        &self,
        round: u64,
        keys: &[[u8; USER_KEY_SIZE]],
        stream_size: usize,
    ) -> Result<Vec<Vec<Inbox>>, MailboxError> {
        let state = self.state(round)?;

        // collect the gates first so no lock is held across awaits
        let mut gates = Vec::with_capacity(keys.len());
        {
            let inboxes = state.inboxes.read();
            for key in keys {
                let slot = inboxes.get(key).ok_or(MailboxError::UserNotRegistered)?;
                gates.push(slot.expected.clone());
            }
        }
        for gate in gates.into_iter().flatten() {
            gate.wait().await?;
        }

        let inboxes = state.inboxes.read();
        let mut out: Vec<Vec<Inbox>> = Vec::new();
        let mut chunk: Vec<Inbox> = Vec::new();
        let mut chunk_bytes = 0usize;
        for key in keys {
            let slot = inboxes.get(key).ok_or(MailboxError::UserNotRegistered)?;
            let size: usize = slot.messages.iter().map(Vec::len).sum();
            if !chunk.is_empty() && chunk_bytes + size > stream_size {
                out.push(std::mem::take(&mut chunk));
                chunk_bytes = 0;
            }
            chunk.push(Inbox {
                user_key: *key,
                messages: slot.messages.clone(),
            });
            chunk_bytes += size;
        }
        if !chunk.is_empty() {
            out.push(chunk);
        }
        debug!(round, keys = keys.len(), chunks = out.len(), "mailbox read");
        Ok(out)
    }
}
