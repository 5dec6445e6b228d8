//! Round driver: sequences the lifecycle across mailboxes, clients and
//! mix nodes. Any failure along the way fails the round; recovery is a
//! fresh round id.

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinSet;
use tracing::info;

use xrd_util::span;

use crate::client::Client;
use crate::node::{Directory, MixNode};

pub struct Coordinator {
    directory: Directory,
    nodes: Vec<MixNode>,
    clients: Vec<Arc<Client>>,
}

impl Coordinator {
    pub fn new(directory: Directory, nodes: Vec<MixNode>, clients: Vec<Arc<Client>>) -> Self {
        Self {
            directory,
            nodes,
            clients,
        }
    }

    /// Open the round: mailboxes first, then user registration, then the
    /// mix servers (whose setup reads the mailbox rosters).
    pub async fn new_round(&self, round: u64, num_users: usize) -> anyhow::Result<()> {
        anyhow::ensure!(
            num_users >= self.clients.len(),
            "need at least one user per client"
        );
        for mid in self.directory.mailbox_ids() {
            self.directory.mailbox(&mid)?.new_round(round)?;
        }

        let spans = span::n_spans(num_users, self.clients.len());
        let mut tasks = JoinSet::new();
        for (client, s) in self.clients.iter().zip(&spans) {
            let client = client.clone();
            let count = s.len();
            tasks.spawn(async move { client.register_users(round, count).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.context("registration task")??;
        }

        let mut tasks = JoinSet::new();
        for node in &self.nodes {
            let node = node.clone();
            tasks.spawn(async move { node.new_round(round).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.context("server setup task")??;
        }
        info!(round, num_users, "round opened");
        Ok(())
    }

    pub async fn generate_messages(&self, round: u64, msg_size: usize) -> anyhow::Result<()> {
        let mut tasks = JoinSet::new();
        for client in &self.clients {
            let client = client.clone();
            tasks.spawn(async move { client.generate_messages(round, msg_size).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.context("generation task")??;
        }
        Ok(())
    }

    pub async fn submit_messages(&self, round: u64) -> anyhow::Result<()> {
        let mut tasks = JoinSet::new();
        for client in &self.clients {
            let client = client.clone();
            tasks.spawn(async move { client.submit_messages(round).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.context("submission task")??;
        }
        Ok(())
    }

    /// Kick every node's cascades off concurrently; a first-in-cascade
    /// server only mixes once its whole group has confirmed readiness, so
    /// the nodes must start together.
    pub async fn start_round(&self, round: u64) -> anyhow::Result<()> {
        let mut tasks = JoinSet::new();
        for node in &self.nodes {
            let node = node.clone();
            tasks.spawn(async move { node.start_round(round).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.context("start task")??;
        }
        Ok(())
    }

    /// Wait for every client's mail to arrive and verify it; returns the
    /// total number of delivered messages.
    pub async fn download_messages(&self, round: u64) -> anyhow::Result<usize> {
        let mut tasks = JoinSet::new();
        for client in &self.clients {
            let client = client.clone();
            tasks.spawn(async move { client.download_messages(round).await });
        }
        let mut total = 0;
        while let Some(joined) = tasks.join_next().await {
            total += joined.context("download task")??;
        }
        Ok(total)
    }

    /// Close the round everywhere, joining delivery tasks and purging all
    /// per-round state.
    pub async fn end_round(&self, round: u64) -> anyhow::Result<()> {
        for node in &self.nodes {
            node.end_round(round).await?;
        }
        for mid in self.directory.mailbox_ids() {
            self.directory.mailbox(&mid)?.end_round(round)?;
        }
        info!(round, "round closed");
        Ok(())
    }

    /// Run one full round and return the number of delivered messages.
    pub async fn run_round(
        &self,
        round: u64,
        num_users: usize,
        msg_size: usize,
    ) -> anyhow::Result<usize> {
        self.new_round(round, num_users).await?;
        self.generate_messages(round, msg_size).await?;
        self.submit_messages(round).await?;
        self.start_round(round).await?;
        let delivered = self.download_messages(round).await?;
        self.end_round(round).await?;
        Ok(delivered)
    }
}
