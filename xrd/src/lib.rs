//! XRD: anonymous messaging through a verifiable mix-net.
//!
//! A round collects one message per registered user, routes each through
//! the shuffle cascades its sender was assigned to, and delivers the
//! recovered plaintexts to recipient mailboxes. [`node::MixNode`] hosts the
//! mix engines and envelope verifiers of one address and runs the
//! inter-server choreography; [`client::Client`] synthesizes user traffic;
//! [`coordinator::Coordinator`] drives the round lifecycle.

pub mod client;
pub mod coordinator;
pub mod node;

pub use client::Client;
pub use coordinator::Coordinator;
pub use node::{Directory, MixNode, NodeError, NodeOptions, Source};
