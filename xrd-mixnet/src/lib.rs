//! The mixing core of XRD: the per-server mix engine that decrypts, blinds
//! and shuffles one onion layer per round with a NIZK shuffle proof, and
//! the envelope verifier that threshold-releases the aggregate ElGamal key
//! once every shuffle proof has been accepted.

pub mod error;
pub mod mix;
pub mod verifier;

pub use error::MixError;
pub use mix::{MixEngine, RoundConfig};
pub use verifier::Verifier;
