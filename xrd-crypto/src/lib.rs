//! Cryptographic primitives of the XRD mix-net: P-256 point and scalar
//! codecs, Schnorr and Chaum-Pedersen NIZKs, the authenticated symmetric
//! seal used inside onion layers, the onion codec itself, the aggregate
//! ElGamal envelope cipher, and the Fisher-Yates shuffler.

pub mod envelope;
pub mod nizk;
pub mod onion;
pub mod point;
pub mod seal;
pub mod shuffle;

pub use point::{Nonce, Point, PointError, Scalar, NONCE_SIZE, POINT_SIZE, SCALAR_SIZE};
pub use seal::{SealError, SEAL_OVERHEAD};
