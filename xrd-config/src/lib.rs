//! Deployment configuration: server identities and key material, shuffle
//! groups, cross-group assignment templates and the load-balancing LP.

pub mod assignment;
pub mod simplex;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use xrd_crypto::point::{self, Point, Scalar, POINT_SIZE, SCALAR_SIZE};

/// Upper bound on the payload bytes of one streamed chunk.
pub const STREAM_SIZE: usize = 1 << 22;

/// One logical mix server: identity, network placement, and its per-round
/// key material. The mix key is the ECIES recipient for the onion layer at
/// this server's cascade position; the blind key re-randomizes headers in
/// the verifiable variant.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub address: String,
    #[serde_as(as = "serde_with::Bytes")]
    pub mix_public: [u8; POINT_SIZE],
    pub mix_secret: [u8; SCALAR_SIZE],
    /// Accumulated blind point `b_i · b_{i-1} · … · G`.
    #[serde_as(as = "serde_with::Bytes")]
    pub blind_public: [u8; POINT_SIZE],
    pub blind_secret: [u8; SCALAR_SIZE],
}

/// An ordered cascade of server identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub gid: String,
    pub row: u32,
    pub servers: Vec<String>,
}

/// Generate the configuration for one group of `addrs.len()` servers at the
/// given row. In verifiable mode, mix and blind keys are chained: both are
/// generated over the predecessor's accumulated blind point, so a server
/// can open its onion layer on a header that every predecessor has blinded.
pub fn create_group(
    row: u32,
    addrs: &[String],
    verifiable: bool,
) -> (HashMap<String, ServerInfo>, Group) {
    let gid = format!("group:{row}");
    let mut servers = HashMap::new();
    let mut ids = Vec::with_capacity(addrs.len());

    let mut base = point::generator();
    for (i, addr) in addrs.iter().enumerate() {
        let id = format!("server:({row},{i})");
        let (mix_secret, mix_public) = point::keypair_with_base(&base);
        let (blind_secret, blind_public) = if verifiable {
            point::keypair_with_base(&base)
        } else {
            (Scalar::from(1u64), base)
        };
        base = blind_public;

        servers.insert(
            id.clone(),
            ServerInfo {
                id: id.clone(),
                address: addr.clone(),
                mix_public: point::encode_point(&mix_public),
                mix_secret: point::encode_scalar(&mix_secret),
                blind_public: point::encode_point(&blind_public),
                blind_secret: point::encode_scalar(&blind_secret),
            },
        );
        ids.push(id);
    }

    (
        servers,
        Group {
            gid,
            row,
            servers: ids,
        },
    )
}

/// Generate a full deployment: `rows.len()` groups over the given address
/// lists.
pub fn create_groups(
    rows: &[Vec<String>],
    verifiable: bool,
) -> (HashMap<String, ServerInfo>, HashMap<String, Group>) {
    let mut servers = HashMap::new();
    let mut groups = HashMap::new();
    for (row, addrs) in rows.iter().enumerate() {
        let (s, g) = create_group(row as u32, addrs, verifiable);
        servers.extend(s);
        groups.insert(g.gid.clone(), g);
    }
    (servers, groups)
}

/// The onion recipient keys of a group, in cascade order.
pub fn group_onion_keys(
    servers: &HashMap<String, ServerInfo>,
    group: &Group,
) -> Vec<Point> {
    group
        .servers
        .iter()
        .map(|sid| {
            point::decode_point(&servers[sid].mix_public).expect("configured key is a curve point")
        })
        .collect()
}

/// The accumulated blind points of a group, in cascade order.
pub fn group_blind_keys(
    servers: &HashMap<String, ServerInfo>,
    group: &Group,
) -> Vec<[u8; POINT_SIZE]> {
    group
        .servers
        .iter()
        .map(|sid| servers[sid].blind_public)
        .collect()
}

impl ServerInfo {
    pub fn mix_keypair(&self) -> (Scalar, Point) {
        (
            point::decode_scalar(&self.mix_secret),
            point::decode_point(&self.mix_public).expect("configured key is a curve point"),
        )
    }

    pub fn blind_scalar(&self) -> Scalar {
        point::decode_scalar(&self.blind_secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xrd_crypto::point::{decode_point, decode_scalar};

    #[test]
    fn chained_blind_keys_accumulate() {
        let addrs: Vec<String> = (0..4).map(|i| format!("localhost:{}", 8000 + i)).collect();
        let (servers, group) = create_group(0, &addrs, true);

        // A_i = b_i · A_{i-1}
        let mut acc = point::generator();
        for sid in &group.servers {
            let info = &servers[sid];
            acc = acc * decode_scalar(&info.blind_secret);
            assert_eq!(decode_point(&info.blind_public).unwrap(), acc);
        }
    }

    #[test]
    fn non_verifiable_groups_use_unit_blinds() {
        let addrs: Vec<String> = (0..3).map(|i| format!("localhost:{}", 8000 + i)).collect();
        let (servers, group) = create_group(1, &addrs, false);
        for sid in &group.servers {
            assert_eq!(decode_scalar(&servers[sid].blind_secret), Scalar::from(1u64));
        }
    }

    #[test]
    fn deployment_layout() {
        let rows = vec![
            vec!["a:1".to_string(), "a:2".to_string()],
            vec!["b:1".to_string(), "b:2".to_string()],
        ];
        let (servers, groups) = create_groups(&rows, true);
        assert_eq!(groups.len(), 2);
        assert_eq!(servers.len(), 4);
        for group in groups.values() {
            assert_eq!(group_onion_keys(&servers, group).len(), 2);
        }
    }
}
