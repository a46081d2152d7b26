use anyhow::Context;
use anyhow::Result;
use derive_more::Display;
use serde::{ Deserialize, Serialize };
use uuid::Uuid;

/// Long-term transport identity of a node. Party UIDs are derived from it by
/// the protocol core; the acceptance layer only ever sees this string form.
#[derive(Clone, Serialize, Deserialize, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl TryFrom<NodeId> for Uuid {
    type Error = anyhow::Error;

    fn try_from(value: NodeId) -> Result<Self> {
        value.0.parse().context("node_id should be valid uuid")
    }
}

impl NodeId {
    pub fn new(str: String) -> Self {
        NodeId(str)
    }

    pub fn new_from_uuid(str: Uuid) -> Self {
        NodeId(str.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct KeyInfo {
    #[serde(flatten)]
    pub kind: Key,
    pub node_pool: Vec<NodeId>,
    pub threshold: usize,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(tag = "key_type")]
pub enum Key {
    ECDSA {
        pub_key: PubKeyCoords,
    },
    EDDSA {
        pub_key: String,
    },
}

/// Affine coordinates of a secp256k1 public point, hex encoded.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct PubKeyCoords {
    pub x: String,
    pub y: String,
}
