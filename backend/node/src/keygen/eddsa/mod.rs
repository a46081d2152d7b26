pub mod messages;
pub mod rounds;

use crate::crypto::vss::FeldmanCommitments;
use crate::serdes::{ dec_vec, ed_point, ed_scalar };
use curv::elliptic::curves::{ Ed25519, Point, Scalar };
use curv::BigInt;
use serde::{ Deserialize, Serialize };
use shared::key_info::NodeId;
use std::collections::BTreeMap;

pub use rounds::EdKeygenRound;

/// Persisted outcome of an Ed25519 keygen. No Paillier or Ntilde material:
/// threshold Schnorr needs only the share, the key and the VSS commitments.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct EdKeygenSaveData {
    #[serde(with = "ed_scalar")]
    pub sk_u: Scalar<Ed25519>,
    #[serde(with = "ed_point")]
    pub pk: Point<Ed25519>,
    pub vss_commits: Vec<FeldmanCommitments<Ed25519>>,
    #[serde(with = "dec_vec")]
    pub ids: Vec<BigInt>,
    pub cur_index: usize,
    pub threshold: usize,
    pub uid_to_node: BTreeMap<String, NodeId>,
}

/// Session-immutable inputs shared by every round.
pub struct EdKeygenContext {
    pub ids: Vec<BigInt>,
    pub uid_to_node: BTreeMap<String, NodeId>,
}
