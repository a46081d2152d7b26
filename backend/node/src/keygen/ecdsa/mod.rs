pub mod messages;
pub mod rounds;

use crate::crypto::ntilde::NtildeH1H2;
use crate::crypto::paillier;
use crate::crypto::primes::SafePrimePool;
use crate::crypto::vss::FeldmanCommitments;
use crate::serdes::dec_vec;
use curv::elliptic::curves::{ Point, Scalar, Secp256k1 };
use curv::BigInt;
use serde::{ Deserialize, Serialize };
use shared::key_info::NodeId;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use rounds::EcdsaKeygenRound;

/// Everything a party persists after a successful keygen. One record of this
/// shape per key id lands in the `pubkey_data` table; all signing and
/// resharing starts from it.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct KeygenSaveData {
    pub sk_u: Scalar<Secp256k1>,
    pub pk: Point<Secp256k1>,
    pub paillier_sk: paillier::PrivateKey,
    pub paillier_pks: Vec<paillier::PublicKey>,
    pub ntilde: Vec<NtildeH1H2>,
    pub vss_commits: Vec<FeldmanCommitments<Secp256k1>>,
    #[serde(with = "dec_vec")]
    pub ids: Vec<BigInt>,
    pub cur_index: usize,
    pub threshold: usize,
    /// Decimal UID -> transport identity, for addressing peers in later
    /// sessions of the same key.
    pub uid_to_node: BTreeMap<String, NodeId>,
}

impl KeygenSaveData {
    pub fn node_for_uid(&self, uid: &BigInt) -> Option<&NodeId> {
        use curv::arithmetic::Converter;
        self.uid_to_node.get(&uid.to_str_radix(10))
    }
}

/// Session-immutable inputs shared by every keygen round.
pub struct KeygenContext {
    /// Sorted UIDs of the whole group; fixed by the request, confirmed by the
    /// presence round.
    pub ids: Vec<BigInt>,
    pub uid_to_node: BTreeMap<String, NodeId>,
    pub pool: Arc<SafePrimePool>,
}
