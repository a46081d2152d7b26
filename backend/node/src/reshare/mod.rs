pub mod messages;
pub mod rounds;

use crate::crypto::primes::SafePrimePool;
use crate::keygen::ecdsa::KeygenSaveData;
use curv::elliptic::curves::{ Point, Secp256k1 };
use curv::BigInt;
use shared::key_info::NodeId;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use rounds::ReshareRound;

/// Session-immutable reshare inputs. A party acts as an old node (it holds
/// `old_save`), a fresh node, or both when it sits in both committees.
pub struct ReshareContext {
    /// Present iff this party is part of the participating old quorum.
    pub old_save: Option<KeygenSaveData>,
    /// Sorted UIDs of the old-committee quorum running the reshare,
    /// `t_old + 1` of them.
    pub old_ids: Vec<BigInt>,
    /// Sorted UIDs of the new committee.
    pub new_ids: Vec<BigInt>,
    /// Sorted union of both; the presence round runs over this set.
    pub union_ids: Vec<BigInt>,
    pub new_threshold: usize,
    /// The key being reshared; the output must reproduce it bit-identically.
    pub expected_pk: Point<Secp256k1>,
    pub uid_to_node: BTreeMap<String, NodeId>,
    pub pool: Arc<SafePrimePool>,
}

impl ReshareContext {
    pub fn is_old(&self, uid: &BigInt) -> bool {
        self.old_ids.contains(uid)
    }

    pub fn is_new(&self, uid: &BigInt) -> bool {
        self.new_ids.contains(uid)
    }
}

/// What a reshare session emits: the fresh share record for new-committee
/// members, nothing for parties that only served as share donors.
pub type ReshareOutput = Option<KeygenSaveData>;
