use crate::error::MpcError;
use curv::arithmetic::{ Converter, Integer, Modulo };
use curv::elliptic::curves::{ Ed25519, Scalar, Secp256k1 };
use curv::BigInt;
use serde::{ Deserialize, Serialize };
use sha3::{ Digest, Keccak256 };
use shared::key_info::NodeId;

/// Which signature scheme a key belongs to. The string forms are fixed by
/// the request layer.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum KeyType {
    #[serde(rename = "EC256K1")]
    Ec256k1,
    #[serde(rename = "ED25519")]
    Ed25519,
}

impl KeyType {
    pub fn group_order(&self) -> BigInt {
        match self {
            KeyType::Ec256k1 => Scalar::<Secp256k1>::group_order().clone(),
            KeyType::Ed25519 => Scalar::<Ed25519>::group_order().clone(),
        }
    }
}

/// Deterministic party identifier: the node identity hashed twice and reduced
/// modulo the curve order. UIDs are totally ordered; the ordering fixes
/// Lagrange interpolation indices for the lifetime of a key.
pub fn uid_from_node_id(node_id: &NodeId, key_type: KeyType) -> BigInt {
    let first = Keccak256::digest(node_id.as_str().as_bytes());
    let second = Keccak256::digest(&first);
    BigInt::from_bytes(&second).mod_floor(&key_type.group_order())
}

/// An unordered set of nodes of size `n` with threshold `t`; a signing quorum
/// is `t + 1`. Immutable for the lifetime of a key.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Group {
    pub gid: String,
    pub nodes: Vec<NodeId>,
    pub threshold: usize,
}

impl Group {
    pub fn new(gid: String, nodes: Vec<NodeId>, threshold: usize) -> Result<Self, MpcError> {
        if nodes.is_empty() {
            return Err(MpcError::BadInput("group has no members".into()));
        }
        if threshold + 1 > nodes.len() {
            return Err(
                MpcError::BadInput(
                    format!("quorum {} exceeds group size {}", threshold + 1, nodes.len())
                )
            );
        }
        let mut deduped = nodes.clone();
        deduped.sort();
        deduped.dedup();
        if deduped.len() != nodes.len() {
            return Err(MpcError::BadInput("group contains duplicate nodes".into()));
        }
        Ok(Group { gid, nodes, threshold })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// UIDs of all members for the given curve, ascending. Fails when two
    /// members collide on the same UID.
    pub fn sorted_uids(&self, key_type: KeyType) -> Result<Vec<BigInt>, MpcError> {
        let mut uids: Vec<BigInt> = self.nodes
            .iter()
            .map(|n| uid_from_node_id(n, key_type))
            .collect();
        uids.sort();
        for pair in uids.windows(2) {
            if pair[0] == pair[1] {
                return Err(MpcError::BadInput("two group members derive the same uid".into()));
            }
        }
        Ok(uids)
    }
}

/// Position of `uid` in the ascending ordering of `ids`.
pub fn index_of(ids: &[BigInt], uid: &BigInt) -> Option<usize> {
    ids.iter().position(|id| id == uid)
}

/// Lagrange coefficient λ_i(S) evaluated at zero for the party with identity
/// `uid_i`, over the interpolation points in `ids`, mod `order`.
///
/// λ_i(S) = Π_{j≠i} uid_j / (uid_j − uid_i)
pub fn lagrange_coeff(ids: &[BigInt], uid_i: &BigInt, order: &BigInt) -> Result<BigInt, MpcError> {
    let mut num = BigInt::from(1);
    let mut den = BigInt::from(1);
    for uid_j in ids {
        if uid_j == uid_i {
            continue;
        }
        num = BigInt::mod_mul(&num, uid_j, order);
        let diff = BigInt::mod_sub(uid_j, uid_i, order);
        den = BigInt::mod_mul(&den, &diff, order);
    }
    let den_inv = BigInt::mod_inv(&den, order).ok_or_else(|| {
        MpcError::InternalInvariantViolated("lagrange denominator not invertible".into())
    })?;
    Ok(BigInt::mod_mul(&num, &den_inv, order))
}

#[cfg(test)]
mod tests {
    use super::*;
    use curv::arithmetic::Samplable;

    fn node(s: &str) -> NodeId {
        NodeId::new(s.to_string())
    }

    #[test]
    fn uids_are_deterministic_and_curve_bound() {
        let n = node("node-a");
        let a1 = uid_from_node_id(&n, KeyType::Ec256k1);
        let a2 = uid_from_node_id(&n, KeyType::Ec256k1);
        assert_eq!(a1, a2);
        assert!(a1 < Scalar::<Secp256k1>::group_order().clone());

        let e = uid_from_node_id(&n, KeyType::Ed25519);
        assert!(e < Scalar::<Ed25519>::group_order().clone());
    }

    #[test]
    fn group_rejects_duplicates_and_bad_quorum() {
        assert!(Group::new("g".into(), vec![node("a"), node("a")], 1).is_err());
        assert!(Group::new("g".into(), vec![node("a"), node("b")], 2).is_err());
        assert!(Group::new("g".into(), vec![node("a"), node("b"), node("c")], 1).is_ok());
    }

    #[test]
    fn lagrange_reconstructs_shamir_secret() {
        // f(x) = s + a1*x over random evaluation points; any two points must
        // reconstruct s at zero.
        let q = Scalar::<Secp256k1>::group_order().clone();
        let s = BigInt::sample_below(&q);
        let a1 = BigInt::sample_below(&q);

        let ids: Vec<BigInt> = (0..3).map(|_| BigInt::sample_below(&q)).collect();
        let eval = |x: &BigInt| BigInt::mod_add(&s, &BigInt::mod_mul(&a1, x, &q), &q);

        for pair in [[0usize, 1], [0, 2], [1, 2]] {
            let subset = vec![ids[pair[0]].clone(), ids[pair[1]].clone()];
            let mut acc = BigInt::from(0);
            for uid in &subset {
                let lambda = lagrange_coeff(&subset, uid, &q).unwrap();
                acc = BigInt::mod_add(&acc, &BigInt::mod_mul(&lambda, &eval(uid), &q), &q);
            }
            assert_eq!(acc, s);
        }
    }
}
