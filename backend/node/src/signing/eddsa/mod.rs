pub mod messages;
pub mod rounds;

use crate::error::{ MpcError, MpcResult };
use crate::keygen::eddsa::EdKeygenSaveData;
use crate::party::{ index_of, lagrange_coeff };
use crate::serdes::{ ed_point, ed_scalar };
use curv::arithmetic::Converter;
use curv::elliptic::curves::{ Ed25519, Point, Scalar };
use curv::BigInt;
use serde::{ Deserialize, Serialize };
use sha2::{ Digest, Sha512 };

pub use rounds::EdSignRound;

/// Aggregated threshold Schnorr signature. `to_bytes` yields the standard
/// 64-byte Ed25519 wire form (`R || s`, both little-endian), verifiable by
/// any stock Ed25519 implementation.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct EdSignature {
    #[serde(with = "ed_point")]
    pub r: Point<Ed25519>,
    #[serde(with = "ed_scalar")]
    pub s: Scalar<Ed25519>,
}

impl EdSignature {
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.r.to_bytes(true));
        out[32..].copy_from_slice(&crate::serdes::ed_scalar::to_le_bytes(&self.s));
        out
    }
}

/// Session-immutable signing inputs.
pub struct EdSignContext {
    pub save: EdKeygenSaveData,
    /// Sorted UIDs of the signing quorum, `t + 1` of them.
    pub sign_ids: Vec<BigInt>,
    pub message: Vec<u8>,
}

impl EdSignContext {
    pub fn keygen_index(&self, j: usize) -> MpcResult<usize> {
        let uid = self.sign_ids.get(j).ok_or_else(|| {
            MpcError::InternalInvariantViolated("signing index out of range".into())
        })?;
        index_of(&self.save.ids, uid).ok_or_else(|| {
            MpcError::BadInput(format!("uid {} holds no share of this key", uid.to_str_radix(16)))
        })
    }

    pub fn lagrange_for(&self, j: usize) -> MpcResult<Scalar<Ed25519>> {
        let order = Scalar::<Ed25519>::group_order();
        let lambda = lagrange_coeff(&self.sign_ids, &self.sign_ids[j], order)?;
        Ok(Scalar::from_bigint(&lambda))
    }
}

/// The Ed25519 challenge scalar `k = SHA512(R || A || M) mod ℓ`, with the
/// 64-byte digest interpreted little-endian exactly as standard verifiers
/// do.
pub fn challenge_scalar(
    big_r: &Point<Ed25519>,
    pk: &Point<Ed25519>,
    message: &[u8]
) -> Scalar<Ed25519> {
    let digest = Sha512::new()
        .chain(&*big_r.to_bytes(true))
        .chain(&*pk.to_bytes(true))
        .chain(message)
        .finalize();
    let le: Vec<u8> = digest.iter().rev().cloned().collect();
    let order = Scalar::<Ed25519>::group_order();
    use curv::arithmetic::Integer;
    Scalar::from_bigint(&BigInt::from_bytes(&le).mod_floor(order))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_matches_dalek_verification() {
        // s = r + k * d with a single party degenerates to plain Ed25519
        // (up to the deterministic-nonce convention, which verification
        // does not care about).
        let d = Scalar::<Ed25519>::random();
        let pk = Point::generator() * &d;
        let nonce = Scalar::<Ed25519>::random();
        let big_r = Point::generator() * &nonce;
        let message = b"ed25519 challenge test";

        let k = challenge_scalar(&big_r, &pk, message);
        let s = &nonce + &(&k * &d);
        let sig = EdSignature { r: big_r, s };

        let dalek_pk = ed25519_dalek::PublicKey::from_bytes(&pk.to_bytes(true)).unwrap();
        let dalek_sig = ed25519_dalek::Signature::from_bytes(&sig.to_bytes()).unwrap();
        use ed25519_dalek::Verifier;
        assert!(dalek_pk.verify(message, &dalek_sig).is_ok());
    }
}
