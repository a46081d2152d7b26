pub mod messages;
pub mod rounds;

use crate::error::{ MpcError, MpcResult };
use crate::keygen::ecdsa::KeygenSaveData;
use crate::party::{ index_of, lagrange_coeff };
use crate::serdes::dec_vec;
use curv::arithmetic::Converter;
use curv::elliptic::curves::{ Point, Scalar, Secp256k1 };
use curv::BigInt;
use serde::{ Deserialize, Serialize };

pub use rounds::EcdsaSignRound;

/// Final threshold signature with the recovery id derived from the parity of
/// `R.y` (and flipped when `s` is normalized to the low half).
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SignatureRecid {
    pub r: Scalar<Secp256k1>,
    pub s: Scalar<Secp256k1>,
    pub recid: u8,
}

/// Message-independent material produced by rounds 1..6. A cached tuple lets
/// a later request sign with a single broadcast round.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct PreSignData {
    pub k_i: Scalar<Secp256k1>,
    pub sigma_i: Scalar<Secp256k1>,
    pub r: Scalar<Secp256k1>,
    pub big_r: Point<Secp256k1>,
    #[serde(with = "dec_vec")]
    pub sign_ids: Vec<BigInt>,
    pub own_index: usize,
}

/// What a signing session hands back: a signature, or a presign tuple when
/// no message hash was supplied.
#[derive(Clone, Debug)]
pub enum SignOutput {
    Signature(SignatureRecid),
    PreSign(PreSignData),
}

/// Session-immutable signing inputs.
pub struct SignContext {
    pub save: KeygenSaveData,
    /// Sorted UIDs of the signing quorum, `t + 1` of them.
    pub sign_ids: Vec<BigInt>,
    /// `None` runs a presign session that stops after round 6.
    pub msg_hash: Option<BigInt>,
}

impl SignContext {
    /// Keygen-table index of the signer at signing position `j`.
    pub fn keygen_index(&self, j: usize) -> MpcResult<usize> {
        let uid = self.sign_ids.get(j).ok_or_else(|| {
            MpcError::InternalInvariantViolated("signing index out of range".into())
        })?;
        index_of(&self.save.ids, uid).ok_or_else(|| {
            MpcError::BadInput(format!("uid {} holds no share of this key", uid.to_str_radix(16)))
        })
    }

    /// Additive share of the private key for signing position `j`:
    /// `w_j = sk_u_j * λ_j(S)`. Only `j == own` yields the secret; this
    /// computes the coefficient alone.
    pub fn lagrange_for(&self, j: usize) -> MpcResult<Scalar<Secp256k1>> {
        let order = Scalar::<Secp256k1>::group_order();
        let lambda = lagrange_coeff(&self.sign_ids, &self.sign_ids[j], order)?;
        Ok(Scalar::from_bigint(&lambda))
    }

    /// Public image `W_j = λ_j(S) * x_j * G`, computable by every signer
    /// from the keygen VSS commitments.
    pub fn public_w(&self, j: usize) -> MpcResult<Point<Secp256k1>> {
        let uid = &self.sign_ids[j];
        let mut x_point = Point::<Secp256k1>::zero();
        for commits in &self.save.vss_commits {
            x_point = x_point + commits.public_share(uid);
        }
        Ok(x_point * self.lagrange_for(j)?)
    }
}

/// Big-endian 32-byte encoding of a scalar, for compact signatures and
/// message digests.
pub fn scalar_to_32_bytes(s: &Scalar<Secp256k1>) -> [u8; 32] {
    let raw = s.to_bigint().to_bytes();
    let mut out = [0u8; 32];
    out[32 - raw.len()..].copy_from_slice(&raw);
    out
}
