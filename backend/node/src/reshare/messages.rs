use crate::crypto::ntilde::NtildeWithProofs;
use crate::crypto::paillier::{ PublicKey, ZkFactProof };
use crate::crypto::vss::FeldmanCommitments;
use crate::serdes::dec;
use curv::elliptic::curves::{ Point, Scalar, Secp256k1 };
use curv::BigInt;
use serde::{ Deserialize, Serialize };

/// Round-typed payloads of the reshare protocol.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub enum ReshareMessage {
    R0(ReshareRound0Message),
    R1(ReshareRound1Message),
    R2(ReshareRound2Message),
    R3(ReshareRound3Message),
    R4(ReshareRound4Message),
}

/// Presence over the union of both committees.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ReshareRound0Message {
    #[serde(with = "dec")]
    pub uid: BigInt,
    pub old_node: bool,
}

/// Old-committee broadcast: Feldman commitments to the polynomial sharing
/// the Lagrange-weighted old share.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ReshareRound1Message {
    pub commitments: FeldmanCommitments<Secp256k1>,
}

/// Old-to-new unicast share `f_i(uid_j)`.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ReshareRound2Message {
    pub share: Scalar<Secp256k1>,
}

/// New-committee broadcast: regenerated Paillier and Ntilde material with
/// proofs, exactly as in keygen round 1.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ReshareRound3Message {
    pub paillier_pk: PublicKey,
    pub ntilde: NtildeWithProofs,
    pub fact_proof: ZkFactProof,
}

/// The reconstructed public key as each party computed it.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ReshareRound4Message {
    pub pk: Point<Secp256k1>,
}
