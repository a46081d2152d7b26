use crate::crypto::commit::{ Commitment, Decommitment };
use crate::crypto::ntilde::NtildeWithProofs;
use crate::crypto::paillier::{ PublicKey, ZkFactProof };
use crate::crypto::vss::FeldmanCommitments;
use crate::serdes::dec;
use curv::cryptographic_primitives::proofs::sigma_dlog::DLogProof;
use curv::elliptic::curves::{ Point, Scalar, Secp256k1 };
use curv::BigInt;
use serde::{ Deserialize, Serialize };
use sha2::Sha256;

/// Round-typed payloads of the ECDSA keygen protocol. The wire round number
/// fixes which variant a payload may decode into; `can_accept` enforces the
/// broadcast/unicast discipline per variant.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub enum KeygenMessage {
    R0(KGRound0Message),
    R1(KGRound1Message),
    R2Share(KGRound2Message1),
    R2Commit(KGRound2Message2),
    R3(KGRound3Message),
    R4(KGRound4Message),
    R5(KGRound5Message),
    R6(KGRound6Message),
}

/// Presence broadcast pinning down the participant set.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct KGRound0Message {
    #[serde(with = "dec")]
    pub uid: BigInt,
}

/// Paillier public key, Ntilde triple with both DLN proofs, proof of
/// knowledge of the Paillier factorization, and the commitment to `u_i * G`.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct KGRound1Message {
    pub paillier_pk: PublicKey,
    pub ntilde: NtildeWithProofs,
    pub fact_proof: ZkFactProof,
    pub commitment: Commitment,
}

/// Unicast Feldman share `f_i(uid_j)`.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct KGRound2Message1 {
    pub share: Scalar<Secp256k1>,
}

/// Broadcast Feldman coefficient commitments `{A_k}`.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct KGRound2Message2 {
    pub commitments: FeldmanCommitments<Secp256k1>,
}

/// Decommitment of round 1 plus Schnorr proof of knowledge of `u_i`.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct KGRound3Message {
    pub decommit: Decommitment,
    pub dlog_proof: DLogProof<Secp256k1, Sha256>,
}

/// Acknowledgement that every round 1..3 artifact verified locally.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct KGRound4Message {
    pub verified: bool,
}

/// The aggregate public key as this party computed it.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct KGRound5Message {
    pub pk: Point<Secp256k1>,
}

/// Confirmation that all broadcast aggregates agreed.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct KGRound6Message {
    pub agree: bool,
}
