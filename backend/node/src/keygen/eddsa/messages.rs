use crate::crypto::commit::{ Commitment, Decommitment };
use crate::crypto::vss::FeldmanCommitments;
use crate::serdes::{ dec, ed_point, ed_scalar };
use curv::cryptographic_primitives::proofs::sigma_dlog::DLogProof;
use curv::elliptic::curves::{ Ed25519, Point, Scalar };
use curv::BigInt;
use serde::{ Deserialize, Serialize };
use sha2::Sha256;

/// Round-typed payloads of the Ed25519 keygen protocol.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub enum EdKeygenMessage {
    R0(EdKGRound0Message),
    R1(EdKGRound1Message),
    R2Share(EdKGRound2Message1),
    R2Commit(EdKGRound2Message2),
    R3(EdKGRound3Message),
    R4(EdKGRound4Message),
    R5(EdKGRound5Message),
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct EdKGRound0Message {
    #[serde(with = "dec")]
    pub uid: BigInt,
}

/// Commitment to `u_i * B`.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct EdKGRound1Message {
    pub commitment: Commitment,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct EdKGRound2Message1 {
    #[serde(with = "ed_scalar")]
    pub share: Scalar<Ed25519>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct EdKGRound2Message2 {
    pub commitments: FeldmanCommitments<Ed25519>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct EdKGRound3Message {
    pub decommit: Decommitment,
    pub dlog_proof: DLogProof<Ed25519, Sha256>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct EdKGRound4Message {
    pub verified: bool,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct EdKGRound5Message {
    #[serde(with = "ed_point")]
    pub pk: Point<Ed25519>,
}
