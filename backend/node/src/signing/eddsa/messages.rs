use crate::crypto::commit::{ Commitment, Decommitment };
use crate::serdes::ed_scalar;
use curv::cryptographic_primitives::proofs::sigma_dlog::DLogProof;
use curv::elliptic::curves::{ Ed25519, Scalar };
use serde::{ Deserialize, Serialize };
use sha2::Sha256;

/// Round-typed payloads of the Ed25519 signing protocol.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub enum EdSignMessage {
    R1(EdSignRound1Message),
    R2(EdSignRound2Message),
    R3(EdSignRound3Message),
    R4(EdSignRound4Message),
    R5(EdSignRound5Message),
}

/// Commitment to the nonce point `R_i = r_i * B`.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct EdSignRound1Message {
    pub cr: Commitment,
}

/// Opening of the nonce commitment plus proof of knowledge of `r_i`.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct EdSignRound2Message {
    pub dr: Decommitment,
    pub zk_r: DLogProof<Ed25519, Sha256>,
}

/// Commitment to the share image `s_i * B`.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct EdSignRound3Message {
    pub csb: Commitment,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct EdSignRound4Message {
    pub dsb: Decommitment,
}

/// The signature share itself, only revealed after the aggregate equation
/// held over the committed share images.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct EdSignRound5Message {
    #[serde(with = "ed_scalar")]
    pub s_share: Scalar<Ed25519>,
}
