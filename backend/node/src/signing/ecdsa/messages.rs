use crate::crypto::commit::{ Commitment, Decommitment };
use crate::crypto::mta::{ MessageA, MessageB };
use crate::crypto::zk::AltBaseDlogProof;
use curv::elliptic::curves::{ Point, Scalar, Secp256k1 };
use serde::{ Deserialize, Serialize };

/// Round-typed payloads of the ECDSA signing protocol.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub enum SignMessage {
    R1(SignRound1Message),
    R2(SignRound2Message),
    R3(SignRound3Message),
    R4(SignRound4Message),
    R5(SignRound5Message),
    R6(SignRound6Message),
    R7(SignRound7Message),
}

/// Commitment to `γ_i * G` plus the MtA opener for `k_i`.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct SignRound1Message {
    pub commitment: Commitment,
    pub msg_a: MessageA,
}

/// Unicast MtA responses for the `γ` and `w` conversions.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct SignRound2Message {
    pub mb_gamma: MessageB,
    pub mb_w: MessageB,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct SignRound3Message {
    pub delta: Scalar<Secp256k1>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct SignRound4Message {
    pub decommit: Decommitment,
}

/// `R̄_i = k_i * R` with a proof of knowledge of `k_i` under base `R`.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct SignRound5Message {
    pub r_bar: Point<Secp256k1>,
    pub proof: AltBaseDlogProof<Secp256k1>,
}

/// `S_i = σ_i * R` with the matching proof; `Σ S_i` must equal the key.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct SignRound6Message {
    pub s_point: Point<Secp256k1>,
    pub proof: AltBaseDlogProof<Secp256k1>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct SignRound7Message {
    pub s_share: Scalar<Secp256k1>,
}
