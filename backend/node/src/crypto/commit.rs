use rand::RngCore;
use serde::{ Deserialize, Serialize };
use sha3::{ Digest, Keccak256 };

const BLIND_LEN: usize = 32;

/// Hash commitment to an opaque byte message: `D = r || msg` with a 256-bit
/// blind, `C = Keccak256(D)`. Hiding until `D` is opened, binding by the
/// hash.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Commitment(pub Vec<u8>);

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Decommitment(pub Vec<u8>);

pub fn commit(msg: &[u8]) -> (Commitment, Decommitment) {
    let mut blind = [0u8; BLIND_LEN];
    rand::thread_rng().fill_bytes(&mut blind);

    let mut opening = Vec::with_capacity(BLIND_LEN + msg.len());
    opening.extend_from_slice(&blind);
    opening.extend_from_slice(msg);

    let c = Keccak256::digest(&opening);
    (Commitment(c.to_vec()), Decommitment(opening))
}

/// Check the opening against the commitment and extract the committed
/// message.
pub fn verify(c: &Commitment, d: &Decommitment) -> Option<Vec<u8>> {
    if d.0.len() < BLIND_LEN {
        return None;
    }
    let recomputed = Keccak256::digest(&d.0);
    if recomputed.as_slice() != c.0.as_slice() {
        return None;
    }
    Some(d.0[BLIND_LEN..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_reveals_the_message() {
        let msg = b"gamma point bytes";
        let (c, d) = commit(msg);
        assert_eq!(verify(&c, &d).as_deref(), Some(msg.as_slice()));
    }

    #[test]
    fn tampered_opening_is_rejected() {
        let (c, mut d) = commit(b"payload");
        d.0[BLIND_LEN] ^= 0x01;
        assert!(verify(&c, &d).is_none());

        let (_, d2) = commit(b"payload");
        // Same message, different blind: must not open the first commitment.
        assert!(verify(&c, &d2).is_none());
    }

    #[test]
    fn truncated_opening_is_rejected() {
        let (c, _) = commit(b"x");
        assert!(verify(&c, &Decommitment(vec![0u8; 8])).is_none());
    }
}
