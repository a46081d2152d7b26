use curv::cryptographic_primitives::hashing::{ Digest, DigestExt };
use curv::elliptic::curves::{ Curve, Point, Scalar };
use serde::{ Deserialize, Serialize };
use sha2::Sha256;

/// Schnorr proof of knowledge of `x` with `target = x * base` for an
/// arbitrary base point. The standard-generator case is covered by curv's
/// `DLogProof`; the signing consistency rounds need the base to be the
/// session's `R` point, so the base is folded into the transcript here.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(bound = "")]
pub struct AltBaseDlogProof<E: Curve> {
    pub commitment: Point<E>,
    pub response: Scalar<E>,
}

impl<E: Curve> AltBaseDlogProof<E> {
    pub fn prove(base: &Point<E>, x: &Scalar<E>) -> Self {
        let target = base * x;
        let nonce = Scalar::<E>::random();
        let commitment = base * &nonce;
        let e = Self::challenge(base, &target, &commitment);
        let response = nonce + e * x;
        AltBaseDlogProof { commitment, response }
    }

    pub fn verify(&self, base: &Point<E>, target: &Point<E>) -> bool {
        let e = Self::challenge(base, target, &self.commitment);
        base * &self.response == &self.commitment + &(target * &e)
    }

    fn challenge(base: &Point<E>, target: &Point<E>, commitment: &Point<E>) -> Scalar<E> {
        Sha256::new()
            .chain_point(base)
            .chain_point(target)
            .chain_point(commitment)
            .result_scalar()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curv::elliptic::curves::{ Ed25519, Secp256k1 };

    #[test]
    fn proof_verifies_for_matching_statement() {
        let base = Point::<Secp256k1>::generator() * Scalar::random();
        let x = Scalar::random();
        let target = &base * &x;

        let proof = AltBaseDlogProof::prove(&base, &x);
        assert!(proof.verify(&base, &target));
    }

    #[test]
    fn proof_rejects_wrong_target_or_base() {
        let base = Point::<Secp256k1>::generator() * Scalar::random();
        let x = Scalar::random();
        let target = &base * &x;

        let proof = AltBaseDlogProof::prove(&base, &x);
        let other = &base * &Scalar::random();
        assert!(!proof.verify(&base, &other));

        let other_base = Point::<Secp256k1>::generator() * Scalar::random();
        assert!(!proof.verify(&other_base, &target));
    }

    #[test]
    fn works_over_the_edwards_group() {
        let base = Point::<Ed25519>::generator() * Scalar::random();
        let x = Scalar::random();
        let target = &base * &x;
        let proof = AltBaseDlogProof::prove(&base, &x);
        assert!(proof.verify(&base, &target));
    }
}
