use curv::elliptic::curves::{ Curve, Point, Scalar };
use curv::BigInt;
use serde::{ Deserialize, Serialize };

/// Feldman commitments to a sharing polynomial: `A_k = a_k * G` with
/// `A_0 = s * G`. Shares are evaluated at party UIDs, not at 1..n indices,
/// so the interpolation points coincide with the identities fixed at round 0.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(bound = "")]
pub struct FeldmanCommitments<E: Curve> {
    pub threshold: usize,
    pub commitments: Vec<Point<E>>,
}

/// Share `secret` with reconstruction quorum `threshold + 1` toward the
/// parties identified by `uids`. Returns the public commitment set and one
/// share per uid, in order.
pub fn share<E: Curve>(
    secret: &Scalar<E>,
    threshold: usize,
    uids: &[BigInt]
) -> (FeldmanCommitments<E>, Vec<Scalar<E>>) {
    let mut coefficients = vec![secret.clone()];
    for _ in 0..threshold {
        coefficients.push(Scalar::random());
    }

    let commitments = coefficients
        .iter()
        .map(|a| Point::generator() * a)
        .collect();

    let shares = uids
        .iter()
        .map(|uid| evaluate(&coefficients, &Scalar::from_bigint(uid)))
        .collect();

    (FeldmanCommitments { threshold, commitments }, shares)
}

fn evaluate<E: Curve>(coefficients: &[Scalar<E>], x: &Scalar<E>) -> Scalar<E> {
    let mut acc = Scalar::zero();
    for a in coefficients.iter().rev() {
        acc = &(&acc * x) + a;
    }
    acc
}

impl<E: Curve> FeldmanCommitments<E> {
    /// `share * G == Σ uid^k * A_k`, evaluated by Horner over the committed
    /// points.
    pub fn validate_share(&self, share: &Scalar<E>, uid: &BigInt) -> bool {
        Point::generator() * share == self.public_share(uid)
    }

    /// The committed secret's public image `s * G`.
    pub fn secret_commitment(&self) -> Option<&Point<E>> {
        self.commitments.first()
    }

    /// Public image of the share at `uid`: `f(uid) * G`, from the
    /// commitments alone.
    pub fn public_share(&self, uid: &BigInt) -> Point<E> {
        let x = Scalar::<E>::from_bigint(uid);
        let mut acc = Point::<E>::zero();
        for a in self.commitments.iter().rev() {
            acc = &(&acc * &x) + a;
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::party::lagrange_coeff;
    use curv::arithmetic::Samplable;
    use curv::elliptic::curves::{ Ed25519, Secp256k1 };

    fn random_uids(n: usize, order: &BigInt) -> Vec<BigInt> {
        (0..n).map(|_| BigInt::sample_below(order)).collect()
    }

    #[test]
    fn every_share_validates_against_the_commitments() {
        let order = Scalar::<Secp256k1>::group_order().clone();
        let uids = random_uids(5, &order);
        let secret = Scalar::<Secp256k1>::random();

        let (commitments, shares) = share(&secret, 2, &uids);
        assert_eq!(commitments.commitments.len(), 3);
        for (uid, sh) in uids.iter().zip(&shares) {
            assert!(commitments.validate_share(sh, uid));
        }
        // A share evaluated at the wrong uid must not validate.
        assert!(!commitments.validate_share(&shares[0], &uids[1]));
    }

    #[test]
    fn quorum_reconstructs_the_secret() {
        let order = Scalar::<Secp256k1>::group_order().clone();
        let uids = random_uids(4, &order);
        let secret = Scalar::<Secp256k1>::random();
        let (_, shares) = share(&secret, 1, &uids);

        for subset in [[0usize, 1], [1, 3], [0, 2]] {
            let ids = vec![uids[subset[0]].clone(), uids[subset[1]].clone()];
            let mut acc = Scalar::<Secp256k1>::zero();
            for (uid, idx) in ids.iter().zip(subset) {
                let lambda = lagrange_coeff(&ids, uid, &order).unwrap();
                acc = acc + Scalar::from_bigint(&lambda) * &shares[idx];
            }
            assert_eq!(acc, secret);
        }
    }

    #[test]
    fn works_over_the_edwards_group() {
        let order = Scalar::<Ed25519>::group_order().clone();
        let uids = random_uids(3, &order);
        let secret = Scalar::<Ed25519>::random();
        let (commitments, shares) = share(&secret, 1, &uids);
        for (uid, sh) in uids.iter().zip(&shares) {
            assert!(commitments.validate_share(sh, uid));
        }
    }
}
