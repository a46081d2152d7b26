use strum_macros::Display;
use thiserror::Error;

/// Why a cryptographic verification rejected a message.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum AbortReason {
    #[strum(serialize = "commit-mismatch")]
    CommitMismatch,
    #[strum(serialize = "vss-share-bad")]
    VssShareBad,
    #[strum(serialize = "schnorr-proof-bad")]
    SchnorrProofBad,
    #[strum(serialize = "range-proof-bad")]
    RangeProofBad,
    #[strum(serialize = "aggregate-pk-disagreement")]
    AggregatePkDisagreement,
}

/// Attributable misbehavior kinds, surfaced so the acceptance layer can score
/// the offender.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum FaultKind {
    #[strum(serialize = "range-proof-bad")]
    RangeProofBad,
    #[strum(serialize = "paillier-proof-bad")]
    PaillierProofBad,
    #[strum(serialize = "ntilde-proof-bad")]
    NtildeProofBad,
    #[strum(serialize = "bad-share")]
    BadShare,
    #[strum(serialize = "bad-signature-share")]
    BadSignatureShare,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Phase {
    #[strum(serialize = "agree")]
    Agree,
    #[strum(serialize = "round")]
    Round,
    #[strum(serialize = "store")]
    Store,
}

/// Terminal outcomes of a protocol session. Every variant kills the owning
/// session; only `Timeout` (and attributable protocol failures, per the retry
/// policy) may trigger a whole-session retry with fresh randomness.
#[derive(Debug, Error)]
pub enum MpcError {
    #[error("protocol aborted in round {round}: {reason}{}", offender_note(.offender))]
    ProtocolAborted {
        round: u32,
        reason: AbortReason,
        offender: Option<String>,
    },

    #[error("peer {uid} faulted: {kind}")]
    PeerFaulted { uid: String, kind: FaultKind },

    #[error("timed out during {phase} (round {round})")]
    Timeout { phase: Phase, round: u32 },

    #[error("storage backend failure: {0}")]
    StorageFailed(String),

    #[error("bad request: {0}")]
    BadInput(String),

    #[error("internal invariant violated: {0}")]
    InternalInvariantViolated(String),
}

fn offender_note(offender: &Option<String>) -> String {
    match offender {
        Some(uid) => format!(" (offender {uid})"),
        None => String::new(),
    }
}

impl MpcError {
    /// Whether the session-level retry policy may re-run the request.
    pub fn is_retryable(&self) -> bool {
        match self {
            MpcError::Timeout { .. } => true,
            MpcError::ProtocolAborted { .. } | MpcError::PeerFaulted { .. } => true,
            MpcError::StorageFailed(_)
            | MpcError::BadInput(_)
            | MpcError::InternalInvariantViolated(_) => false,
        }
    }

    pub fn offender(&self) -> Option<&str> {
        match self {
            MpcError::ProtocolAborted { offender, .. } => offender.as_deref(),
            MpcError::PeerFaulted { uid, .. } => Some(uid),
            _ => None,
        }
    }
}

pub type MpcResult<T> = std::result::Result<T, MpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_matches_policy() {
        let timeout = MpcError::Timeout { phase: Phase::Agree, round: 0 };
        assert!(timeout.is_retryable());

        let bad_input = MpcError::BadInput("empty group".into());
        assert!(!bad_input.is_retryable());

        let aborted = MpcError::ProtocolAborted {
            round: 3,
            reason: AbortReason::CommitMismatch,
            offender: Some("02ff".into()),
        };
        assert!(aborted.is_retryable());
        assert_eq!(aborted.offender(), Some("02ff"));
    }

    #[test]
    fn abort_message_names_round_and_reason() {
        let err = MpcError::ProtocolAborted {
            round: 3,
            reason: AbortReason::CommitMismatch,
            offender: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("round 3"));
        assert!(msg.contains("commit-mismatch"));
    }
}
