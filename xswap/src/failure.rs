use serde::{Deserialize, Serialize};

/// Why a deal failed.
///
/// These are also the coarse codes carried by a `SwapFailed` packet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error,
)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    #[error("peer is unreachable")]
    PeerUnreachable,
    #[error("no payment rail client for currency")]
    ClientUnavailable,
    #[error("invoice could not be decoded")]
    InvoiceDecodeError,
    #[error("invoice amount does not match the agreed terms")]
    AmountMismatch,
    #[error("invoice hash lock does not match the deal")]
    HashMismatch,
    #[error("payment failed")]
    PaymentFailed,
    #[error("deal timed out")]
    Timeout,
    #[error("hash lock is already in use")]
    DuplicateRequest,
    #[error("swap was rejected")]
    Rejected,
    #[error("packet contradicts the negotiated terms")]
    InvalidPacket,
    #[error("insufficient capacity on payment rail")]
    InsufficientCapacity,
    #[error("peer aborted the deal")]
    Remote,
}

/// The reason a deal failed together with a human readable account of what
/// happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct Failure {
    pub reason: FailureReason,
    pub message: String,
}

impl Failure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Failure {
            reason,
            message: message.into(),
        }
    }
}

impl From<FailureReason> for Failure {
    fn from(reason: FailureReason) -> Self {
        Failure {
            reason,
            message: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_serialize_as_snake_case_codes() {
        let json = serde_json::to_string(&FailureReason::AmountMismatch).unwrap();

        assert_eq!(json, r#""amount_mismatch""#);
    }

    #[test]
    fn failure_display_includes_reason_and_message() {
        let failure = Failure::new(FailureReason::Timeout, "no SwapAccepted after 100s");

        assert_eq!(
            failure.to_string(),
            "deal timed out: no SwapAccepted after 100s"
        );
    }
}
