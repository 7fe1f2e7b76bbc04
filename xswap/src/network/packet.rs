//! The six messages exchanged between the two parties of a swap.

use crate::{
    asset::Currency,
    order::{OrderId, Price, Quantity, TradingPair},
    rail::PayRequest,
    FailureReason, SecretHash,
};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u16 = 1;

/// Opens a negotiation; originates the hash lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub pair_id: TradingPair,
    pub quantity: Quantity,
    pub secret_hash: SecretHash,
    /// The currency the initiator receives.
    pub initiator_currency: Currency,
    /// The currency the counterparty receives.
    pub counterparty_currency: Currency,
    pub order_id: OrderId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapAccepted {
    pub secret_hash: SecretHash,
    pub quantity: Quantity,
    pub price: Price,
}

/// Carries a payment request denominated in the currency its sender receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceExchange {
    pub secret_hash: SecretHash,
    pub pay_request: PayRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceExchangeAck {
    pub secret_hash: SecretHash,
    pub pay_request: PayRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapComplete {
    pub secret_hash: SecretHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapFailed {
    pub secret_hash: SecretHash,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Packet {
    SwapRequest(SwapRequest),
    SwapAccepted(SwapAccepted),
    InvoiceExchange(InvoiceExchange),
    InvoiceExchangeAck(InvoiceExchangeAck),
    SwapComplete(SwapComplete),
    SwapFailed(SwapFailed),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum PacketKind {
    SwapRequest,
    SwapAccepted,
    InvoiceExchange,
    InvoiceExchangeAck,
    SwapComplete,
    SwapFailed,
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::SwapRequest(_) => PacketKind::SwapRequest,
            Packet::SwapAccepted(_) => PacketKind::SwapAccepted,
            Packet::InvoiceExchange(_) => PacketKind::InvoiceExchange,
            Packet::InvoiceExchangeAck(_) => PacketKind::InvoiceExchangeAck,
            Packet::SwapComplete(_) => PacketKind::SwapComplete,
            Packet::SwapFailed(_) => PacketKind::SwapFailed,
        }
    }

    /// The hash lock of the deal this packet belongs to.
    pub fn secret_hash(&self) -> SecretHash {
        match self {
            Packet::SwapRequest(packet) => packet.secret_hash,
            Packet::SwapAccepted(packet) => packet.secret_hash,
            Packet::InvoiceExchange(packet) => packet.secret_hash,
            Packet::InvoiceExchangeAck(packet) => packet.secret_hash,
            Packet::SwapComplete(packet) => packet.secret_hash,
            Packet::SwapFailed(packet) => packet.secret_hash,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&Envelope {
            v: PROTOCOL_VERSION,
            packet: self.clone(),
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Packet, DecodeError> {
        let envelope = serde_json::from_slice::<Envelope>(bytes)?;

        if envelope.v != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(envelope.v));
        }

        Ok(envelope.packet)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed packet")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    v: u16,
    packet: Packet,
}

macro_rules! impl_from_body {
    ($($body:ident),*) => {
        $(
            impl From<$body> for Packet {
                fn from(body: $body) -> Self {
                    Packet::$body(body)
                }
            }
        )*
    };
}

impl_from_body!(
    SwapRequest,
    SwapAccepted,
    InvoiceExchange,
    InvoiceExchangeAck,
    SwapComplete,
    SwapFailed
);

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;
    use std::str::FromStr;

    fn secret_hash() -> SecretHash {
        SecretHash::from([7u8; 32])
    }

    #[test]
    fn serialization_format_stability_test() {
        let packet = Packet::SwapAccepted(SwapAccepted {
            secret_hash: secret_hash(),
            quantity: Quantity::new(10),
            price: Price::new(5),
        });

        let json = String::from_utf8(packet.encode().unwrap()).unwrap();

        assert_eq!(
            json,
            r#"{"v":1,"packet":{"type":"swap_accepted","body":{"secret_hash":"0707070707070707070707070707070707070707070707070707070707070707","quantity":10,"price":5}}}"#
        );
    }

    #[test]
    fn swap_request_round_trips() {
        let packet = Packet::SwapRequest(SwapRequest {
            pair_id: TradingPair::from_str("A_B").unwrap(),
            quantity: Quantity::new(10),
            secret_hash: secret_hash(),
            initiator_currency: Currency::from_str("B").unwrap(),
            counterparty_currency: Currency::from_str("A").unwrap(),
            order_id: OrderId::random(),
        });

        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();

        assert_eq!(decoded, packet);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let bytes = br#"{"v":2,"packet":{"type":"swap_complete","body":{"secret_hash":"0707070707070707070707070707070707070707070707070707070707070707"}}}"#;

        let result = Packet::decode(bytes);

        assert!(matches!(result, Err(DecodeError::UnsupportedVersion(2))));
    }

    #[test]
    fn garbage_is_malformed() {
        let result = Packet::decode(b"not a packet");

        assert!(matches!(result, Err(DecodeError::Malformed(_))));
    }

    quickcheck! {
        fn any_packet_round_trips(packet: Packet) -> bool {
            let bytes = packet.encode().unwrap();

            Packet::decode(&bytes).unwrap() == packet
        }

        fn every_packet_knows_its_hash_lock(packet: Packet) -> bool {
            let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();

            decoded.secret_hash() == packet.secret_hash() && decoded.kind() == packet.kind()
        }
    }
}
