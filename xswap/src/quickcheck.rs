use crate::{
    asset::{Amount, Currency},
    network::packet::{
        InvoiceExchange, InvoiceExchangeAck, Packet, SwapAccepted, SwapComplete, SwapFailed,
        SwapRequest,
    },
    order::{OrderId, Price, Quantity, TradingPair},
    rail::PayRequest,
    FailureReason, Secret, SecretHash,
};
use quickcheck::{Arbitrary, Gen};
use uuid::Uuid;

fn bytes<G: Gen>(g: &mut G) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    g.fill_bytes(&mut bytes);

    bytes
}

fn symbol<G: Gen>(g: &mut G) -> String {
    let length = 1 + (g.next_u32() % 5) as usize;

    (0..length)
        .map(|_| char::from(b'A' + (g.next_u32() % 26) as u8))
        .collect()
}

impl Arbitrary for Secret {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        Secret::from(bytes(g))
    }
}

impl Arbitrary for SecretHash {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        SecretHash::from(bytes(g))
    }
}

impl Arbitrary for Currency {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        match symbol(g).parse() {
            Ok(currency) => currency,
            Err(_) => unreachable!("symbols are always valid"),
        }
    }
}

impl Arbitrary for Amount {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        Amount::from_units(u64::arbitrary(g))
    }
}

impl Arbitrary for Quantity {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        Quantity::new(u64::arbitrary(g))
    }
}

impl Arbitrary for Price {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        Price::new(u64::arbitrary(g))
    }
}

impl Arbitrary for TradingPair {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        let base = Currency::arbitrary(g);
        let quote = format!("{}X", base).parse().unwrap_or_else(|_| Currency::arbitrary(g));

        match TradingPair::new(base, quote) {
            Ok(pair) => pair,
            Err(_) => unreachable!("quote differs from base"),
        }
    }
}

impl Arbitrary for OrderId {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        let mut bytes = [0u8; 16];
        g.fill_bytes(&mut bytes);

        OrderId::from(Uuid::from_bytes(bytes))
    }
}

impl Arbitrary for PayRequest {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        PayRequest::new(String::arbitrary(g))
    }
}

impl Arbitrary for FailureReason {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        use FailureReason::*;

        let reasons = [
            PeerUnreachable,
            ClientUnavailable,
            InvoiceDecodeError,
            AmountMismatch,
            HashMismatch,
            PaymentFailed,
            Timeout,
            DuplicateRequest,
            Rejected,
            InvalidPacket,
            InsufficientCapacity,
            Remote,
        ];

        reasons[g.next_u32() as usize % reasons.len()]
    }
}

impl Arbitrary for Packet {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        let secret_hash = SecretHash::arbitrary(g);

        match g.next_u32() % 6 {
            0 => {
                let pair_id = TradingPair::arbitrary(g);

                Packet::SwapRequest(SwapRequest {
                    initiator_currency: pair_id.quote().clone(),
                    counterparty_currency: pair_id.base().clone(),
                    pair_id,
                    quantity: Quantity::arbitrary(g),
                    secret_hash,
                    order_id: OrderId::arbitrary(g),
                })
            }
            1 => Packet::SwapAccepted(SwapAccepted {
                secret_hash,
                quantity: Quantity::arbitrary(g),
                price: Price::arbitrary(g),
            }),
            2 => Packet::InvoiceExchange(InvoiceExchange {
                secret_hash,
                pay_request: PayRequest::arbitrary(g),
            }),
            3 => Packet::InvoiceExchangeAck(InvoiceExchangeAck {
                secret_hash,
                pay_request: PayRequest::arbitrary(g),
            }),
            4 => Packet::SwapComplete(SwapComplete { secret_hash }),
            _ => Packet::SwapFailed(SwapFailed {
                secret_hash,
                reason: FailureReason::arbitrary(g),
            }),
        }
    }
}
