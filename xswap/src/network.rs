pub mod packet;
pub mod relay;

pub use self::{
    packet::{
        InvoiceExchange, InvoiceExchangeAck, Packet, PacketKind, SwapAccepted, SwapComplete,
        SwapFailed, SwapRequest,
    },
    relay::{Relay, RelayTransport},
};

use futures::{
    channel::mpsc,
    stream::{BoxStream, Stream},
    task::{Context, Poll},
    StreamExt,
};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    pin::Pin,
    sync::{Arc, Mutex},
};

/// The stable public identifier a peer is addressed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(identifier: impl Into<String>) -> Self {
        PeerId(identifier.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The various networks a node can be run against.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Network {
    Main,
    Test,
    Dev,
}

impl Default for Network {
    fn default() -> Self {
        Network::Main
    }
}

/// Everything about the local node that the transport and the payment rails
/// need to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeContext {
    pub identity: PeerId,
    pub network: Network,
}

impl NodeContext {
    pub fn new(identity: PeerId, network: Network) -> Self {
        NodeContext { identity, network }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("peer {0} is unreachable")]
pub struct PeerUnreachable(pub PeerId);

/// Best-effort, at-most-once delivery of packets to a peer.
#[async_trait::async_trait]
pub trait Transport: fmt::Debug + Send + Sync + 'static {
    fn local_peer(&self) -> &PeerId;

    async fn send(&self, to: &PeerId, packet: Packet) -> Result<(), PeerUnreachable>;
}

/// A packet tagged with its position in the order of dispatch.
#[derive(Debug)]
struct Stamped<B> {
    sequence: u64,
    from: PeerId,
    body: B,
}

/// The packets of one kind, yielded together with their sender.
#[derive(Debug)]
pub struct Received<B> {
    receiver: mpsc::UnboundedReceiver<Stamped<B>>,
}

impl<B> Received<B> {
    /// Takes the next packet if one is already waiting.
    ///
    /// `Ok(None)` means the dispatcher is gone, `Err` that nothing arrived yet.
    pub fn try_next(&mut self) -> Result<Option<(B, PeerId)>, mpsc::TryRecvError> {
        self.receiver
            .try_next()
            .map(|stamped| stamped.map(|stamped| (stamped.body, stamped.from)))
    }
}

impl<B> Stream for Received<B> {
    type Item = (B, PeerId);

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut()
            .receiver
            .poll_next_unpin(cx)
            .map(|stamped| stamped.map(|stamped| (stamped.body, stamped.from)))
    }
}

/// Inbound packets, one stream per packet kind.
#[derive(Debug)]
pub struct Inbound {
    pub swap_requests: Received<SwapRequest>,
    pub swap_accepted: Received<SwapAccepted>,
    pub invoice_exchanges: Received<InvoiceExchange>,
    pub invoice_exchange_acks: Received<InvoiceExchangeAck>,
    pub swap_completes: Received<SwapComplete>,
    pub swap_failures: Received<SwapFailed>,
}

impl Inbound {
    /// Merges all streams back into one, in the order the packets were
    /// dispatched.
    ///
    /// Must be called before any packet was taken from the individual
    /// streams.
    pub fn merge(self) -> BoxStream<'static, (PeerId, Packet)> {
        fn tag<B>(received: Received<B>) -> Source
        where
            B: Into<Packet> + Send + 'static,
        {
            let stream = received
                .receiver
                .map(|stamped| Stamped {
                    sequence: stamped.sequence,
                    from: stamped.from,
                    body: stamped.body.into(),
                })
                .boxed();

            Source {
                stream,
                head: None,
                done: false,
            }
        }

        InOrder {
            sources: vec![
                tag(self.swap_requests),
                tag(self.swap_accepted),
                tag(self.invoice_exchanges),
                tag(self.invoice_exchange_acks),
                tag(self.swap_completes),
                tag(self.swap_failures),
            ],
            next: 0,
        }
        .boxed()
    }
}

struct Source {
    stream: BoxStream<'static, Stamped<Packet>>,
    head: Option<Stamped<Packet>>,
    done: bool,
}

/// Restores the dispatch order across the per-kind streams.
///
/// Packets are dispatched with consecutive sequence numbers, so the packet
/// due next is always at the head of one of the sources. Once every source
/// that is still open has a head, the earliest head cannot be overtaken
/// anymore either.
struct InOrder {
    sources: Vec<Source>,
    next: u64,
}

impl Stream for InOrder {
    type Item = (PeerId, Packet);

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        for source in this
            .sources
            .iter_mut()
            .filter(|source| source.head.is_none() && !source.done)
        {
            match source.stream.poll_next_unpin(cx) {
                Poll::Ready(Some(stamped)) => source.head = Some(stamped),
                Poll::Ready(None) => source.done = true,
                Poll::Pending => {}
            }
        }

        let drained = this
            .sources
            .iter()
            .all(|source| source.done || source.head.is_some());
        let earliest = this
            .sources
            .iter()
            .enumerate()
            .filter_map(|(index, source)| source.head.as_ref().map(|head| (head.sequence, index)))
            .min();

        match earliest {
            Some((sequence, index)) if sequence == this.next || drained => {
                this.next = sequence.saturating_add(1);
                let head = this.sources[index].head.take();

                Poll::Ready(head.map(|head| (head.from, head.body)))
            }
            None if drained => Poll::Ready(None),
            _ => Poll::Pending,
        }
    }
}

/// Routes decoded packets to the stream of their kind.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    sequence: Arc<Mutex<u64>>,
    swap_requests: mpsc::UnboundedSender<Stamped<SwapRequest>>,
    swap_accepted: mpsc::UnboundedSender<Stamped<SwapAccepted>>,
    invoice_exchanges: mpsc::UnboundedSender<Stamped<InvoiceExchange>>,
    invoice_exchange_acks: mpsc::UnboundedSender<Stamped<InvoiceExchangeAck>>,
    swap_completes: mpsc::UnboundedSender<Stamped<SwapComplete>>,
    swap_failures: mpsc::UnboundedSender<Stamped<SwapFailed>>,
}

impl Dispatcher {
    pub fn channel() -> (Dispatcher, Inbound) {
        let (swap_requests, swap_requests_rx) = mpsc::unbounded();
        let (swap_accepted, swap_accepted_rx) = mpsc::unbounded();
        let (invoice_exchanges, invoice_exchanges_rx) = mpsc::unbounded();
        let (invoice_exchange_acks, invoice_exchange_acks_rx) = mpsc::unbounded();
        let (swap_completes, swap_completes_rx) = mpsc::unbounded();
        let (swap_failures, swap_failures_rx) = mpsc::unbounded();

        let dispatcher = Dispatcher {
            sequence: Arc::new(Mutex::new(0)),
            swap_requests,
            swap_accepted,
            invoice_exchanges,
            invoice_exchange_acks,
            swap_completes,
            swap_failures,
        };
        let inbound = Inbound {
            swap_requests: Received {
                receiver: swap_requests_rx,
            },
            swap_accepted: Received {
                receiver: swap_accepted_rx,
            },
            invoice_exchanges: Received {
                receiver: invoice_exchanges_rx,
            },
            invoice_exchange_acks: Received {
                receiver: invoice_exchange_acks_rx,
            },
            swap_completes: Received {
                receiver: swap_completes_rx,
            },
            swap_failures: Received {
                receiver: swap_failures_rx,
            },
        };

        (dispatcher, inbound)
    }

    pub fn dispatch(&self, from: PeerId, packet: Packet) {
        fn send<B>(
            sender: &mpsc::UnboundedSender<Stamped<B>>,
            sequence: u64,
            from: PeerId,
            body: B,
        ) -> bool {
            sender
                .unbounded_send(Stamped {
                    sequence,
                    from,
                    body,
                })
                .is_ok()
        }

        let kind = packet.kind();
        // held while sending, sequence numbers follow the queue order
        let mut sequence = self
            .sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let at = *sequence;

        let delivered = match packet {
            Packet::SwapRequest(body) => send(&self.swap_requests, at, from, body),
            Packet::SwapAccepted(body) => send(&self.swap_accepted, at, from, body),
            Packet::InvoiceExchange(body) => send(&self.invoice_exchanges, at, from, body),
            Packet::InvoiceExchangeAck(body) => send(&self.invoice_exchange_acks, at, from, body),
            Packet::SwapComplete(body) => send(&self.swap_completes, at, from, body),
            Packet::SwapFailed(body) => send(&self.swap_failures, at, from, body),
        };

        if delivered {
            *sequence = at.saturating_add(1);
        } else {
            tracing::debug!("no subscriber for {} packets", kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SecretHash;
    use futures::StreamExt;

    #[tokio::test]
    async fn dispatcher_routes_packets_by_kind() {
        let (dispatcher, mut inbound) = Dispatcher::channel();
        let alice = PeerId::new("alice");
        let secret_hash = SecretHash::from([1u8; 32]);

        dispatcher.dispatch(alice.clone(), Packet::SwapComplete(SwapComplete { secret_hash }));

        let (body, from) = inbound.swap_completes.next().await.unwrap();
        assert_eq!(body.secret_hash, secret_hash);
        assert_eq!(from, alice);
        assert!(inbound.swap_failures.try_next().is_err());
    }

    #[tokio::test]
    async fn merged_inbound_keeps_the_dispatch_order_across_kinds() {
        let (dispatcher, inbound) = Dispatcher::channel();
        let bob = PeerId::new("bob");
        let secret_hash = SecretHash::from([2u8; 32]);
        let failed = Packet::SwapFailed(SwapFailed {
            secret_hash,
            reason: crate::FailureReason::Timeout,
        });
        let ack = Packet::InvoiceExchangeAck(InvoiceExchangeAck {
            secret_hash,
            pay_request: crate::rail::PayRequest::new("lnx1"),
        });
        let complete = Packet::SwapComplete(SwapComplete { secret_hash });

        for packet in vec![failed.clone(), ack.clone(), complete.clone(), failed.clone()] {
            dispatcher.dispatch(bob.clone(), packet);
        }
        drop(dispatcher);

        let packets = inbound
            .merge()
            .map(|(_, packet)| packet)
            .collect::<Vec<_>>()
            .await;

        assert_eq!(packets, vec![failed.clone(), ack, complete, failed]);
    }

    #[tokio::test]
    async fn merged_inbound_waits_for_the_packet_due_next() {
        let (dispatcher, inbound) = Dispatcher::channel();
        let alice = PeerId::new("alice");
        let mut merged = inbound.merge();

        for i in 0..3u8 {
            let secret_hash = SecretHash::from([i; 32]);
            dispatcher.dispatch(alice.clone(), Packet::SwapComplete(SwapComplete { secret_hash }));
            dispatcher.dispatch(
                alice.clone(),
                Packet::SwapFailed(SwapFailed {
                    secret_hash,
                    reason: crate::FailureReason::Remote,
                }),
            );
        }

        for i in 0..3u8 {
            let (_, first) = merged.next().await.unwrap();
            let (_, second) = merged.next().await.unwrap();

            assert_eq!(first.kind(), PacketKind::SwapComplete);
            assert_eq!(second.kind(), PacketKind::SwapFailed);
            assert_eq!(second.secret_hash(), SecretHash::from([i; 32]));
        }
        assert!(futures::FutureExt::now_or_never(merged.next()).is_none());
    }
}
