//! An in-process coordination service that forwards packets between peers
//! addressed by their public identifier.

use crate::network::{Dispatcher, Inbound, NodeContext, Packet, PeerId, PeerUnreachable, Transport};
use futures::{channel::mpsc, StreamExt};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tracing_futures::Instrument;

#[derive(Debug)]
struct Frame {
    from: PeerId,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Relay {
    peers: Arc<RwLock<HashMap<PeerId, mpsc::UnboundedSender<Frame>>>>,
}

impl Relay {
    /// Registers the local node with the relay.
    ///
    /// Must be called from within a tokio runtime: inbound frames are decoded
    /// and dispatched by a background task that lives as long as the
    /// registration.
    pub fn connect(&self, context: &NodeContext) -> (RelayTransport, Inbound) {
        let (sender, mut receiver) = mpsc::unbounded::<Frame>();
        let (dispatcher, inbound) = Dispatcher::channel();

        self.peers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(context.identity.clone(), sender);

        let demux = async move {
            while let Some(frame) = receiver.next().await {
                match Packet::decode(&frame.payload) {
                    Ok(packet) => dispatcher.dispatch(frame.from, packet),
                    Err(e) => tracing::warn!("dropping frame from {}: {:#}", frame.from, e),
                }
            }

            tracing::debug!("relay connection closed");
        };
        tokio::spawn(demux.instrument(tracing::debug_span!("relay", peer = %context.identity)));

        let transport = RelayTransport {
            relay: self.clone(),
            local_peer: context.identity.clone(),
        };

        (transport, inbound)
    }

    /// Drops the registration of `peer`, making it unreachable.
    pub fn disconnect(&self, peer: &PeerId) {
        self.peers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(peer);
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.peers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(peer)
    }

    /// Forwards an already encoded payload. The sender identity is stamped by
    /// the relay, never taken from the payload.
    pub fn forward(&self, from: &PeerId, to: &PeerId, payload: Vec<u8>) -> Result<(), PeerUnreachable> {
        let peers = self
            .peers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let route = peers.get(to).ok_or_else(|| PeerUnreachable(to.clone()))?;

        route
            .unbounded_send(Frame {
                from: from.clone(),
                payload,
            })
            .map_err(|_| PeerUnreachable(to.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct RelayTransport {
    relay: Relay,
    local_peer: PeerId,
}

#[async_trait::async_trait]
impl Transport for RelayTransport {
    fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    async fn send(&self, to: &PeerId, packet: Packet) -> Result<(), PeerUnreachable> {
        let kind = packet.kind();
        let payload = packet.encode().map_err(|e| {
            tracing::error!("failed to encode {} packet: {:#}", kind, e);
            PeerUnreachable(to.clone())
        })?;

        self.relay.forward(&self.local_peer, to, payload)?;
        tracing::trace!("sent {} to {}", kind, to);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        network::{Network, SwapComplete},
        SecretHash,
    };
    use spectral::prelude::*;

    fn context(name: &str) -> NodeContext {
        NodeContext::new(PeerId::new(name), Network::Dev)
    }

    #[tokio::test]
    async fn packets_are_delivered_with_the_sender_identity() {
        let relay = Relay::default();
        let (alice, _alice_inbound) = relay.connect(&context("alice"));
        let (_bob, mut bob_inbound) = relay.connect(&context("bob"));
        let secret_hash = SecretHash::from([3u8; 32]);

        alice
            .send(&PeerId::new("bob"), SwapComplete { secret_hash }.into())
            .await
            .unwrap();

        let (body, from) = bob_inbound.swap_completes.next().await.unwrap();
        assert_eq!(body.secret_hash, secret_hash);
        assert_eq!(from, PeerId::new("alice"));
    }

    #[tokio::test]
    async fn sending_to_an_unknown_peer_fails() {
        let relay = Relay::default();
        let (alice, _inbound) = relay.connect(&context("alice"));

        let result = alice
            .send(
                &PeerId::new("carol"),
                SwapComplete {
                    secret_hash: SecretHash::from([0u8; 32]),
                }
                .into(),
            )
            .await;

        assert_that(&result).is_err_containing(PeerUnreachable(PeerId::new("carol")));
    }

    #[tokio::test]
    async fn disconnected_peers_become_unreachable() {
        let relay = Relay::default();
        let (alice, _alice_inbound) = relay.connect(&context("alice"));
        let (_bob, _bob_inbound) = relay.connect(&context("bob"));

        relay.disconnect(&PeerId::new("bob"));

        assert!(!relay.is_connected(&PeerId::new("bob")));
        let result = alice
            .send(
                &PeerId::new("bob"),
                SwapComplete {
                    secret_hash: SecretHash::from([0u8; 32]),
                }
                .into(),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn packets_from_one_sender_arrive_in_order() {
        let relay = Relay::default();
        let (alice, _alice_inbound) = relay.connect(&context("alice"));
        let (_bob, mut bob_inbound) = relay.connect(&context("bob"));

        for i in 0..10u8 {
            alice
                .send(
                    &PeerId::new("bob"),
                    SwapComplete {
                        secret_hash: SecretHash::from([i; 32]),
                    }
                    .into(),
                )
                .await
                .unwrap();
        }

        for i in 0..10u8 {
            let (body, _) = bob_inbound.swap_completes.next().await.unwrap();
            assert_eq!(body.secret_hash, SecretHash::from([i; 32]));
        }
    }

    #[tokio::test]
    async fn undecodable_frames_are_dropped() {
        let relay = Relay::default();
        let (alice, _alice_inbound) = relay.connect(&context("alice"));
        let (_bob, mut bob_inbound) = relay.connect(&context("bob"));

        relay
            .forward(&PeerId::new("alice"), &PeerId::new("bob"), b"garbage".to_vec())
            .unwrap();
        alice
            .send(
                &PeerId::new("bob"),
                SwapComplete {
                    secret_hash: SecretHash::from([9u8; 32]),
                }
                .into(),
            )
            .await
            .unwrap();

        let (body, _) = bob_inbound.swap_completes.next().await.unwrap();
        assert_eq!(body.secret_hash, SecretHash::from([9u8; 32]));
    }
}
