use crate::{
    asset::{Amount, Currency},
    fee::FeeLedger,
    network::{
        Inbound, InvoiceExchangeAck, Packet, PeerId, SwapAccepted, SwapComplete, SwapFailed,
        SwapRequest, Transport,
    },
    order::{OwnOrders, Position, Price},
    rail::{IncomingPayment, PayRequest, RailError},
    registry::{RailClientHandle, Registry},
    swap::{
        repository::{InMemorySwapRepository, SwapRepository},
        step::{InvoiceLeg, Outcome, Steps},
        DealEvent, Phase, Role, SwapDeal, SwapError, SwapProposal, Terms, Timeouts,
    },
    Failure, FailureReason, Secret, SecretHash,
};
use chrono::{DateTime, Utc};
use futures::{
    channel::{mpsc, oneshot},
    future::{self, BoxFuture},
    stream::{BoxStream, FuturesUnordered},
    Future, FutureExt, StreamExt,
};
use std::{
    cmp,
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::broadcast,
    time::{sleep_until, Instant},
};
use tracing_futures::Instrument;

const EVENT_CAPACITY: usize = 1024;

/// Configures and starts the engine task.
#[derive(Debug)]
pub struct SwapEngine {
    transport: Arc<dyn Transport>,
    registry: Arc<Registry>,
    orders: Arc<dyn OwnOrders>,
    fees: Option<Arc<dyn FeeLedger>>,
    repository: Arc<dyn SwapRepository>,
    timeouts: Timeouts,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error(transparent)]
    Rail(#[from] RailError),
    #[error("failed to load finished deals: {0:#}")]
    Repository(anyhow::Error),
}

impl SwapEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<Registry>,
        orders: Arc<dyn OwnOrders>,
    ) -> Self {
        SwapEngine {
            transport,
            registry,
            orders,
            fees: None,
            repository: Arc::new(InMemorySwapRepository::default()),
            timeouts: Timeouts::default(),
        }
    }

    /// Finished deals are moved to `repository`.
    pub fn with_repository(self, repository: Arc<dyn SwapRepository>) -> Self {
        SwapEngine { repository, ..self }
    }

    pub fn with_timeouts(self, timeouts: Timeouts) -> Self {
        SwapEngine { timeouts, ..self }
    }

    /// Reserved fees are not considered available for paying swap legs.
    pub fn with_fee_ledger(self, fees: Arc<dyn FeeLedger>) -> Self {
        SwapEngine {
            fees: Some(fees),
            ..self
        }
    }

    /// Spawns the engine onto the tokio runtime.
    ///
    /// The engine runs until every [`EngineHandle`] has been dropped.
    pub async fn spawn(self, inbound: Inbound) -> Result<EngineHandle, SpawnError> {
        let used = self
            .repository
            .load_all()
            .map_err(SpawnError::Repository)?
            .into_iter()
            .map(|deal| deal.secret_hash)
            .collect::<HashSet<_>>();
        let payments = self.registry.incoming().await?;
        let (commands, command_receiver) = mpsc::unbounded();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let span = tracing::info_span!("engine", peer = %self.transport.local_peer());

        let event_loop = EventLoop {
            steps: Steps {
                transport: self.transport,
                registry: self.registry,
                fees: self.fees,
            },
            orders: self.orders,
            repository: self.repository,
            timeouts: self.timeouts,
            deals: HashMap::new(),
            used,
            pending: FuturesUnordered::new(),
            events,
        };

        tokio::spawn(
            event_loop
                .run(inbound.merge(), payments, command_receiver)
                .instrument(span),
        );

        Ok(EngineHandle { commands })
    }
}

#[derive(Debug)]
enum Command {
    Start {
        proposal: SwapProposal,
        secret: Option<Secret>,
        reply: oneshot::Sender<Result<SecretHash, SwapError>>,
    },
    Deal {
        secret_hash: SecretHash,
        reply: oneshot::Sender<Option<SwapDeal>>,
    },
    ActiveDeals {
        reply: oneshot::Sender<Vec<SwapDeal>>,
    },
    Subscribe {
        reply: oneshot::Sender<broadcast::Receiver<DealEvent>>,
    },
}

/// Cheap to clone access to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SwapError> {
        let (reply, response) = oneshot::channel();

        self.commands
            .unbounded_send(command(reply))
            .map_err(|_| SwapError::EngineStopped)?;

        response.await.map_err(|_| SwapError::EngineStopped)
    }

    /// Starts a swap as initiator and returns the hash lock identifying it.
    pub async fn start_swap(&self, proposal: SwapProposal) -> Result<SecretHash, SwapError> {
        self.request(|reply| Command::Start {
            proposal,
            secret: None,
            reply,
        })
        .await?
    }

    /// Like [`start_swap`](Self::start_swap) with a caller provided secret.
    pub async fn start_swap_with_secret(
        &self,
        proposal: SwapProposal,
        secret: Secret,
    ) -> Result<SecretHash, SwapError> {
        self.request(|reply| Command::Start {
            proposal,
            secret: Some(secret),
            reply,
        })
        .await?
    }

    /// Starts a swap and waits until it completed or failed.
    pub async fn execute_swap(&self, proposal: SwapProposal) -> Result<SwapDeal, SwapError> {
        let mut events = self.subscribe().await?;
        let secret_hash = self.start_swap(proposal).await?;

        self.wait_for(&mut events, secret_hash).await
    }

    /// Waits for the deal to reach a terminal phase, returning it if it
    /// completed.
    pub async fn wait_for(
        &self,
        events: &mut broadcast::Receiver<DealEvent>,
        secret_hash: SecretHash,
    ) -> Result<SwapDeal, SwapError> {
        loop {
            match events.recv().await {
                Ok(DealEvent::Completed { secret_hash: hash, .. })
                | Ok(DealEvent::Failed { secret_hash: hash, .. })
                    if hash == secret_hash =>
                {
                    break
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("skipped {} deal events", skipped);
                    match self.deal(secret_hash).await? {
                        Some(deal) if deal.is_terminal() => break,
                        _ => continue,
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(SwapError::EngineStopped),
            }
        }

        let deal = self
            .deal(secret_hash)
            .await?
            .ok_or(SwapError::EngineStopped)?;

        match deal.failure() {
            Some(failure) => Err(SwapError::Failed(failure.clone())),
            None => Ok(deal),
        }
    }

    /// Looks a deal up among the running ones first, then in the repository.
    pub async fn deal(&self, secret_hash: SecretHash) -> Result<Option<SwapDeal>, SwapError> {
        self.request(|reply| Command::Deal { secret_hash, reply })
            .await
    }

    /// All deals that have not completed or failed yet.
    pub async fn active_deals(&self) -> Result<Vec<SwapDeal>, SwapError> {
        self.request(|reply| Command::ActiveDeals { reply }).await
    }

    pub async fn subscribe(&self) -> Result<broadcast::Receiver<DealEvent>, SwapError> {
        self.request(|reply| Command::Subscribe { reply }).await
    }
}

#[derive(Debug)]
enum Input {
    Packet(Packet),
    Payment(IncomingPayment),
}

/// A deal and the bookkeeping the engine needs to drive it.
#[derive(Debug)]
struct Slot {
    deal: SwapDeal,
    /// Our own secret, only known to the initiator from the start.
    secret: Option<Secret>,
    expires_at: Instant,
    deadline: Instant,
    /// Set while a step is outstanding; inputs queue up meanwhile.
    busy: bool,
    inbox: VecDeque<Input>,
    /// An input that has to wait for the other leg: the counterparty's
    /// incoming payment before it learned the preimage, the initiator's
    /// counter invoice before its own invoice was claimed.
    parked: Option<Input>,
    /// Settling the incoming payment has started.
    claiming: bool,
    inbound_settled: bool,
    span: tracing::Span,
}

struct EventLoop {
    steps: Steps,
    orders: Arc<dyn OwnOrders>,
    repository: Arc<dyn SwapRepository>,
    timeouts: Timeouts,
    /// Deals that are running, or finished with a step still outstanding.
    deals: HashMap<SecretHash, Slot>,
    /// Every hash lock that was ever used for a deal.
    used: HashSet<SecretHash>,
    pending: FuturesUnordered<BoxFuture<'static, (SecretHash, Outcome)>>,
    events: broadcast::Sender<DealEvent>,
}

fn after(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

fn deadline_at(created_at: DateTime<Utc>, lifetime: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lifetime)
        .ok()
        .and_then(|lifetime| created_at.checked_add_signed(lifetime))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl EventLoop {
    async fn run(
        mut self,
        mut packets: BoxStream<'static, (PeerId, Packet)>,
        mut payments: BoxStream<'static, IncomingPayment>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        tracing::info!("swap engine started");

        loop {
            let timer = match self.next_deadline() {
                Some(deadline) => sleep_until(deadline).boxed(),
                None => future::pending().boxed(),
            };

            tokio::select! {
                command = commands.next() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some((from, packet)) = packets.next() => self.handle_packet(from, packet),
                Some(payment) = payments.next() => self.handle_payment(payment),
                Some((secret_hash, outcome)) = self.pending.next() => {
                    self.handle_outcome(secret_hash, outcome)
                }
                _ = timer => self.expire(Instant::now()),
            }
        }

        tracing::info!("swap engine stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                proposal,
                secret,
                reply,
            } => {
                let _ = reply.send(self.start(proposal, secret));
            }
            Command::Deal { secret_hash, reply } => {
                let deal = match self.deals.get(&secret_hash) {
                    Some(slot) => Some(slot.deal.clone()),
                    None => self.load(secret_hash),
                };
                let _ = reply.send(deal);
            }
            Command::ActiveDeals { reply } => {
                let active = self
                    .deals
                    .values()
                    .filter(|slot| !slot.deal.is_terminal())
                    .map(|slot| slot.deal.clone())
                    .collect();
                let _ = reply.send(active);
            }
            Command::Subscribe { reply } => {
                let _ = reply.send(self.events.subscribe());
            }
        }
    }

    fn start(
        &mut self,
        proposal: SwapProposal,
        secret: Option<Secret>,
    ) -> Result<SecretHash, SwapError> {
        let secret = match secret {
            Some(secret) if self.used.contains(&secret.hash()) => {
                return Err(SwapError::DuplicateRequest(secret.hash()))
            }
            Some(secret) => secret,
            None => self.fresh_secret(),
        };
        let secret_hash = secret.hash();

        let (initiator_currency, counterparty_currency) = match proposal.position {
            Position::Buy => (proposal.pair.base().clone(), proposal.pair.quote().clone()),
            Position::Sell => (proposal.pair.quote().clone(), proposal.pair.base().clone()),
        };
        let terms = Terms {
            pair: proposal.pair,
            order_id: proposal.order_id,
            quantity: proposal.quantity,
            price: proposal.price,
            initiator_currency,
            counterparty_currency,
        };
        let deal = self.new_deal(secret_hash, Role::Initiator, proposal.peer, terms);

        let checked = self.ensure_tradeable(&deal);
        let request = SwapRequest {
            pair_id: deal.pair.clone(),
            quantity: deal.quantity,
            secret_hash,
            initiator_currency: deal.initiator_currency.clone(),
            counterparty_currency: deal.counterparty_currency.clone(),
            order_id: deal.order_id,
        };
        let peer = deal.peer.clone();
        let pays = deal.outbound_currency().clone();
        self.insert(deal, Some(secret));

        match checked {
            Ok(amount) => {
                let step = self.steps.clone().request(peer, request.into(), pays, amount);
                self.spawn_step(secret_hash, step);

                Ok(secret_hash)
            }
            Err(failure) => {
                self.fail(secret_hash, failure.clone(), false);

                Err(SwapError::Failed(failure))
            }
        }
    }

    fn on_swap_request(&mut self, from: PeerId, request: SwapRequest) {
        let secret_hash = request.secret_hash;

        if self.used.contains(&secret_hash) {
            tracing::warn!(
                "rejecting SwapRequest from {}: {}",
                from,
                SwapError::DuplicateRequest(secret_hash)
            );
            return;
        }

        let order = self.orders.own_order(&request.pair_id, &request.order_id);
        let terms = Terms {
            pair: request.pair_id.clone(),
            order_id: request.order_id,
            quantity: request.quantity,
            price: order.map(|order| order.price).unwrap_or(Price::new(0)),
            initiator_currency: request.initiator_currency,
            counterparty_currency: request.counterparty_currency,
        };
        let mut deal = self.new_deal(secret_hash, Role::Counterparty, from, terms);

        let checked = match order {
            None => Err(Failure::new(
                FailureReason::Rejected,
                format!("no order {} on {}", request.order_id, request.pair_id),
            )),
            Some(order) if order.available.is_zero() => Err(Failure::new(
                FailureReason::Rejected,
                format!("order {} has nothing left to fill", request.order_id),
            )),
            Some(order) => {
                deal.quantity = cmp::min(request.quantity, order.available);
                self.ensure_tradeable(&deal)
            }
        };
        let accepted = SwapAccepted {
            secret_hash,
            quantity: deal.quantity,
            price: deal.price,
        };
        let peer = deal.peer.clone();
        let pays = deal.outbound_currency().clone();
        self.insert(deal, None);

        match checked {
            Ok(amount) => {
                let step = self.steps.clone().accept(peer, accepted.into(), pays, amount);
                self.spawn_step(secret_hash, step);
            }
            Err(failure) => self.fail(secret_hash, failure, true),
        }
    }

    /// Checks that both legs of a deal can be settled and returns what we pay.
    fn ensure_tradeable(&self, deal: &SwapDeal) -> Result<Amount, Failure> {
        let invalid = |message: String| Failure::new(FailureReason::InvalidPacket, message);

        if deal.pair.counter_currency(&deal.initiator_currency) != Some(&deal.counterparty_currency)
        {
            return Err(invalid(format!(
                "{} and {} do not form the pair {}",
                deal.initiator_currency, deal.counterparty_currency, deal.pair
            )));
        }
        self.steps.resolve(&deal.initiator_currency)?;
        self.steps.resolve(&deal.counterparty_currency)?;

        if deal.quantity.is_zero() {
            return Err(invalid("quantity is zero".to_owned()));
        }
        deal.amount(deal.inbound_currency())
            .map_err(|e| invalid(e.to_string()))?;

        deal.amount(deal.outbound_currency())
            .map_err(|e| invalid(e.to_string()))
    }

    fn fresh_secret(&self) -> Secret {
        loop {
            let secret = Secret::generate();

            if !self.used.contains(&secret.hash()) {
                return secret;
            }
        }
    }

    fn new_deal(&self, secret_hash: SecretHash, role: Role, peer: PeerId, terms: Terms) -> SwapDeal {
        let created_at = Utc::now();

        SwapDeal::new(
            secret_hash,
            role,
            peer,
            terms,
            created_at,
            deadline_at(created_at, self.timeouts.deal),
        )
    }

    fn insert(&mut self, deal: SwapDeal, secret: Option<Secret>) {
        let now = Instant::now();
        let expires_at = after(now, self.timeouts.deal);
        let span = tracing::info_span!("deal", secret_hash = %deal.secret_hash, role = %deal.role);

        span.in_scope(|| {
            tracing::info!(
                "new deal with {} for {} {} at {}",
                deal.peer,
                deal.quantity,
                deal.pair,
                deal.price
            )
        });
        self.emit(DealEvent::Created {
            secret_hash: deal.secret_hash,
            role: deal.role,
            peer: deal.peer.clone(),
        });

        self.used.insert(deal.secret_hash);
        self.deals.insert(deal.secret_hash, Slot {
            deadline: cmp::min(after(now, self.timeouts.for_phase(Phase::Created)), expires_at),
            expires_at,
            secret,
            busy: false,
            inbox: VecDeque::new(),
            parked: None,
            claiming: false,
            inbound_settled: false,
            span,
            deal,
        });
    }

    fn handle_packet(&mut self, from: PeerId, packet: Packet) {
        let packet = match packet {
            Packet::SwapRequest(request) => return self.on_swap_request(from, request),
            packet => packet,
        };
        let secret_hash = packet.secret_hash();

        match self.deals.get_mut(&secret_hash) {
            None if self.used.contains(&secret_hash) => tracing::warn!(
                "dropping {} from {} for finished deal {}",
                packet.kind(),
                from,
                secret_hash
            ),
            None => tracing::warn!(
                "dropping {} from {} for unknown deal {}",
                packet.kind(),
                from,
                secret_hash
            ),
            Some(slot) if slot.deal.is_terminal() => slot.span.in_scope(|| {
                tracing::warn!("dropping {} from {}, deal is {}", packet.kind(), from, slot.deal.phase())
            }),
            Some(slot) if slot.deal.peer != from => slot.span.in_scope(|| {
                tracing::warn!("dropping {} from {} who is not part of the deal", packet.kind(), from)
            }),
            Some(slot) => {
                slot.inbox.push_back(Input::Packet(packet));
                self.pump(secret_hash);
            }
        }
    }

    fn handle_payment(&mut self, payment: IncomingPayment) {
        let secret_hash = payment.secret_hash;

        match self.deals.get_mut(&secret_hash) {
            Some(slot) if !slot.deal.is_terminal() => {
                slot.inbox.push_back(Input::Payment(payment));
                self.pump(secret_hash);
            }
            Some(slot) => slot.span.in_scope(|| {
                tracing::error!(
                    "incoming {} {} for a deal that is {}, not claiming it",
                    payment.amount,
                    payment.currency,
                    slot.deal.phase()
                )
            }),
            None if self.used.contains(&secret_hash) => tracing::error!(
                "incoming {} {} for finished deal {}, not claiming it",
                payment.amount,
                payment.currency,
                secret_hash
            ),
            None => tracing::warn!(
                "incoming {} {} locked to unknown hash {}",
                payment.amount,
                payment.currency,
                secret_hash
            ),
        }
    }

    /// Feeds queued inputs to the deal until it starts a step or runs dry.
    fn pump(&mut self, secret_hash: SecretHash) {
        loop {
            let input = match self.deals.get_mut(&secret_hash) {
                Some(slot) if !slot.busy && !slot.deal.is_terminal() => match slot.inbox.pop_front() {
                    Some(input) => input,
                    None => return,
                },
                _ => return,
            };

            self.apply(secret_hash, input);
        }
    }

    fn apply(&mut self, secret_hash: SecretHash, input: Input) {
        match input {
            Input::Packet(Packet::SwapAccepted(accepted)) => {
                self.on_swap_accepted(secret_hash, accepted)
            }
            Input::Packet(Packet::InvoiceExchange(exchange)) => {
                self.on_invoice(secret_hash, InvoiceLeg::Exchange, exchange.pay_request)
            }
            Input::Packet(Packet::InvoiceExchangeAck(ack)) => {
                self.on_invoice(secret_hash, InvoiceLeg::Ack, ack.pay_request)
            }
            Input::Packet(Packet::SwapComplete(_)) => self.in_span(secret_hash, || {
                tracing::info!("peer reports the swap as complete")
            }),
            Input::Packet(Packet::SwapFailed(failed)) => {
                self.on_peer_failed(secret_hash, failed.reason)
            }
            Input::Packet(Packet::SwapRequest(_)) => {}
            Input::Payment(payment) => self.on_payment(secret_hash, payment),
        }
    }

    fn on_swap_accepted(&mut self, secret_hash: SecretHash, accepted: SwapAccepted) {
        let slot = match self.deals.get_mut(&secret_hash) {
            Some(slot) => slot,
            None => return,
        };
        let phase = slot.deal.phase();
        if slot.deal.role != Role::Initiator || phase != Phase::AwaitingAccept {
            slot.span
                .in_scope(|| tracing::warn!("ignoring SwapAccepted while {}", phase));
            return;
        }

        let proposed = slot.deal.proposed_quantity;
        if accepted.quantity.is_zero() || accepted.quantity > proposed {
            let failure = Failure::new(
                FailureReason::InvalidPacket,
                format!(
                    "accepted quantity {} is outside of the proposed {}",
                    accepted.quantity, proposed
                ),
            );
            return self.fail(secret_hash, failure, true);
        }
        if accepted.price != slot.deal.price {
            let failure = Failure::new(
                FailureReason::InvalidPacket,
                format!(
                    "accepted price {} differs from {}",
                    accepted.price, slot.deal.price
                ),
            );
            return self.fail(secret_hash, failure, true);
        }
        slot.deal.quantity = accepted.quantity;

        if self.advance(secret_hash, Phase::Accepted) {
            self.send_invoice(secret_hash, InvoiceLeg::Exchange);
        }
    }

    /// Creates and sends the invoice for the currency we receive.
    fn send_invoice(&mut self, secret_hash: SecretHash, leg: InvoiceLeg) {
        let (peer, receives, amount, purpose) = match self.deals.get(&secret_hash) {
            Some(slot) => {
                let deal = &slot.deal;
                let receives = deal.inbound_currency().clone();
                let amount = deal.amount(&receives);
                let purpose = format!("{} {} swap {}", deal.quantity, deal.pair, secret_hash);

                (deal.peer.clone(), receives, amount, purpose)
            }
            None => return,
        };

        match amount {
            Ok(amount) => {
                let step = self
                    .steps
                    .clone()
                    .invoice(peer, leg, receives, amount, secret_hash, purpose);
                self.spawn_step(secret_hash, step);
            }
            Err(e) => self.fail(
                secret_hash,
                Failure::new(FailureReason::InvalidPacket, e.to_string()),
                true,
            ),
        }
    }

    fn on_invoice(&mut self, secret_hash: SecretHash, leg: InvoiceLeg, pay_request: PayRequest) {
        let expected_role = match leg {
            InvoiceLeg::Exchange => Role::Counterparty,
            InvoiceLeg::Ack => Role::Initiator,
        };
        let slot = match self.deals.get_mut(&secret_hash) {
            Some(slot) => slot,
            None => return,
        };
        let phase = slot.deal.phase();
        if slot.deal.role != expected_role || phase != Phase::AwaitingCounterInvoice {
            slot.span
                .in_scope(|| tracing::warn!("ignoring {:?} invoice while {}", leg, phase));
            return;
        }
        // the initiator pays the second leg only once it claimed the first
        if leg == InvoiceLeg::Ack && !slot.inbound_settled {
            slot.span.in_scope(|| {
                tracing::debug!("first leg is not claimed yet, parking the counter invoice")
            });
            slot.parked = Some(Input::Packet(
                InvoiceExchangeAck {
                    secret_hash,
                    pay_request,
                }
                .into(),
            ));
            return;
        }

        match leg {
            InvoiceLeg::Exchange => slot.deal.initiator_pay_request = Some(pay_request.clone()),
            InvoiceLeg::Ack => slot.deal.counterparty_pay_request = Some(pay_request.clone()),
        }
        let pays = slot.deal.outbound_currency().clone();
        let expected = slot
            .deal
            .amount(&pays)
            .map_err(|e| Failure::new(FailureReason::InvalidPacket, e.to_string()));

        let client = expected.and_then(|expected| {
            self.validate_invoice(secret_hash, &pays, expected, &pay_request)
        });

        match client {
            Ok(client) => {
                if self.advance(secret_hash, Phase::InvoiceValidated) {
                    self.spawn_step(secret_hash, Steps::pay(client, pay_request));
                }
            }
            Err(failure) => self.fail(secret_hash, failure, true),
        }
    }

    /// Decodes the peer's invoice and checks it against the agreed terms.
    fn validate_invoice(
        &self,
        secret_hash: SecretHash,
        pays: &Currency,
        expected: Amount,
        pay_request: &PayRequest,
    ) -> Result<RailClientHandle, Failure> {
        let client = self.steps.resolve(pays)?;
        let invoice = client
            .decode_invoice(pay_request)
            .map_err(|e| Failure::new(FailureReason::InvoiceDecodeError, e.to_string()))?;

        if invoice.secret_hash != secret_hash {
            return Err(Failure::new(
                FailureReason::HashMismatch,
                format!("invoice is locked to {}", invoice.secret_hash),
            ));
        }
        if invoice.amount != expected {
            return Err(Failure::new(
                FailureReason::AmountMismatch,
                format!(
                    "invoice asks for {} {} but {} were agreed",
                    invoice.amount, pays, expected
                ),
            ));
        }

        Ok(client)
    }

    fn on_payment(&mut self, secret_hash: SecretHash, payment: IncomingPayment) {
        let slot = match self.deals.get_mut(&secret_hash) {
            Some(slot) => slot,
            None => return,
        };

        if slot.inbound_settled {
            slot.span.in_scope(|| {
                tracing::warn!("ignoring second incoming payment of {}", payment.amount)
            });
            return;
        }
        if &payment.currency != slot.deal.inbound_currency() {
            let expected = slot.deal.inbound_currency().clone();
            slot.span.in_scope(|| {
                tracing::warn!(
                    "ignoring incoming {} payment, deal receives {}",
                    payment.currency,
                    expected
                )
            });
            return;
        }

        let expected = slot.deal.amount(&payment.currency).ok();
        if expected != Some(payment.amount) {
            let failure = Failure::new(
                FailureReason::AmountMismatch,
                format!(
                    "incoming payment of {} {} does not match the agreed terms",
                    payment.amount, payment.currency
                ),
            );
            return self.fail(secret_hash, failure, true);
        }

        let secret = match slot.deal.role {
            Role::Initiator => slot.secret,
            Role::Counterparty => slot.deal.preimage(),
        };
        let secret = match secret {
            Some(secret) => secret,
            None => {
                slot.span
                    .in_scope(|| tracing::debug!("preimage unknown, parking incoming payment"));
                slot.parked = Some(Input::Payment(payment));
                return;
            }
        };

        match self.steps.resolve(&payment.currency) {
            Ok(client) => {
                slot.claiming = true;
                self.spawn_step(secret_hash, Steps::settle(client, payment, secret))
            }
            Err(failure) => self.fail(secret_hash, failure, true),
        }
    }

    fn on_peer_failed(&mut self, secret_hash: SecretHash, reason: FailureReason) {
        let phase = match self.deals.get(&secret_hash) {
            Some(slot) => slot.deal.phase(),
            None => return,
        };

        let failure = if phase <= Phase::AwaitingAccept {
            Failure::new(
                FailureReason::Rejected,
                format!("peer rejected the swap: {}", reason),
            )
        } else {
            Failure::new(
                FailureReason::Remote,
                format!("peer aborted the swap: {}", reason),
            )
        };

        self.fail(secret_hash, failure, false);
    }

    fn handle_outcome(&mut self, secret_hash: SecretHash, outcome: Outcome) {
        let terminal = match self.deals.get_mut(&secret_hash) {
            Some(slot) => {
                slot.busy = false;
                slot.deal.is_terminal()
            }
            None => {
                tracing::error!("step finished for unknown deal {}", secret_hash);
                return;
            }
        };

        if terminal {
            self.reconcile_late(secret_hash, outcome);
            return self.retire(secret_hash);
        }

        match outcome {
            Outcome::RequestSent => {
                self.advance(secret_hash, Phase::AwaitingAccept);
            }
            Outcome::AcceptSent => {
                if self.advance(secret_hash, Phase::Accepted) {
                    self.advance(secret_hash, Phase::AwaitingCounterInvoice);
                }
            }
            Outcome::InvoiceSent(pay_request) => {
                if let Some(slot) = self.deals.get_mut(&secret_hash) {
                    slot.deal.initiator_pay_request = Some(pay_request);
                }
                self.advance(secret_hash, Phase::AwaitingCounterInvoice);
            }
            Outcome::AckSent(pay_request) => {
                if let Some(slot) = self.deals.get_mut(&secret_hash) {
                    slot.deal.counterparty_pay_request = Some(pay_request);
                }
            }
            Outcome::Paid(secret) => self.on_paid(secret_hash, secret),
            Outcome::Settled(secret) => self.on_settled(secret_hash, secret),
            Outcome::Failed(failure) => {
                let notify_peer = failure.reason != FailureReason::PeerUnreachable;
                self.fail(secret_hash, failure, notify_peer);
            }
        }

        self.pump(secret_hash);
    }

    /// Our payment went through and revealed the preimage.
    fn on_paid(&mut self, secret_hash: SecretHash, secret: Secret) {
        let role = match self.record_preimage(secret_hash, secret) {
            Some(role) => role,
            None => return,
        };

        match role {
            Role::Initiator => {
                if self.advance(secret_hash, Phase::LegTwoPaid) {
                    self.try_complete(secret_hash);
                }
            }
            Role::Counterparty => {
                if !self.advance(secret_hash, Phase::LegOnePaid) {
                    return;
                }
                self.unpark(secret_hash);
                self.send_invoice(secret_hash, InvoiceLeg::Ack);
            }
        }
    }

    /// We claimed the payment of the peer.
    fn on_settled(&mut self, secret_hash: SecretHash, secret: Secret) {
        if let Some(slot) = self.deals.get_mut(&secret_hash) {
            slot.inbound_settled = true;
        }
        let role = match self.record_preimage(secret_hash, secret) {
            Some(role) => role,
            None => return,
        };

        match role {
            Role::Initiator => {
                self.unpark(secret_hash);
                self.try_complete(secret_hash)
            }
            Role::Counterparty => {
                if self.advance(secret_hash, Phase::LegTwoPaid) {
                    self.try_complete(secret_hash);
                }
            }
        }
    }

    /// Queues the parked input in front of everything else.
    fn unpark(&mut self, secret_hash: SecretHash) {
        if let Some(slot) = self.deals.get_mut(&secret_hash) {
            if let Some(input) = slot.parked.take() {
                slot.inbox.push_front(input);
            }
        }
    }

    fn record_preimage(&mut self, secret_hash: SecretHash, secret: Secret) -> Option<Role> {
        let slot = self.deals.get_mut(&secret_hash)?;

        match slot.deal.record_preimage(secret) {
            Ok(()) => Some(slot.deal.role),
            Err(e) => {
                self.fail(
                    secret_hash,
                    Failure::new(FailureReason::HashMismatch, e.to_string()),
                    true,
                );
                None
            }
        }
    }

    /// Completes the deal once the preimage was observed on both legs.
    fn try_complete(&mut self, secret_hash: SecretHash) {
        let preimage = match self.deals.get(&secret_hash) {
            Some(slot) if slot.deal.phase() == Phase::LegTwoPaid && slot.inbound_settled => {
                slot.deal.preimage().filter(|preimage| preimage.unlocks(&secret_hash))
            }
            _ => None,
        };
        let preimage = match preimage {
            Some(preimage) => preimage,
            None => return,
        };

        if !self.advance(secret_hash, Phase::Completed) {
            return;
        }
        self.emit(DealEvent::Completed {
            secret_hash,
            preimage,
        });

        if let Some(slot) = self.deals.get(&secret_hash) {
            let (peer, span) = (slot.deal.peer.clone(), slot.span.clone());
            self.notify(peer, SwapComplete { secret_hash }.into(), span);
        }
        self.retire(secret_hash);
    }

    /// A step finished after its deal already failed.
    fn reconcile_late(&mut self, secret_hash: SecretHash, outcome: Outcome) {
        let (secret, message) = match outcome {
            Outcome::InvoiceSent(pay_request) | Outcome::AckSent(pay_request) => {
                if let Some(slot) = self.deals.get_mut(&secret_hash) {
                    match slot.deal.role {
                        Role::Initiator => slot.deal.initiator_pay_request = Some(pay_request),
                        Role::Counterparty => slot.deal.counterparty_pay_request = Some(pay_request),
                    }
                }
                return self.cancel_own_invoice(secret_hash);
            }
            Outcome::Paid(secret) => (secret, "our payment succeeded after the deal failed"),
            Outcome::Settled(secret) => (
                secret,
                "incoming payment was claimed after the deal failed",
            ),
            outcome => {
                return self.in_span(secret_hash, || {
                    tracing::debug!("discarding {:?} of finished deal", outcome)
                })
            }
        };

        if let Some(slot) = self.deals.get_mut(&secret_hash) {
            if let Err(e) = slot.deal.record_preimage(secret) {
                slot.span
                    .in_scope(|| tracing::error!("late preimage rejected: {}", e));
            }
            slot.span.in_scope(|| tracing::error!("{}", message));
        }

        self.emit(DealEvent::Anomaly {
            secret_hash,
            message: message.to_owned(),
        });
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deals
            .values()
            .filter(|slot| !slot.deal.is_terminal())
            .map(|slot| slot.deadline)
            .min()
    }

    fn expire(&mut self, now: Instant) {
        let expired = self
            .deals
            .iter()
            .filter(|(_, slot)| !slot.deal.is_terminal() && slot.deadline <= now)
            .map(|(secret_hash, slot)| (*secret_hash, slot.deal.phase()))
            .collect::<Vec<_>>();

        for (secret_hash, phase) in expired {
            let failure = Failure::new(
                FailureReason::Timeout,
                format!("deadline passed while {}", phase),
            );
            self.fail(secret_hash, failure, true);
        }
    }

    /// Moves the deal to `phase` and arms the deadline of the new phase.
    fn advance(&mut self, secret_hash: SecretHash, phase: Phase) -> bool {
        let now = Instant::now();
        let timeout = self.timeouts.for_phase(phase);
        let slot = match self.deals.get_mut(&secret_hash) {
            Some(slot) => slot,
            None => return false,
        };

        match slot.deal.advance_to(phase) {
            Ok(()) => {
                slot.deadline = cmp::min(after(now, timeout), slot.expires_at);
                slot.span.in_scope(|| tracing::info!("deal is {}", phase));
                self.emit(DealEvent::PhaseChanged { secret_hash, phase });

                true
            }
            Err(e) => {
                slot.span.in_scope(|| tracing::error!("{}", e));
                self.fail(
                    secret_hash,
                    Failure::new(FailureReason::InvalidPacket, e.to_string()),
                    true,
                );

                false
            }
        }
    }

    fn fail(&mut self, secret_hash: SecretHash, failure: Failure, notify_peer: bool) {
        let (peer, span) = match self.deals.get_mut(&secret_hash) {
            Some(slot) => {
                if slot.deal.fail(failure.clone()).is_err() {
                    return;
                }
                slot.inbox.clear();
                slot.parked = None;

                (slot.deal.peer.clone(), slot.span.clone())
            }
            None => return,
        };

        span.in_scope(|| tracing::warn!("deal failed: {}", failure));
        self.emit(DealEvent::Failed {
            secret_hash,
            failure: failure.clone(),
        });
        self.cancel_own_invoice(secret_hash);

        if notify_peer {
            let packet = SwapFailed {
                secret_hash,
                reason: failure.reason,
            };
            self.notify(peer, packet.into(), span);
        }
        self.retire(secret_hash);
    }

    /// Withdraws our invoice of a failed deal as long as no leg moved.
    fn cancel_own_invoice(&self, secret_hash: SecretHash) {
        let (receives, span) = match self.deals.get(&secret_hash) {
            Some(slot)
                if slot.deal.own_pay_request().is_some()
                    && slot.deal.preimage().is_none()
                    && !slot.claiming
                    && !slot.inbound_settled =>
            {
                (slot.deal.inbound_currency().clone(), slot.span.clone())
            }
            _ => return,
        };

        match self.steps.resolve(&receives) {
            Ok(client) => {
                tokio::spawn(Steps::cancel_invoice(client, secret_hash).instrument(span));
            }
            Err(failure) => {
                span.in_scope(|| tracing::warn!("cannot cancel our invoice: {}", failure))
            }
        }
    }

    /// Moves a finished deal to the repository, once no step is outstanding
    /// anymore.
    fn retire(&mut self, secret_hash: SecretHash) {
        let busy = match self.deals.get(&secret_hash) {
            Some(slot) if slot.deal.is_terminal() => {
                if let Err(e) = self.repository.save(&slot.deal) {
                    slot.span
                        .in_scope(|| tracing::error!("failed to save deal: {:#}", e));
                }
                slot.busy
            }
            _ => return,
        };

        if !busy {
            self.deals.remove(&secret_hash);
        }
    }

    fn load(&self, secret_hash: SecretHash) -> Option<SwapDeal> {
        self.repository.load(&secret_hash).unwrap_or_else(|e| {
            tracing::error!("failed to load deal {}: {:#}", secret_hash, e);
            None
        })
    }

    fn spawn_step<F>(&mut self, secret_hash: SecretHash, step: F)
    where
        F: Future<Output = Result<Outcome, Failure>> + Send + 'static,
    {
        let span = match self.deals.get_mut(&secret_hash) {
            Some(slot) => {
                slot.busy = true;
                slot.span.clone()
            }
            None => return,
        };

        self.pending.push(
            async move { (secret_hash, step.await.unwrap_or_else(Outcome::Failed)) }
                .instrument(span)
                .boxed(),
        );
    }

    /// Sends a packet without waiting for, or depending on, the result.
    fn notify(&self, peer: PeerId, packet: Packet, span: tracing::Span) {
        let transport = self.steps.transport.clone();

        tokio::spawn(
            async move {
                let kind = packet.kind();
                if let Err(e) = transport.send(&peer, packet).await {
                    tracing::warn!("failed to send {}: {}", kind, e);
                }
            }
            .instrument(span),
        );
    }

    fn in_span(&self, secret_hash: SecretHash, f: impl FnOnce()) {
        match self.deals.get(&secret_hash) {
            Some(slot) => slot.span.in_scope(f),
            None => f(),
        }
    }

    fn emit(&self, event: DealEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn deal_deadline_is_creation_plus_lifetime() {
        let created_at = Utc.ymd(2020, 6, 1).and_hms(12, 0, 0);

        let deadline = deadline_at(created_at, Duration::from_secs(300));

        assert_eq!(deadline, Utc.ymd(2020, 6, 1).and_hms(12, 5, 0));
    }

    #[test]
    fn unrepresentable_lifetime_saturates() {
        let deadline = deadline_at(Utc::now(), Duration::from_secs(u64::MAX));

        assert_eq!(deadline, DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_timeouts_do_not_overflow_the_clock() {
        let now = Instant::now();

        assert!(after(now, Duration::from_secs(u64::MAX)) > now);
        assert_eq!(after(now, Duration::from_secs(5)), now + Duration::from_secs(5));
    }
}
