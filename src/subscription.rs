//! Broker subscription: receive loop and acknowledgment reconciliation.
//!
//! A [`Subscription`] runs two background tasks:
//!
//! * The **receive loop** pulls frames from the transport, parses event
//!   messages into [`InboundEvent`]s numbered in arrival order, registers
//!   each one with the reconciler, and hands it to readers through a
//!   bounded channel. Bad frames are reported and skipped; a transport
//!   failure closes the subscription.
//! * The **reconciler** exclusively owns the pending-acknowledgment queue.
//!   Entries are resolved in any order, but the broker is only ever
//!   acknowledged for the longest resolved prefix of the queue, so acks go
//!   out in arrival order.
//!
//! Both tasks talk to the handle through channels only.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::config::SubscriptionConfig;
use crate::error::{SubscriptionError, TransportError};
use crate::event::{EventId, InboundEvent, decode_frame_body};
use crate::settlement::Outcome;
use crate::transport::{Frame, FrameStream, SubscriptionRequest, Transport};

/// Lifecycle of a subscription. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Receiving events.
    Active,
    /// Unsubscribe requested; the receive loop is stopped. A subscription
    /// whose broker unsubscribe failed stays here.
    Unsubscribing,
    /// Unsubscribed or disconnected.
    Closed,
}

/// Messages handled by the reconciler task.
enum ReconcilerMessage {
    /// Append an unresolved entry for a newly received event.
    Track {
        event_id: EventId,
        ack_token: String,
    },
    /// Mark the event resolved and acknowledge the resolved prefix.
    Resolve { event_id: EventId },
    /// Drop the entry of a tracked event that was never handed out.
    Forget { event_id: EventId },
    /// Report the number of entries not yet acknowledged.
    PendingCount { reply: oneshot::Sender<usize> },
    /// Stop the reconciler.
    Shutdown,
}

/// A live broker subscription.
///
/// Read events with [`read_event`](Self::read_event) and confirm each one
/// with [`acknowledge_event`](Self::acknowledge_event) once it has been
/// handled. Errors from the receive loop, the broker, or handlers arrive
/// on a separate error stream read with [`next_error`](Self::next_error).
///
/// Dropping the subscription stops its receive loop without telling the
/// broker; call [`unsubscribe`](Self::unsubscribe) first.
pub struct Subscription {
    request: SubscriptionRequest,
    transport: Arc<dyn Transport>,
    state: Arc<watch::Sender<SubscriptionState>>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<InboundEvent>>,
    errors: ErrorSink,
    /// Only locked for a `try_recv`, never across an await.
    error_rx: Mutex<mpsc::UnboundedReceiver<SubscriptionError>>,
    reconciler: mpsc::UnboundedSender<ReconcilerMessage>,
    receive_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    /// Subscribe through `transport` and start the background tasks.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Transport`] if the broker subscribe
    /// call fails.
    pub(crate) async fn open(
        transport: Arc<dyn Transport>,
        request: SubscriptionRequest,
        config: &SubscriptionConfig,
    ) -> Result<Self, SubscriptionError> {
        let frames = transport.subscribe(&request).await?;
        let subscription_id = request.subscription_id;

        let (state, _) = watch::channel(SubscriptionState::Active);
        let state = Arc::new(state);
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let errors = ErrorSink {
            tx: error_tx,
            reported: Arc::new(Notify::new()),
            subscription_id,
        };
        let (reconciler, reconciler_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(config.incoming_capacity.max(1));

        tokio::spawn(run_reconciler(
            Arc::clone(&transport),
            reconciler_rx,
            errors.clone(),
            subscription_id,
        ));
        let receive_task = tokio::spawn(run_receive_loop(ReceiveLoop {
            frames,
            incoming: incoming_tx,
            reconciler: reconciler.clone(),
            errors: errors.clone(),
            state: Arc::clone(&state),
            subscription_id,
        }));

        tracing::info!(
            subscription_id = %subscription_id,
            subscriber_id = %request.subscriber_id,
            space = %request.space,
            "subscribed"
        );

        Ok(Self {
            request,
            transport,
            state,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            errors,
            error_rx: Mutex::new(error_rx),
            reconciler,
            receive_task: tokio::sync::Mutex::new(Some(receive_task)),
        })
    }

    /// Returns this subscription's id.
    pub fn id(&self) -> Uuid {
        self.request.subscription_id
    }

    /// Returns the request this subscription was opened with.
    pub fn request(&self) -> &SubscriptionRequest {
        &self.request
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Returns `true` while the subscription is receiving events.
    pub fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Active
    }

    /// Wait for the next event.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Closed`] once the receive loop has
    /// stopped and every received event has been read.
    pub async fn read_event(&self) -> Result<InboundEvent, SubscriptionError> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or(SubscriptionError::Closed)
    }

    /// Take the next pending error or event without waiting.
    ///
    /// Errors are reported before events, even while a
    /// [`next_error`](Self::next_error) call is waiting. Returns `None` when
    /// nothing is ready, or when a [`read_event`](Self::read_event) call
    /// currently holds the event stream.
    pub fn read_event_nonblocking(&self) -> Option<Result<InboundEvent, SubscriptionError>> {
        if let Some(err) = self.try_next_error() {
            return Some(Err(err));
        }

        let mut incoming = self.incoming.try_lock().ok()?;
        match incoming.try_recv() {
            Ok(event) => Some(Ok(event)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => Some(Err(SubscriptionError::Closed)),
        }
    }

    /// Wait for the next error on the error stream.
    ///
    /// Returns `None` once the subscription is no longer active and every
    /// queued error has been read.
    pub async fn next_error(&self) -> Option<SubscriptionError> {
        let mut state = self.state.subscribe();
        loop {
            let reported = self.errors.reported.notified();
            tokio::pin!(reported);
            reported.as_mut().enable();

            // Read the state first: errors reported before a close are
            // then already queued.
            let active = *state.borrow_and_update() == SubscriptionState::Active;
            if let Some(err) = self.try_next_error() {
                return Some(err);
            }
            if !active {
                return None;
            }
            tokio::select! {
                _ = reported => {}
                _ = state.changed() => {}
            }
        }
    }

    fn try_next_error(&self) -> Option<SubscriptionError> {
        self.error_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
            .ok()
    }

    /// Mark the event handled so it can be acknowledged to the broker.
    ///
    /// The broker is acknowledged once this event and every event received
    /// before it have been marked. Unknown ids are logged and ignored.
    pub fn acknowledge_event(&self, event_id: &EventId) {
        let message = ReconcilerMessage::Resolve {
            event_id: event_id.clone(),
        };
        if self.reconciler.send(message).is_err() {
            tracing::debug!(
                subscription_id = %self.id(),
                event_id = %event_id,
                "acknowledge after reconciler stopped"
            );
        }
    }

    /// Number of received events not yet acknowledged to the broker.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Closed`] after the subscription has
    /// been unsubscribed.
    pub async fn fetch_pending_count(&self) -> Result<usize, SubscriptionError> {
        let (reply, rx) = oneshot::channel();
        self.reconciler
            .send(ReconcilerMessage::PendingCount { reply })
            .map_err(|_| SubscriptionError::Closed)?;
        rx.await.map_err(|_| SubscriptionError::Closed)
    }

    /// Stop receiving and cancel the subscription at the broker.
    ///
    /// Stops the receive loop, then calls the broker. Only when the broker
    /// call succeeds does the subscription become
    /// [`Closed`](SubscriptionState::Closed) and its reconciler stop.
    /// Handlers already running are not interrupted, but events they finish
    /// after that point are not acknowledged to the broker.
    ///
    /// Calling `unsubscribe` on a subscription that is no longer active is
    /// a no-op returning `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Transport`] if the broker rejects the
    /// unsubscribe. The subscription stays inactive.
    pub async fn unsubscribe(&self) -> Result<(), SubscriptionError> {
        let began = self.state.send_if_modified(|state| {
            if *state == SubscriptionState::Active {
                *state = SubscriptionState::Unsubscribing;
                true
            } else {
                false
            }
        });
        if !began {
            return Ok(());
        }

        let task = self.receive_task.lock().await.take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::error!(subscription_id = %self.id(), error = %e, "receive loop panicked");
        }

        if let Err(e) = self.transport.unsubscribe(&self.request).await {
            tracing::error!(subscription_id = %self.id(), error = %e, "unsubscribe failed");
            return Err(e.into());
        }

        self.state.send_replace(SubscriptionState::Closed);
        let _ = self.reconciler.send(ReconcilerMessage::Shutdown);
        tracing::info!(subscription_id = %self.id(), "unsubscribed");
        Ok(())
    }

    /// Handle used by dispatch to resolve events and report handler
    /// failures.
    pub(crate) fn resolver(&self) -> Resolver {
        Resolver {
            reconciler: self.reconciler.clone(),
            errors: self.errors.clone(),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.receive_task.get_mut().take() {
            task.abort();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id())
            .field("subscriber_id", &self.request.subscriber_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Reports a handled event's outcome back to its subscription.
#[derive(Clone)]
pub(crate) struct Resolver {
    reconciler: mpsc::UnboundedSender<ReconcilerMessage>,
    errors: ErrorSink,
}

impl Resolver {
    /// Surface a failed outcome on the error stream, then mark the event
    /// resolved. Failed events are acknowledged like successful ones.
    pub(crate) fn complete<T>(&self, event_id: EventId, outcome: &Outcome<T>) {
        if let Err(e) = outcome {
            self.errors.report(SubscriptionError::Handler {
                event_id: event_id.clone(),
                source: e.clone(),
            });
        }
        let message = ReconcilerMessage::Resolve {
            event_id: event_id.clone(),
        };
        if self.reconciler.send(message).is_err() {
            tracing::debug!(
                subscription_id = %self.errors.subscription_id,
                event_id = %event_id,
                "handler finished after unsubscribe; not acknowledged"
            );
        }
    }
}

/// Sending half of the error stream.
#[derive(Clone)]
struct ErrorSink {
    tx: mpsc::UnboundedSender<SubscriptionError>,
    reported: Arc<Notify>,
    subscription_id: Uuid,
}

impl ErrorSink {
    fn report(&self, err: SubscriptionError) {
        tracing::error!(subscription_id = %self.subscription_id, error = %err, "subscription error");
        // The receiver lives as long as the subscription handle.
        let _ = self.tx.send(err);
        self.reported.notify_waiters();
    }
}

struct ReceiveLoop {
    frames: FrameStream,
    incoming: mpsc::Sender<InboundEvent>,
    reconciler: mpsc::UnboundedSender<ReconcilerMessage>,
    errors: ErrorSink,
    state: Arc<watch::Sender<SubscriptionState>>,
    subscription_id: Uuid,
}

async fn run_receive_loop(mut ctx: ReceiveLoop) {
    let mut stopping = ctx.state.subscribe();
    let mut sequence: u64 = 0;

    loop {
        let next = tokio::select! {
            _ = stopping.wait_for(|s| *s != SubscriptionState::Active) => break,
            next = ctx.frames.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                connection_lost(&ctx, e);
                break;
            }
            None => {
                connection_lost(
                    &ctx,
                    TransportError::ConnectionLost("frame stream ended".to_string()),
                );
                break;
            }
        };

        let (ack_token, body) = match frame {
            Frame::Message { ack_token, body } => (ack_token, body),
            Frame::Other { command } => {
                ctx.errors.report(SubscriptionError::BadFrame { command });
                continue;
            }
        };

        let event = match decode_frame_body(&body, ack_token, sequence) {
            Ok(event) => event,
            Err(e) => {
                ctx.errors.report(SubscriptionError::Malformed(e.to_string()));
                continue;
            }
        };
        sequence += 1;

        tracing::trace!(
            subscription_id = %ctx.subscription_id,
            event_id = %event.id(),
            sequence = event.sequence,
            "event received"
        );

        // Track before handing the event out so its resolve can never
        // overtake it at the reconciler.
        let event_id = event.id().clone();
        let track = ReconcilerMessage::Track {
            event_id: event_id.clone(),
            ack_token: event.ack_token.clone(),
        };
        if ctx.reconciler.send(track).is_err() {
            break;
        }

        let delivered = tokio::select! {
            _ = stopping.wait_for(|s| *s != SubscriptionState::Active) => false,
            sent = ctx.incoming.send(event) => sent.is_ok(),
        };
        if !delivered {
            tracing::debug!(
                subscription_id = %ctx.subscription_id,
                event_id = %event_id,
                "stopped before hand-off; event untracked"
            );
            let _ = ctx.reconciler.send(ReconcilerMessage::Forget { event_id });
            break;
        }
    }

    tracing::debug!(subscription_id = %ctx.subscription_id, "receive loop stopped");
}

fn connection_lost(ctx: &ReceiveLoop, err: TransportError) {
    ctx.errors.report(SubscriptionError::Transport(err));
    ctx.state.send_if_modified(|state| {
        if *state == SubscriptionState::Active {
            *state = SubscriptionState::Closed;
            true
        } else {
            false
        }
    });
}

struct PendingAck {
    event_id: EventId,
    ack_token: String,
    resolved: bool,
}

/// Pending-acknowledgment queue in arrival order.
#[derive(Default)]
struct PendingAcks {
    entries: VecDeque<PendingAck>,
}

impl PendingAcks {
    fn track(&mut self, event_id: EventId, ack_token: String) {
        self.entries.push_back(PendingAck {
            event_id,
            ack_token,
            resolved: false,
        });
    }

    /// Mark the oldest unresolved entry for `event_id`. Returns `false` if
    /// there is none.
    fn mark_resolved(&mut self, event_id: &EventId) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|entry| !entry.resolved && entry.event_id == *event_id)
        {
            Some(entry) => {
                entry.resolved = true;
                true
            }
            None => false,
        }
    }

    /// Remove the newest unresolved entry for `event_id`. Returns `false`
    /// if there is none.
    fn forget(&mut self, event_id: &EventId) -> bool {
        match self
            .entries
            .iter()
            .rposition(|entry| !entry.resolved && entry.event_id == *event_id)
        {
            Some(index) => self.entries.remove(index).is_some(),
            None => false,
        }
    }

    /// Remove and return the longest fully resolved prefix.
    fn take_resolved_prefix(&mut self) -> Vec<PendingAck> {
        let ready = self
            .entries
            .iter()
            .take_while(|entry| entry.resolved)
            .count();
        self.entries.drain(..ready).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// One mark per entry: `*` for `just_resolved`, `+` resolved, `-` not.
    fn progress_marks(&self, just_resolved: &EventId) -> String {
        self.entries
            .iter()
            .map(|entry| {
                if entry.event_id == *just_resolved {
                    '*'
                } else if entry.resolved {
                    '+'
                } else {
                    '-'
                }
            })
            .collect()
    }
}

async fn run_reconciler(
    transport: Arc<dyn Transport>,
    mut rx: mpsc::UnboundedReceiver<ReconcilerMessage>,
    errors: ErrorSink,
    subscription_id: Uuid,
) {
    let mut pending = PendingAcks::default();

    while let Some(message) = rx.recv().await {
        match message {
            ReconcilerMessage::Track {
                event_id,
                ack_token,
            } => pending.track(event_id, ack_token),
            ReconcilerMessage::Resolve { event_id } => {
                if !pending.mark_resolved(&event_id) {
                    tracing::warn!(
                        subscription_id = %subscription_id,
                        event_id = %event_id,
                        "resolve for unknown event ignored"
                    );
                    continue;
                }
                tracing::trace!(
                    subscription_id = %subscription_id,
                    event_id = %event_id,
                    pending = %pending.progress_marks(&event_id),
                    "event resolved"
                );
                for entry in pending.take_resolved_prefix() {
                    match transport.ack(&entry.ack_token).await {
                        Ok(()) => tracing::trace!(
                            subscription_id = %subscription_id,
                            event_id = %entry.event_id,
                            "acknowledged"
                        ),
                        Err(e) => errors.report(SubscriptionError::Ack {
                            ack_token: entry.ack_token,
                            source: e,
                        }),
                    }
                }
            }
            ReconcilerMessage::Forget { event_id } => {
                pending.forget(&event_id);
            }
            ReconcilerMessage::PendingCount { reply } => {
                let _ = reply.send(pending.len());
            }
            ReconcilerMessage::Shutdown => break,
        }
    }

    tracing::debug!(
        subscription_id = %subscription_id,
        unacknowledged = pending.len(),
        "reconciler stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use crate::config::SubscriberOptions;
    use crate::event::test_fixtures::wire_event;
    use crate::transport::InMemoryTransport;

    fn request() -> SubscriptionRequest {
        SubscriptionRequest::new(
            "subscriber-1",
            BTreeMap::from([("Account".to_string(), vec!["AccountOpened".to_string()])]),
            "default",
            SubscriberOptions::default(),
        )
    }

    async fn open(transport: &InMemoryTransport) -> Subscription {
        Subscription::open(
            Arc::new(transport.clone()),
            request(),
            &SubscriptionConfig::default(),
        )
        .await
        .expect("subscribe should succeed")
    }

    fn publish(transport: &InMemoryTransport, id: &str) -> String {
        transport
            .publish(&wire_event(id, "net.example.accounts/Account", "AccountOpened", 0))
            .expect("publish should succeed")
    }

    async fn poll_nonblocking(sub: &Subscription) -> Result<InboundEvent, SubscriptionError> {
        loop {
            if let Some(result) = sub.read_event_nonblocking() {
                return result;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn events_are_numbered_in_arrival_order() {
        let transport = InMemoryTransport::new();
        let t1 = publish(&transport, "e1");
        publish(&transport, "e2");
        let sub = open(&transport).await;

        let e1 = sub.read_event().await.expect("first event");
        let e2 = sub.read_event().await.expect("second event");

        assert_eq!(e1.id().as_str(), "e1");
        assert_eq!(e1.sequence, 0);
        assert_eq!(e1.ack_token, t1);
        assert_eq!(e1.metadata.entity_type, "Account");
        assert_eq!(e2.id().as_str(), "e2");
        assert_eq!(e2.sequence, 1);
        assert!(sub.is_active());
    }

    #[tokio::test]
    async fn acks_follow_arrival_order() {
        let transport = InMemoryTransport::new();
        let t1 = publish(&transport, "e1");
        let t2 = publish(&transport, "e2");
        let t3 = publish(&transport, "e3");
        let sub = open(&transport).await;

        let e1 = sub.read_event().await.expect("e1");
        let e2 = sub.read_event().await.expect("e2");
        let e3 = sub.read_event().await.expect("e3");

        sub.acknowledge_event(e2.id());
        assert_eq!(sub.fetch_pending_count().await.expect("count"), 3);
        assert!(transport.acked_tokens().is_empty(), "e2 must wait for e1");

        sub.acknowledge_event(e1.id());
        assert_eq!(sub.fetch_pending_count().await.expect("count"), 1);
        assert_eq!(transport.acked_tokens(), vec![t1.clone(), t2.clone()]);

        sub.acknowledge_event(e3.id());
        assert_eq!(sub.fetch_pending_count().await.expect("count"), 0);
        assert_eq!(transport.acked_tokens(), vec![t1, t2, t3]);
    }

    #[tokio::test]
    async fn unknown_resolve_is_ignored() {
        let transport = InMemoryTransport::new();
        publish(&transport, "e1");
        let sub = open(&transport).await;
        let e1 = sub.read_event().await.expect("e1");

        sub.acknowledge_event(&EventId::from("never-received"));
        assert_eq!(sub.fetch_pending_count().await.expect("count"), 1);

        sub.acknowledge_event(e1.id());
        sub.acknowledge_event(e1.id());
        assert_eq!(sub.fetch_pending_count().await.expect("count"), 0);
        assert_eq!(transport.acked_tokens().len(), 1, "acked exactly once");
    }

    #[tokio::test]
    async fn bad_frames_are_reported_before_later_events() {
        let transport = InMemoryTransport::new();
        publish(&transport, "e1");
        transport.push_frame(Frame::Other {
            command: "ERROR".to_string(),
        });
        publish(&transport, "e2");
        let sub = open(&transport).await;

        let e1 = sub.read_event().await.expect("e1");
        assert_eq!(e1.id().as_str(), "e1");

        let err = poll_nonblocking(&sub).await.expect_err("bad frame first");
        assert!(
            matches!(&err, SubscriptionError::BadFrame { command } if command == "ERROR"),
            "expected BadFrame, got: {err:?}"
        );
        let e2 = poll_nonblocking(&sub).await.expect("then e2");
        assert_eq!(e2.id().as_str(), "e2");
        assert!(sub.read_event_nonblocking().is_none());
        assert!(sub.is_active());
    }

    #[tokio::test]
    async fn malformed_body_is_skipped_without_consuming_a_sequence() {
        let transport = InMemoryTransport::new();
        transport.push_frame(Frame::Message {
            ack_token: "garbage".to_string(),
            body: b"not json".to_vec(),
        });
        publish(&transport, "e1");
        let sub = open(&transport).await;

        let e1 = sub.read_event().await.expect("e1");
        assert_eq!(e1.sequence, 0);
        let err = sub.next_error().await.expect("error reported");
        assert!(matches!(err, SubscriptionError::Malformed(_)));
        assert_eq!(sub.fetch_pending_count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn connection_loss_closes_subscription() {
        let transport = InMemoryTransport::new();
        publish(&transport, "e1");
        let sub = open(&transport).await;
        sub.read_event().await.expect("e1");

        transport.sever("reset by peer");

        let err = sub.next_error().await.expect("transport error");
        assert!(
            matches!(
                &err,
                SubscriptionError::Transport(TransportError::ConnectionLost(reason)) if reason == "reset by peer"
            ),
            "expected ConnectionLost, got: {err:?}"
        );
        let err = sub.read_event().await.expect_err("closed");
        assert!(matches!(err, SubscriptionError::Closed));
        assert_eq!(sub.state(), SubscriptionState::Closed);

        sub.unsubscribe().await.expect("no-op on closed subscription");
        assert!(transport.unsubscribed().is_empty());
        assert!(sub.next_error().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_closes_and_is_idempotent() {
        let transport = InMemoryTransport::new();
        let sub = open(&transport).await;

        sub.unsubscribe().await.expect("unsubscribe");

        assert_eq!(sub.state(), SubscriptionState::Closed);
        assert!(!sub.is_active());
        assert_eq!(transport.unsubscribed(), vec![sub.id()]);
        let err = sub.read_event().await.expect_err("closed");
        assert!(matches!(err, SubscriptionError::Closed));
        assert!(matches!(
            sub.fetch_pending_count().await,
            Err(SubscriptionError::Closed)
        ));

        sub.unsubscribe().await.expect("second unsubscribe is a no-op");
        assert_eq!(transport.unsubscribed().len(), 1);
    }

    #[tokio::test]
    async fn failed_unsubscribe_leaves_subscription_inactive() {
        let transport = InMemoryTransport::new();
        let sub = open(&transport).await;
        transport.fail_unsubscribe(true);

        let err = sub.unsubscribe().await.expect_err("broker rejects");
        assert!(matches!(
            err,
            SubscriptionError::Transport(TransportError::Rejected(_))
        ));
        assert_eq!(sub.state(), SubscriptionState::Unsubscribing);
        assert!(!sub.is_active());

        sub.unsubscribe().await.expect("later calls are no-ops");
        assert!(transport.unsubscribed().is_empty());
    }

    #[tokio::test]
    async fn event_stopped_before_hand_off_is_untracked() {
        let transport = InMemoryTransport::new();
        let t1 = publish(&transport, "e1");
        publish(&transport, "e2");
        publish(&transport, "e3");
        transport.fail_unsubscribe(true);
        let config = SubscriptionConfig {
            incoming_capacity: 1,
            ..SubscriptionConfig::default()
        };
        let sub = Subscription::open(Arc::new(transport.clone()), request(), &config)
            .await
            .expect("subscribe should succeed");

        // e1 fills the incoming channel; e2 is tracked and waits for room.
        while sub.fetch_pending_count().await.expect("count") < 2 {
            tokio::task::yield_now().await;
        }

        sub.unsubscribe().await.expect_err("broker rejects");
        assert_eq!(sub.state(), SubscriptionState::Unsubscribing);

        let e1 = sub.read_event().await.expect("e1 was handed out");
        sub.acknowledge_event(e1.id());
        assert_eq!(sub.fetch_pending_count().await.expect("count"), 0);
        assert_eq!(transport.acked_tokens(), vec![t1]);
        assert!(matches!(
            sub.read_event().await,
            Err(SubscriptionError::Closed)
        ));
    }

    #[tokio::test]
    async fn nonblocking_read_sees_errors_while_next_error_waits() {
        let transport = InMemoryTransport::new();
        let sub = open(&transport).await;

        let waiting = sub.next_error();
        tokio::pin!(waiting);
        assert!(futures::poll!(waiting.as_mut()).is_pending());

        transport.push_frame(Frame::Other {
            command: "RECEIPT".to_string(),
        });

        let err = poll_nonblocking(&sub).await.expect_err("queued error");
        assert!(
            matches!(&err, SubscriptionError::BadFrame { command } if command == "RECEIPT"),
            "expected BadFrame, got: {err:?}"
        );
    }

    #[tokio::test]
    async fn rejected_ack_is_reported_and_not_retried() {
        let transport = InMemoryTransport::new();
        let t1 = publish(&transport, "e1");
        let t2 = publish(&transport, "e2");
        transport.reject_ack(&t1);
        let sub = open(&transport).await;

        let e1 = sub.read_event().await.expect("e1");
        let e2 = sub.read_event().await.expect("e2");
        sub.acknowledge_event(e1.id());
        sub.acknowledge_event(e2.id());

        assert_eq!(sub.fetch_pending_count().await.expect("count"), 0);
        let err = sub.next_error().await.expect("ack error");
        assert!(
            matches!(&err, SubscriptionError::Ack { ack_token, .. } if *ack_token == t1),
            "expected Ack error, got: {err:?}"
        );
        assert_eq!(transport.acked_tokens(), vec![t2]);
    }

    #[tokio::test]
    async fn subscribe_failure_is_a_transport_error() {
        struct Refusing;

        #[async_trait::async_trait]
        impl Transport for Refusing {
            async fn subscribe(&self, _: &SubscriptionRequest) -> Result<FrameStream, TransportError> {
                Err(TransportError::Rejected("no such space".to_string()))
            }
            async fn ack(&self, _: &str) -> Result<(), TransportError> {
                Ok(())
            }
            async fn unsubscribe(&self, _: &SubscriptionRequest) -> Result<(), TransportError> {
                Ok(())
            }
        }

        let err = Subscription::open(Arc::new(Refusing), request(), &SubscriptionConfig::default())
            .await
            .expect_err("subscribe should fail");
        assert!(matches!(err, SubscriptionError::Transport(_)));
    }

    #[test]
    fn pending_acks_release_only_resolved_prefix() {
        let mut pending = PendingAcks::default();
        for id in ["e1", "e2", "e3"] {
            pending.track(EventId::from(id), format!("ack-{id}"));
        }

        assert!(pending.mark_resolved(&EventId::from("e2")));
        assert_eq!(pending.progress_marks(&EventId::from("e2")), "-*-");
        assert!(pending.take_resolved_prefix().is_empty());

        assert!(pending.mark_resolved(&EventId::from("e1")));
        assert_eq!(pending.progress_marks(&EventId::from("e1")), "*+-");
        let released: Vec<String> = pending
            .take_resolved_prefix()
            .into_iter()
            .map(|entry| entry.ack_token)
            .collect();
        assert_eq!(released, vec!["ack-e1", "ack-e2"]);
        assert_eq!(pending.len(), 1);

        assert!(!pending.mark_resolved(&EventId::from("e1")));
    }

    #[test]
    fn forget_drops_only_the_unresolved_entry() {
        let mut pending = PendingAcks::default();
        pending.track(EventId::from("e1"), "ack-e1".to_string());
        pending.track(EventId::from("e2"), "ack-e2".to_string());
        assert!(pending.mark_resolved(&EventId::from("e1")));

        assert!(!pending.forget(&EventId::from("e1")));
        assert!(pending.forget(&EventId::from("e2")));
        assert!(!pending.forget(&EventId::from("e2")));
        assert_eq!(pending.len(), 1);
    }
}
