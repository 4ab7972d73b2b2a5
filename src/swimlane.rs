//! Per-`(entity type, swimlane)` serial dispatch.
//!
//! Each active key owns a bounded queue and exactly one worker task. The
//! worker runs one handler at a time and waits for its settlement before
//! taking the next item, so events sharing a key are handled in submission
//! order while distinct keys run concurrently. A lane is created on the
//! first event for its key and torn down once its queue drains.
//!
//! Lane lifecycle is tracked in a mutex-protected table. A submitter
//! reserves a slot (creating the lane if needed) under the lock before it
//! sends; the worker releases the slot under the same lock after the
//! handler settles and removes the lane only when no reservation is
//! outstanding. An arrival racing with a drain therefore either joins the
//! live lane or finds the entry gone and starts a fresh one.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::dispatcher::{DirectDispatcher, Dispatcher};
use crate::error::SettlementError;
use crate::event::InboundEvent;
use crate::registry::HandlerRegistry;
use crate::settlement::Settlement;

/// Default bound of each lane's queue.
pub const DEFAULT_LANE_CAPACITY: usize = 16;

type LaneKey = (String, u32);

struct LaneItem {
    event: InboundEvent,
    settlement: Settlement<Value>,
}

struct Lane {
    tx: mpsc::Sender<LaneItem>,
    /// Items reserved, queued, or running on this lane.
    pending: usize,
    generation: u64,
}

#[derive(Default)]
struct LaneTable {
    lanes: HashMap<LaneKey, Lane>,
    next_generation: u64,
}

/// Dispatcher that serializes handlers per `(entity type, swimlane)`.
///
/// `Clone` is cheap; clones share the lane table.
#[derive(Clone)]
pub struct SwimlaneDispatcher {
    direct: DirectDispatcher,
    lanes: Arc<Mutex<LaneTable>>,
    capacity: usize,
}

impl SwimlaneDispatcher {
    /// Create a swimlane dispatcher with the default lane capacity.
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self::with_capacity(registry, DEFAULT_LANE_CAPACITY)
    }

    /// Create a swimlane dispatcher whose lane queues hold `capacity` items.
    ///
    /// A capacity of zero is raised to one.
    pub fn with_capacity(registry: Arc<HandlerRegistry>, capacity: usize) -> Self {
        Self {
            direct: DirectDispatcher::new(registry),
            lanes: Arc::new(Mutex::new(LaneTable::default())),
            capacity: capacity.max(1),
        }
    }

    /// Number of lanes currently alive.
    pub fn lane_count(&self) -> usize {
        lock(&self.lanes).lanes.len()
    }

    /// Reserve a slot on the lane for `key`, creating the lane (and its
    /// worker) if none is alive.
    fn reserve(&self, key: &LaneKey) -> (mpsc::Sender<LaneItem>, u64) {
        let mut table = lock(&self.lanes);
        if let Some(lane) = table.lanes.get_mut(key) {
            lane.pending += 1;
            return (lane.tx.clone(), lane.generation);
        }

        let generation = table.next_generation;
        table.next_generation += 1;
        let (tx, rx) = mpsc::channel(self.capacity);
        table.lanes.insert(
            key.clone(),
            Lane {
                tx: tx.clone(),
                pending: 1,
                generation,
            },
        );
        drop(table);

        tracing::debug!(
            entity_type = %key.0,
            swimlane = key.1,
            generation,
            "swimlane worker started"
        );
        tokio::spawn(run_lane(
            self.direct.clone(),
            Arc::clone(&self.lanes),
            key.clone(),
            generation,
            rx,
        ));
        (tx, generation)
    }
}

impl fmt::Debug for SwimlaneDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwimlaneDispatcher")
            .field("capacity", &self.capacity)
            .field("lanes", &self.lane_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Dispatcher for SwimlaneDispatcher {
    /// Queue `event` on its lane and return a settlement for its outcome.
    ///
    /// Waits only while the lane's queue is full.
    async fn dispatch(&self, event: InboundEvent) -> Settlement<Value> {
        let key = (event.metadata.entity_type.clone(), event.metadata.swimlane);
        let (tx, generation) = self.reserve(&key);
        let mut reservation = Reservation {
            lanes: &self.lanes,
            key: &key,
            generation,
            armed: true,
        };

        let settlement = Settlement::pending();
        let item = LaneItem {
            event,
            settlement: settlement.clone(),
        };
        if tx.send(item).await.is_ok() {
            // The worker owns the slot from here on.
            reservation.armed = false;
        } else {
            tracing::error!(
                entity_type = %key.0,
                swimlane = key.1,
                "swimlane worker gone before accepting event"
            );
            settlement.settle(Err(SettlementError::LaneClosed {
                entity_type: key.0.clone(),
                swimlane: key.1,
            }));
        }
        settlement
    }
}

/// Returns an unsent slot to its lane when a dispatch is cancelled or fails.
struct Reservation<'a> {
    lanes: &'a Arc<Mutex<LaneTable>>,
    key: &'a LaneKey,
    generation: u64,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            release(self.lanes, self.key, self.generation);
        }
    }
}

/// Give back one slot. Returns `true` if the lane was removed.
fn release(lanes: &Mutex<LaneTable>, key: &LaneKey, generation: u64) -> bool {
    let mut table = lock(lanes);
    let Some(lane) = table.lanes.get_mut(key) else {
        return true;
    };
    if lane.generation != generation {
        // Our lane is already gone; the entry belongs to its successor.
        return true;
    }
    lane.pending = lane.pending.saturating_sub(1);
    if lane.pending == 0 {
        table.lanes.remove(key);
        return true;
    }
    false
}

async fn run_lane(
    direct: DirectDispatcher,
    lanes: Arc<Mutex<LaneTable>>,
    key: LaneKey,
    generation: u64,
    mut rx: mpsc::Receiver<LaneItem>,
) {
    while let Some(LaneItem { event, settlement }) = rx.recv().await {
        let event_id = event.id().clone();
        let outcome = direct.dispatch_now(event).value().await;
        if let Err(e) = &outcome {
            tracing::trace!(event_id = %event_id, error = %e, "swimlane handler failed");
        }
        settlement.settle(outcome);

        if release(&lanes, &key, generation) {
            break;
        }
    }
    tracing::debug!(
        entity_type = %key.0,
        swimlane = key.1,
        generation,
        "swimlane worker stopped"
    );
}

fn lock(lanes: &Mutex<LaneTable>) -> MutexGuard<'_, LaneTable> {
    lanes.lock().unwrap_or_else(PoisonError::into_inner)
}
