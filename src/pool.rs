//! Fixed-size connection pool with a FIFO wait queue.
//!
//! A pool owns `capacity` clients for one named service, created up front.
//! `acquire` hands out a free client immediately or suspends the caller in a
//! FIFO queue; nothing is ever rejected for being busy. `release` (or dropping
//! the [`PooledConnection`]) passes the client straight to the oldest waiter,
//! so a newly arriving caller can never overtake someone already queued.
//!
//! Invariants:
//! - `active` equals the number of slots marked in use and never exceeds
//!   `capacity`.
//! - A slot is held by at most one [`PooledConnection`] at a time.
//! - All state changes happen under one mutex; no `.await` occurs while it is
//!   held, and hand-offs to waiters are sent after the lock is released.
//!
//! There is no acquisition timeout. Wrap `acquire` in `tokio::time::timeout`
//! if you need one: a waiter whose future is dropped is skipped on the next
//! release, and a connection handed to it just before it gave up is returned
//! by the guard's `Drop`.
//!
//! After [`close`](ConnectionPool::close), new `acquire` calls fail with
//! [`Error::PoolClosed`] and callers already suspended in the queue wake up
//! with the same error.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::telemetry::{Event, EventBus, PoolEvent};
use crate::{Error, Result};

/// Capacity, in-use count, and queue depth for one service.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub service: String,
    pub capacity: usize,
    pub active: usize,
    pub waiting: usize,
}

/// Snapshot of one pooled connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: usize,
    pub in_use: bool,
    pub last_used_at: Option<Instant>,
    pub request_count: u64,
}

struct Slot<C> {
    client: Option<C>,
    in_use: bool,
    last_used_at: Option<Instant>,
    request_count: u64,
}

struct PoolState<C: Clone> {
    slots: Vec<Slot<C>>,
    waiters: VecDeque<oneshot::Sender<PooledConnection<C>>>,
    active: usize,
    closed: bool,
}

struct Shared<C: Clone> {
    service: String,
    state: Mutex<PoolState<C>>,
    events: EventBus,
}

impl<C: Clone> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded pool of clients for one service. Cheap to clone.
pub struct ConnectionPool<C: Clone> {
    shared: Arc<Shared<C>>,
}

impl<C: Clone> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<C: Clone> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ConnectionPool")
            .field("service", &self.shared.service)
            .field("capacity", &state.slots.len())
            .field("active", &state.active)
            .field("waiting", &state.waiters.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<C> ConnectionPool<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Pool over the given clients; capacity is `clients.len()`.
    pub fn new(service: impl Into<String>, clients: Vec<C>) -> Result<Self> {
        Self::with_events(service, clients, EventBus::disabled())
    }

    /// Like [`new`](Self::new), reporting activity to `events`.
    pub fn with_events(service: impl Into<String>, clients: Vec<C>, events: EventBus) -> Result<Self> {
        let service = service.into();
        if clients.is_empty() {
            return Err(Error::InvalidConfig {
                message: format!("service '{service}': pool needs at least one client"),
            });
        }
        let slots = clients
            .into_iter()
            .map(|client| Slot { client: Some(client), in_use: false, last_used_at: None, request_count: 0 })
            .collect();
        let state = PoolState { slots, waiters: VecDeque::new(), active: 0, closed: false };
        Ok(Self { shared: Arc::new(Shared { service, state: Mutex::new(state), events }) })
    }

    /// Build `capacity` clients with `make(id)`.
    pub fn from_fn<F>(service: impl Into<String>, capacity: usize, make: F) -> Result<Self>
    where
        F: FnMut(usize) -> C,
    {
        Self::new(service, (0..capacity).map(make).collect())
    }

    pub fn service(&self) -> &str {
        &self.shared.service
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock().slots.len()
    }

    /// Take a connection, waiting in FIFO order if all are busy.
    pub async fn acquire(&self) -> Result<PooledConnection<C>> {
        let receiver = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(self.closed_error());
            }
            if let Some(id) = state.slots.iter().position(|slot| !slot.in_use) {
                let conn = self.check_out(&mut state, id);
                let active = state.active;
                let capacity = state.slots.len();
                drop(state);
                self.shared.events.emit(Event::Pool(PoolEvent::Acquired {
                    service: self.shared.service.clone(),
                    connection_id: id,
                    active,
                    capacity,
                }));
                return conn;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            let waiting = state.waiters.len();
            drop(state);
            debug!(
                target: "presspool::pool",
                service = %self.shared.service,
                waiting,
                "all connections busy, queueing"
            );
            self.shared.events.emit(Event::Pool(PoolEvent::Queued {
                service: self.shared.service.clone(),
                waiting,
            }));
            rx
        };

        // The sender is dropped without a value only when the pool closes.
        receiver.await.map_err(|_| self.closed_error())
    }

    /// Take a free connection without waiting.
    pub fn try_acquire(&self) -> Option<PooledConnection<C>> {
        let mut state = self.shared.lock();
        if state.closed {
            return None;
        }
        let id = state.slots.iter().position(|slot| !slot.in_use)?;
        self.check_out(&mut state, id).ok()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            service: self.shared.service.clone(),
            capacity: state.slots.len(),
            active: state.active,
            waiting: state.waiters.iter().filter(|tx| !tx.is_closed()).count(),
        }
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.shared.lock();
        state
            .slots
            .iter()
            .enumerate()
            .map(|(id, slot)| ConnectionInfo {
                id,
                in_use: slot.in_use,
                last_used_at: slot.last_used_at,
                request_count: slot.request_count,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Shut the pool down.
    ///
    /// Idle clients are dropped now and in-use ones when they come back.
    /// Suspended waiters are woken with `PoolClosed`.
    pub fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<C> = state
                .slots
                .iter_mut()
                .filter(|slot| !slot.in_use)
                .filter_map(|slot| slot.client.take())
                .collect();
            let waiters: Vec<_> = state.waiters.drain(..).collect();
            (idle, waiters)
        };
        let dropped_waiters = waiters.len();
        drop(waiters);
        drop(idle);
        info!(
            target: "presspool::pool",
            service = %self.shared.service,
            dropped_waiters,
            "pool closed"
        );
        self.shared.events.emit(Event::Pool(PoolEvent::Closed {
            service: self.shared.service.clone(),
            dropped_waiters,
        }));
    }

    fn closed_error(&self) -> Error {
        Error::PoolClosed { service: self.shared.service.clone() }
    }

    fn check_out(&self, state: &mut PoolState<C>, id: usize) -> Result<PooledConnection<C>> {
        let slot = &mut state.slots[id];
        let client = slot.client.clone().ok_or_else(|| self.closed_error())?;
        slot.in_use = true;
        slot.request_count += 1;
        slot.last_used_at = Some(Instant::now());
        state.active += 1;
        Ok(PooledConnection { shared: self.shared.clone(), id, client, armed: true })
    }
}

impl<C: Clone> Shared<C> {
    /// Return slot `id`: hand it to the oldest live waiter, or mark it free.
    fn release(self: &Arc<Self>, id: usize) {
        loop {
            let (waiter, client) = {
                let mut state = self.lock();
                let waiter = loop {
                    match state.waiters.pop_front() {
                        Some(tx) if tx.is_closed() => continue,
                        other => break other,
                    }
                };
                match (waiter, state.slots[id].client.clone()) {
                    (Some(tx), Some(client)) => (tx, client),
                    _ => {
                        let state = &mut *state;
                        let slot = &mut state.slots[id];
                        slot.in_use = false;
                        if state.closed {
                            slot.client = None;
                        }
                        state.active = state.active.saturating_sub(1);
                        drop(state);
                        self.events.emit(Event::Pool(PoolEvent::Released {
                            service: self.service.clone(),
                            connection_id: id,
                            handed_off: false,
                        }));
                        return;
                    }
                }
            };

            // The slot stays in use across the hand-off, so nobody can grab it
            // between here and the waiter waking up.
            let conn = PooledConnection { shared: self.clone(), id, client, armed: true };
            match waiter.send(conn) {
                Ok(()) => {
                    let mut state = self.lock();
                    let slot = &mut state.slots[id];
                    slot.request_count += 1;
                    slot.last_used_at = Some(Instant::now());
                    drop(state);
                    self.events.emit(Event::Pool(PoolEvent::Released {
                        service: self.service.clone(),
                        connection_id: id,
                        handed_off: true,
                    }));
                    return;
                }
                // Waiter gave up between the pop and the send; try the next one.
                Err(mut conn) => conn.armed = false,
            }
        }
    }
}

/// Exclusive handle to one pooled client.
///
/// Dereferences to the client. Returning it to the pool happens on
/// [`release`](Self::release) or on drop, whichever comes first.
pub struct PooledConnection<C: Clone> {
    shared: Arc<Shared<C>>,
    id: usize,
    client: C,
    armed: bool,
}

impl<C: Clone> PooledConnection<C> {
    /// Position of this connection in its pool.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn service(&self) -> &str {
        &self.shared.service
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Give the connection back to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl<C: Clone> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.client
    }
}

impl<C: Clone> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            self.shared.release(self.id);
        }
    }
}

impl<C: Clone> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("service", &self.shared.service)
            .field("id", &self.id)
            .finish()
    }
}
