//! Ordered, copy-on-write toxic chains.
//!
//! Each proxy owns one [`ToxicChain`] per direction. The chain stores an
//! immutable `Arc<Vec<Toxic>>` snapshot inside a watch channel: mutations build
//! a new vector and swap it in, readers clone the `Arc`. A pump therefore runs
//! every chunk against one complete snapshot and never holds a lock while it
//! waits on a socket or a timer. Subscribers are woken on every change, which
//! lets idle connections react to toxics such as `timeout` or `reset_peer`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::watch;
use tracing::debug;

use crate::batch::Batch;
use crate::direction::Direction;
use crate::error::{Result, ToxicError};
use crate::state::ToxicStates;
use crate::toxic::{Toxic, ToxicPatch};

/// Immutable view of a chain at one point in time.
pub type Snapshot = Arc<Vec<Toxic>>;

/// Runs one chunk through `toxics` in declared order.
///
/// The output equals feeding the chunk to the first toxic's transform, its
/// output to the second, and so on.
pub fn apply<R: Rng + ?Sized>(
    toxics: &[Toxic],
    data: Bytes,
    states: &mut ToxicStates,
    now: Instant,
    rng: &mut R,
) -> Batch {
    let mut batch = Batch::new(data);
    for toxic in toxics {
        let state = states.state_for(toxic, now, rng);
        batch = toxic.transform(batch, state, rng);
    }
    batch
}

/// The toxics attached to one direction of a proxy.
#[derive(Debug)]
pub struct ToxicChain {
    direction: Direction,
    toxics: watch::Sender<Snapshot>,
    next_id: AtomicU64,
}

impl ToxicChain {
    /// Creates an empty chain for a direction.
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            toxics: watch::Sender::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns the direction this chain applies to.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns the current ordered snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.toxics.borrow().clone()
    }

    /// Returns a copy of the toxics in application order.
    pub fn list(&self) -> Vec<Toxic> {
        self.snapshot().to_vec()
    }

    /// Number of toxics in the chain.
    pub fn len(&self) -> usize {
        self.toxics.borrow().len()
    }

    /// Returns true if the chain has no toxics.
    pub fn is_empty(&self) -> bool {
        self.toxics.borrow().is_empty()
    }

    /// Returns the toxic with the given name.
    pub fn get(&self, name: &str) -> Result<Toxic> {
        self.toxics
            .borrow()
            .iter()
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| ToxicError::NotFound(name.to_string()))
    }

    /// Subscribes to chain changes. The receiver starts at the current snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.toxics.subscribe()
    }

    /// Appends a toxic to the end of the chain.
    ///
    /// Fails with [`ToxicError::Conflict`] if the name is taken; the chain is
    /// left untouched.
    pub fn add(&self, mut toxic: Toxic) -> Result<Toxic> {
        if toxic.stream != self.direction {
            return Err(ToxicError::WrongStream {
                name: toxic.name,
                stream: toxic.stream,
                chain: self.direction,
            });
        }
        toxic.validate()?;
        toxic.id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut result = Ok(toxic.clone());
        self.toxics.send_if_modified(|current| {
            if current.iter().any(|t| t.name == toxic.name) {
                result = Err(ToxicError::Conflict(toxic.name.clone()));
                return false;
            }
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(toxic);
            *current = Arc::new(next);
            true
        });

        if let Ok(ref added) = result {
            debug!(
                toxic = %added.name,
                kind = added.type_name(),
                stream = %self.direction,
                "Toxic added"
            );
        }
        result
    }

    /// Replaces a toxic in place, keeping its position.
    pub fn update(&self, name: &str, patch: &ToxicPatch) -> Result<Toxic> {
        let mut result = Err(ToxicError::NotFound(name.to_string()));
        self.toxics.send_if_modified(|current| {
            let Some(index) = current.iter().position(|t| t.name == name) else {
                return false;
            };
            match current[index].patched(patch) {
                Ok(updated) => {
                    let mut next = (**current).clone();
                    next[index] = updated.clone();
                    *current = Arc::new(next);
                    result = Ok(updated);
                    true
                }
                Err(e) => {
                    result = Err(e);
                    false
                }
            }
        });
        result
    }

    /// Removes a toxic by name and returns it.
    pub fn remove(&self, name: &str) -> Result<Toxic> {
        let mut removed = None;
        self.toxics.send_if_modified(|current| {
            let Some(index) = current.iter().position(|t| t.name == name) else {
                return false;
            };
            let mut next = (**current).clone();
            removed = Some(next.remove(index));
            *current = Arc::new(next);
            true
        });

        match removed {
            Some(toxic) => {
                debug!(toxic = %toxic.name, stream = %self.direction, "Toxic removed");
                Ok(toxic)
            }
            None => Err(ToxicError::NotFound(name.to_string())),
        }
    }

    /// Removes every toxic. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut count = 0;
        self.toxics.send_if_modified(|current| {
            count = current.len();
            if count == 0 {
                return false;
            }
            *current = Arc::new(Vec::new());
            true
        });
        count
    }
}

/// The upstream and downstream chains of one proxy.
#[derive(Debug)]
pub struct ToxicChains {
    upstream: ToxicChain,
    downstream: ToxicChain,
}

impl Default for ToxicChains {
    fn default() -> Self {
        Self::new()
    }
}

impl ToxicChains {
    /// Creates two empty chains.
    pub fn new() -> Self {
        Self {
            upstream: ToxicChain::new(Direction::Upstream),
            downstream: ToxicChain::new(Direction::Downstream),
        }
    }

    /// Returns the chain for a direction.
    pub fn get(&self, direction: Direction) -> &ToxicChain {
        match direction {
            Direction::Upstream => &self.upstream,
            Direction::Downstream => &self.downstream,
        }
    }

    /// Adds a toxic to the chain named by its `stream`.
    pub fn add(&self, toxic: Toxic) -> Result<Toxic> {
        self.get(toxic.stream).add(toxic)
    }

    /// Returns the chain holding a toxic named `name`, upstream first.
    pub fn locate(&self, name: &str) -> Result<&ToxicChain> {
        [&self.upstream, &self.downstream]
            .into_iter()
            .find(|chain| chain.get(name).is_ok())
            .ok_or_else(|| ToxicError::NotFound(name.to_string()))
    }

    /// Returns all toxics, upstream first.
    pub fn list(&self) -> Vec<Toxic> {
        let mut all = self.upstream.list();
        all.extend(self.downstream.list());
        all
    }

    /// Removes every toxic from both chains.
    pub fn clear(&self) -> usize {
        self.upstream.clear() + self.downstream.clear()
    }
}
