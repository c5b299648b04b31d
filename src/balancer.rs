//! Load Balancer Module
//!
//! Picks which active member serves the next connection. The active set and
//! the selection state live under a single lock, so a member removed by one
//! caller is never handed out to another afterwards.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::database::DatabaseDescriptor;
use crate::error::ConfigError;

/// Balancer implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalancerKind {
    /// Always the highest-weight member (ties broken by configuration order)
    Simple,
    /// Cycle through members in configuration order
    RoundRobin,
    /// Uniform random choice
    Random,
    /// Fewest in-flight connections relative to weight
    Load,
}

impl BalancerKind {
    pub fn from_id(id: &str) -> Result<Self, ConfigError> {
        match id {
            "simple" => Ok(BalancerKind::Simple),
            "round-robin" => Ok(BalancerKind::RoundRobin),
            "random" => Ok(BalancerKind::Random),
            "load" => Ok(BalancerKind::Load),
            other => Err(ConfigError::UnknownBalancer(other.to_string())),
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            BalancerKind::Simple => "simple",
            BalancerKind::RoundRobin => "round-robin",
            BalancerKind::Random => "random",
            BalancerKind::Load => "load",
        }
    }
}

impl fmt::Display for BalancerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// An active member as seen by the balancer
struct Slot {
    /// Position in the cluster configuration
    order: usize,
    descriptor: Arc<DatabaseDescriptor>,
    in_flight: Arc<AtomicUsize>,
}

#[derive(Default)]
struct BalancerState {
    /// Active members, sorted by configuration order
    slots: Vec<Slot>,
    /// Round-robin cursor
    cursor: usize,
}

/// A member chosen by [`Balancer::next`]. Counts as in flight until dropped.
pub struct Selection {
    descriptor: Arc<DatabaseDescriptor>,
    in_flight: Arc<AtomicUsize>,
}

impl Selection {
    pub fn descriptor(&self) -> &Arc<DatabaseDescriptor> {
        &self.descriptor
    }
}

impl Drop for Selection {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Load balancer over the active members of one cluster
pub struct Balancer {
    kind: BalancerKind,
    state: Mutex<BalancerState>,
    /// Total selections made
    selections: AtomicUsize,
}

impl Balancer {
    /// Create a balancer with no active members
    pub fn new(kind: BalancerKind) -> Self {
        Self {
            kind,
            state: Mutex::new(BalancerState::default()),
            selections: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> BalancerKind {
        self.kind
    }

    /// Pick the member to serve the next operation
    pub async fn next(&self) -> Option<Selection> {
        let mut state = self.state.lock().await;
        if state.slots.is_empty() {
            return None;
        }

        let idx = match self.kind {
            BalancerKind::Simple => {
                // max_by_key keeps the last maximum; iterate reversed to prefer the first
                state
                    .slots
                    .iter()
                    .enumerate()
                    .rev()
                    .max_by_key(|(_, slot)| slot.descriptor.weight)
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            }
            BalancerKind::RoundRobin => {
                let idx = state.cursor % state.slots.len();
                state.cursor = idx + 1;
                idx
            }
            BalancerKind::Random => rand::thread_rng().gen_range(0..state.slots.len()),
            BalancerKind::Load => state
                .slots
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    let load_a = (a.in_flight.load(Ordering::Acquire) as u64 + 1) * b.descriptor.weight as u64;
                    let load_b = (b.in_flight.load(Ordering::Acquire) as u64 + 1) * a.descriptor.weight as u64;
                    load_a.cmp(&load_b)
                })
                .map(|(i, _)| i)
                .unwrap_or(0),
        };

        let slot = &state.slots[idx];
        slot.in_flight.fetch_add(1, Ordering::AcqRel);
        self.selections.fetch_add(1, Ordering::Relaxed);

        Some(Selection {
            descriptor: Arc::clone(&slot.descriptor),
            in_flight: Arc::clone(&slot.in_flight),
        })
    }

    /// Add a member to the active set. `order` is its position in the cluster
    /// configuration. Returns false if it was already active.
    pub async fn add(&self, order: usize, descriptor: Arc<DatabaseDescriptor>) -> bool {
        let mut state = self.state.lock().await;
        if state.slots.iter().any(|s| s.descriptor.id == descriptor.id) {
            return false;
        }

        let pos = state
            .slots
            .iter()
            .position(|s| s.order > order)
            .unwrap_or(state.slots.len());
        state.slots.insert(pos, Slot {
            order,
            descriptor,
            in_flight: Arc::new(AtomicUsize::new(0)),
        });
        if pos < state.cursor {
            state.cursor += 1;
        }
        true
    }

    /// Remove a member from the active set. Returns false if it was not active.
    pub async fn remove(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.slots.iter().position(|s| s.descriptor.id == id) {
            Some(pos) => {
                state.slots.remove(pos);
                // Keep the cursor pointing at the member that would have come next
                if pos < state.cursor {
                    state.cursor -= 1;
                }
                true
            }
            None => false,
        }
    }

    /// Check if a member is active
    pub async fn contains(&self, id: &str) -> bool {
        self.state.lock().await.slots.iter().any(|s| s.descriptor.id == id)
    }

    /// Active members in configuration order
    pub async fn members(&self) -> Vec<Arc<DatabaseDescriptor>> {
        let state = self.state.lock().await;
        state.slots.iter().map(|s| Arc::clone(&s.descriptor)).collect()
    }

    /// Get stats about the balancer state
    pub async fn stats(&self) -> BalancerStats {
        let state = self.state.lock().await;
        BalancerStats {
            kind: self.kind,
            active_members: state.slots.iter().map(|s| s.descriptor.id.clone()).collect(),
            in_flight: state.slots.iter().map(|s| s.in_flight.load(Ordering::Acquire)).sum(),
            total_selections: self.selections.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about balancer state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerStats {
    pub kind: BalancerKind,
    /// Ids of active members
    pub active_members: Vec<String>,
    /// Selections currently held
    pub in_flight: usize,
    /// Selections made since start
    pub total_selections: usize,
}
