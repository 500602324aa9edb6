//! Agent pool: which agents are idle, busy or retired.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::channel::AgentId;

/// Pool state of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Idle,
    Busy,
    Retired,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolState::Idle => write!(f, "idle"),
            PoolState::Busy => write!(f, "busy"),
            PoolState::Retired => write!(f, "retired"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    /// Position in the idle stack.
    Idle(u64),
    Busy,
    Retired,
}

/// Partition of registered agents into idle, busy and retired.
///
/// Idle agents are handed out last-in-first-out so warm agents are reused and
/// long-idle ones drain towards their idle timeout.
#[derive(Debug, Default)]
pub struct AgentPool {
    slots: HashMap<AgentId, Slot>,
    idle: BTreeMap<u64, AgentId>,
    busy: HashSet<AgentId>,
    retired: HashSet<AgentId>,
    seq: u64,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. No-op if already known.
    pub fn add(&mut self, id: AgentId, start_busy: bool) {
        if self.slots.contains_key(&id) {
            return;
        }
        if start_busy {
            self.busy.insert(id.clone());
            self.slots.insert(id, Slot::Busy);
        } else {
            self.push_idle(id);
        }
    }

    /// Deregister an agent. No-op if unknown.
    pub fn remove(&mut self, id: &AgentId) {
        if let Some(slot) = self.slots.remove(id) {
            self.unlink(id, slot);
        }
    }

    /// Take an agent out of circulation without deregistering it.
    pub fn retire(&mut self, id: &AgentId) {
        let Some(slot) = self.slots.get(id).copied() else {
            return;
        };
        if matches!(slot, Slot::Retired) {
            return;
        }
        self.unlink(id, slot);
        self.retired.insert(id.clone());
        self.slots.insert(id.clone(), Slot::Retired);
    }

    /// Take the most recently idled agent and mark it busy.
    pub fn allocate(&mut self) -> Option<AgentId> {
        let (_, id) = self.idle.pop_last()?;
        self.busy.insert(id.clone());
        self.slots.insert(id.clone(), Slot::Busy);
        Some(id)
    }

    /// Return a busy agent to the idle stack. No-op unless busy.
    pub fn release(&mut self, id: &AgentId) {
        if !self.busy.remove(id) {
            return;
        }
        self.push_idle(id.clone());
    }

    pub fn state_of(&self, id: &AgentId) -> Option<PoolState> {
        self.slots.get(id).map(|slot| match slot {
            Slot::Idle(_) => PoolState::Idle,
            Slot::Busy => PoolState::Busy,
            Slot::Retired => PoolState::Retired,
        })
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn busy_count(&self) -> usize {
        self.busy.len()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn push_idle(&mut self, id: AgentId) {
        self.seq += 1;
        self.idle.insert(self.seq, id.clone());
        self.slots.insert(id, Slot::Idle(self.seq));
    }

    fn unlink(&mut self, id: &AgentId, slot: Slot) {
        match slot {
            Slot::Idle(seq) => {
                self.idle.remove(&seq);
            }
            Slot::Busy => {
                self.busy.remove(id);
            }
            Slot::Retired => {
                self.retired.remove(id);
            }
        }
    }
}
