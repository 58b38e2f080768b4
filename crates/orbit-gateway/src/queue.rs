//! Per-system command queues.
//!
//! In serial mode each system has at most one command in flight: the slot
//! is taken when a command is dequeued for uplink and released only by the
//! command holding it. In parallel mode the slot is never taken and every
//! queued command is dispatched at once.

use std::collections::{HashMap, VecDeque};

use orbit_proto::{Command, CommandId};

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Default)]
struct SystemQueue {
    waiting: VecDeque<Command>,
    in_flight: Option<CommandId>,
}

/// FIFO command queues keyed by system name.
#[derive(Debug, Default)]
pub struct CommandQueue {
    parallel: bool,
    systems: HashMap<String, SystemQueue>,
}

impl CommandQueue {
    /// Create an empty queue set.
    #[must_use]
    pub fn new(parallel: bool) -> Self {
        Self {
            parallel,
            systems: HashMap::new(),
        }
    }

    /// Whether commands bypass the one-in-flight rule.
    #[must_use]
    pub const fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Create a queue for `system`. Returns `false` if one already exists,
    /// in which case it is left untouched.
    pub fn add_system(&mut self, system: &str) -> bool {
        if self.systems.contains_key(system) {
            return false;
        }
        self.systems.insert(system.to_string(), SystemQueue::default());
        true
    }

    /// Drop the queue for `system`, returning the commands still waiting.
    pub fn remove_system(&mut self, system: &str) -> Vec<Command> {
        self.systems
            .remove(system)
            .map(|queue| queue.waiting.into())
            .unwrap_or_default()
    }

    /// Whether `system` has a queue.
    #[must_use]
    pub fn has_system(&self, system: &str) -> bool {
        self.systems.contains_key(system)
    }

    /// Append a command to its system's queue.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NoQueue`] if the system has no queue.
    pub fn enqueue(&mut self, command: Command) -> GatewayResult<()> {
        let queue = self
            .systems
            .get_mut(&command.system)
            .ok_or_else(|| GatewayError::NoQueue(command.system.clone()))?;
        queue.waiting.push_back(command);
        Ok(())
    }

    /// Whether `system` can take another command now.
    #[must_use]
    pub fn is_ready(&self, system: &str) -> bool {
        self.parallel
            || self
                .systems
                .get(system)
                .is_some_and(|queue| queue.in_flight.is_none())
    }

    /// Dequeue the next command for `system` if the system is ready.
    ///
    /// In serial mode the returned command takes the in-flight slot.
    pub fn next_for(&mut self, system: &str) -> Option<Command> {
        let parallel = self.parallel;
        let queue = self.systems.get_mut(system)?;
        if !parallel && queue.in_flight.is_some() {
            return None;
        }
        let command = queue.waiting.pop_front()?;
        if !parallel {
            queue.in_flight = Some(command.id);
        }
        Some(command)
    }

    /// Dequeue every command `system` can take now.
    pub fn drain_ready(&mut self, system: &str) -> Vec<Command> {
        let mut ready = Vec::new();
        while let Some(command) = self.next_for(system) {
            ready.push(command);
        }
        ready
    }

    /// Release the in-flight slot held by `id`.
    ///
    /// Returns `false` when `id` does not hold the slot; the slot is then
    /// left alone.
    pub fn finish(&mut self, system: &str, id: CommandId) -> bool {
        match self.systems.get_mut(system) {
            Some(queue) if queue.in_flight == Some(id) => {
                queue.in_flight = None;
                true
            }
            _ => false,
        }
    }

    /// Remove a waiting command.
    pub fn remove(&mut self, system: &str, id: CommandId) -> Option<Command> {
        let queue = self.systems.get_mut(system)?;
        let position = queue.waiting.iter().position(|command| command.id == id)?;
        queue.waiting.remove(position)
    }

    /// The command holding `system`'s in-flight slot.
    #[must_use]
    pub fn in_flight(&self, system: &str) -> Option<CommandId> {
        self.systems.get(system).and_then(|queue| queue.in_flight)
    }

    /// Number of commands waiting for `system`.
    #[must_use]
    pub fn waiting(&self, system: &str) -> usize {
        self.systems.get(system).map_or(0, |queue| queue.waiting.len())
    }
}
