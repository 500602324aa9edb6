//! Agent hosting: spawning agents and tracking their lifetimes.
//!
//! The coordinator only sees the [`AgentHost`] traits. [`LocalAgentHost`]
//! runs each agent as its own tokio task; the task's synthetic pid stands in
//! for an OS process id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::agent::Agent;
use crate::channel::{self, AgentChannel, AgentId};
use crate::config::AgentConfig;
use crate::error::SpawnError;
use crate::events::EventBus;
use crate::job::JobRegistry;
use crate::protocol::Message;

/// A freshly spawned agent, as seen from the coordinator.
pub struct SpawnedAgent {
    pub id: AgentId,
    pub pid: u32,
    /// Writes to the agent.
    pub channel: Box<dyn AgentChannel>,
    /// Messages from the agent.
    pub inbox: mpsc::UnboundedReceiver<Message>,
}

/// Creates agents.
pub trait AgentFactory: Send {
    fn spawn(&mut self) -> Result<SpawnedAgent, SpawnError>;
}

/// Observes and terminates agent processes.
pub trait ProcessControl: Send {
    /// Pids that exited since the last call. Never blocks.
    fn reap(&mut self) -> Vec<u32>;

    /// Forcibly terminate. Exit is reported by a later `reap`.
    fn kill(&mut self, pid: u32);
}

/// Everything the coordinator needs from its host.
pub trait AgentHost: AgentFactory + ProcessControl {}

impl<T: AgentFactory + ProcessControl> AgentHost for T {}

/// Hosts agents as tasks on the current tokio runtime.
pub struct LocalAgentHost {
    registry: Arc<JobRegistry>,
    config: AgentConfig,
    events: EventBus,
    next_pid: u32,
    tasks: HashMap<u32, JoinHandle<()>>,
}

impl LocalAgentHost {
    pub fn new(registry: Arc<JobRegistry>, config: AgentConfig, events: EventBus) -> Self {
        Self {
            registry,
            config,
            events,
            next_pid: 0,
            tasks: HashMap::new(),
        }
    }

    /// Number of agent tasks not yet reaped.
    pub fn live(&self) -> usize {
        self.tasks.len()
    }
}

impl AgentFactory for LocalAgentHost {
    fn spawn(&mut self) -> Result<SpawnedAgent, SpawnError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SpawnError::NoRuntime(e.to_string()))?;

        let id = AgentId::new();
        let (to_agent, agent_inbox) = channel::memory(id.to_string());
        let (to_coordinator, coordinator_inbox) = channel::memory("coordinator");

        let mut agent = Agent::new(
            id.clone(),
            self.config.clone(),
            Arc::clone(&self.registry),
            Box::new(to_coordinator),
            agent_inbox,
            self.events.clone(),
        );

        self.next_pid += 1;
        let pid = self.next_pid;
        let task = runtime.spawn(async move {
            if let Err(e) = agent.run().await {
                tracing::error!(agent_id = %agent.id(), "Agent exited with error: {}", e);
            }
        });
        self.tasks.insert(pid, task);
        tracing::debug!(agent_id = %id, pid, "Spawned agent");

        Ok(SpawnedAgent {
            id,
            pid,
            channel: Box::new(to_agent),
            inbox: coordinator_inbox.into_inner(),
        })
    }
}

impl ProcessControl for LocalAgentHost {
    fn reap(&mut self) -> Vec<u32> {
        let exited: Vec<u32> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.is_finished())
            .map(|(pid, _)| *pid)
            .collect();
        for pid in &exited {
            self.tasks.remove(pid);
        }
        exited
    }

    fn kill(&mut self, pid: u32) {
        match self.tasks.get(&pid) {
            Some(task) => {
                tracing::debug!(pid, "Killing agent");
                task.abort();
            }
            None => tracing::debug!(pid, "Kill requested for unknown agent"),
        }
    }
}

impl Drop for LocalAgentHost {
    fn drop(&mut self) {
        for task in self.tasks.values() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::Inbox;

    fn host() -> LocalAgentHost {
        LocalAgentHost::new(
            Arc::new(JobRegistry::with_builtins()),
            AgentConfig::default(),
            EventBus::new(16),
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn spawn_needs_runtime() {
        let mut host = host();
        assert!(matches!(host.spawn(), Err(SpawnError::NoRuntime(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_agent_exits_after_last_message() {
        let mut host = host();
        let agent = host.spawn().unwrap();
        assert_eq!(agent.pid, 1);
        assert!(host.reap().is_empty());

        agent.channel.send(Message::last_message()).unwrap();
        settle().await;
        assert_eq!(host.reap(), vec![1]);
        assert_eq!(host.live(), 0);

        let mut inbox = Inbox::new(agent.inbox);
        assert_eq!(inbox.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn kill_aborts_agent() {
        let mut host = host();
        let first = host.spawn().unwrap();
        let second = host.spawn().unwrap();
        assert_ne!(first.id, second.id);

        host.kill(second.pid);
        host.kill(99);
        settle().await;
        assert_eq!(host.reap(), vec![second.pid]);
        assert_eq!(host.live(), 1);
        assert!(!second.channel.is_writable());
    }
}
