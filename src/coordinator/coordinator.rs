//! The coordinator: owns jobs, agents, the tick scheduler and the pool.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, interval, sleep};
use tokio_stream::StreamExt;
use tokio_stream::StreamMap;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::handle::{Command, CoordinatorHandle};
use crate::channel::{AgentChannel, AgentId};
use crate::config::CoordinatorConfig;
use crate::error::{ChannelError, Error};
use crate::events::{DispatchEvent, EventBus};
use crate::host::{AgentHost, SpawnedAgent};
use crate::job::JobPayload;
use crate::pool::AgentPool;
use crate::protocol::{JobAssignment, Message, MessageKind};
use crate::state::RunState;
use crate::timer::{TickRate, TickScheduler, Timing};

/// A registered job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub payload: JobPayload,
    pub timing: Timing,
    /// Agent currently running this job.
    pub agent_id: Option<AgentId>,
    /// Removed while running; erased once the run ends.
    pub pending_removal: bool,
}

struct AgentRecord {
    pid: u32,
    job_id: Option<String>,
    channel: Box<dyn AgentChannel>,
}

/// What ended one pump of the coordinator loop.
enum Wake {
    Tick,
    Message(AgentId, Message),
    Command(Command),
    Idle,
}

/// Dispatches scheduled jobs to a pool of agents.
pub struct Coordinator {
    config: CoordinatorConfig,
    state: RunState,
    host: Box<dyn AgentHost>,
    scheduler: TickScheduler,
    pool: AgentPool,
    jobs: HashMap<String, JobRecord>,
    agents: HashMap<AgentId, AgentRecord>,
    pids: HashMap<u32, AgentId>,
    inbound: StreamMap<AgentId, UnboundedReceiverStream<Message>>,
    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    shutdown_error: Option<Error>,
    events: EventBus,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, host: Box<dyn AgentHost>, events: EventBus) -> Self {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let scheduler = TickScheduler::new(TickRate::new(config.tick));
        Self {
            config,
            state: RunState::Shutdown,
            host,
            scheduler,
            pool: AgentPool::new(),
            jobs: HashMap::new(),
            agents: HashMap::new(),
            pids: HashMap::new(),
            inbound: StreamMap::new(),
            commands,
            command_tx,
            shutdown_error: None,
            events,
        }
    }

    /// A handle for driving this coordinator from other tasks.
    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle::new(self.command_tx.clone())
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn job(&self, id: &str) -> Option<&JobRecord> {
        self.jobs.get(id)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn pool(&self) -> &AgentPool {
        &self.pool
    }

    /// Register or replace a job.
    pub fn add_job(&mut self, id: &str, payload: JobPayload, timing: Timing) {
        tracing::info!(job_id = %id, timing = %timing, kind = %payload.kind, "Adding job");
        match self.jobs.get_mut(id) {
            Some(record) => {
                record.payload = payload;
                record.timing = timing.clone();
                record.pending_removal = false;
            }
            None => {
                self.jobs.insert(
                    id.to_string(),
                    JobRecord {
                        payload,
                        timing: timing.clone(),
                        agent_id: None,
                        pending_removal: false,
                    },
                );
            }
        }
        self.scheduler.add_job(id, timing, Utc::now());
    }

    /// Unschedule a job. A running job is erased once its run ends.
    pub fn remove_job(&mut self, id: &str) {
        self.scheduler.cancel_job(id);
        let Some(record) = self.jobs.get_mut(id) else {
            return;
        };

        match record.agent_id.clone() {
            Some(agent_id) => {
                tracing::info!(job_id = %id, agent_id = %agent_id, "Removing running job");
                record.pending_removal = true;
                if self.config.stop_removed_jobs
                    && let Err(e) = self.send_stop(id, &agent_id)
                {
                    self.report(None, &e);
                }
            }
            None => {
                tracing::info!(job_id = %id, "Removing job");
                self.jobs.remove(id);
            }
        }
    }

    /// Ask the agent running `id` to end its repeat loop. No-op if not running.
    pub fn stop_job(&mut self, id: &str) -> Result<(), Error> {
        let Some(agent_id) = self.jobs.get(id).and_then(|r| r.agent_id.clone()) else {
            tracing::debug!(job_id = %id, "Stop requested for job that is not running");
            return Ok(());
        };
        self.send_stop(id, &agent_id)
    }

    /// Hand a fired job to an agent. Stale or duplicate fires are ignored.
    pub fn dispatch(&mut self, job_id: &str) -> Result<(), Error> {
        let Some(record) = self.jobs.get(job_id) else {
            tracing::debug!(job_id = %job_id, "Fired job is no longer registered");
            return Ok(());
        };
        if let Some(agent_id) = &record.agent_id {
            tracing::debug!(job_id = %job_id, agent_id = %agent_id, "Job already assigned");
            return Ok(());
        }

        let assignment = JobAssignment {
            job_id: job_id.to_string(),
            job: record.payload.clone(),
        };
        let message = match Message::job_assignment(&assignment) {
            Ok(message) => message,
            Err(e) => {
                self.scheduler.finish(job_id, Utc::now());
                return Err(e.into());
            }
        };

        let agent_id = match self.schedule_agent() {
            Ok(agent_id) => agent_id,
            Err(e) => {
                self.scheduler.finish(job_id, Utc::now());
                return Err(e);
            }
        };

        let sent = match self.agents.get(&agent_id) {
            Some(agent) => agent.channel.send(message),
            None => Err(ChannelError::UnknownAgent {
                agent_id: agent_id.to_string(),
            }),
        };
        if let Err(e) = sent {
            self.pool.release(&agent_id);
            self.scheduler.finish(job_id, Utc::now());
            return Err(e.into());
        }

        if let Some(agent) = self.agents.get_mut(&agent_id) {
            agent.job_id = Some(job_id.to_string());
        }
        if let Some(record) = self.jobs.get_mut(job_id) {
            record.agent_id = Some(agent_id.clone());
        }
        tracing::debug!(job_id = %job_id, agent_id = %agent_id, "Dispatched job");
        Ok(())
    }

    /// Find a usable idle agent, or spawn one. The agent comes back busy.
    fn schedule_agent(&mut self) -> Result<AgentId, Error> {
        while let Some(agent_id) = self.pool.allocate() {
            match self.agents.get(&agent_id) {
                Some(agent) if agent.channel.is_writable() => return Ok(agent_id),
                _ => {
                    tracing::debug!(agent_id = %agent_id, "Retiring unreachable idle agent");
                    self.pool.retire(&agent_id);
                }
            }
        }

        let spawned = self.host.spawn()?;
        let agent_id = spawned.id.clone();
        self.register_agent(spawned);
        self.pool.add(agent_id.clone(), true);
        Ok(agent_id)
    }

    fn register_agent(&mut self, spawned: SpawnedAgent) {
        tracing::info!(agent_id = %spawned.id, pid = spawned.pid, "Registered agent");
        self.pids.insert(spawned.pid, spawned.id.clone());
        self.inbound.insert(
            spawned.id.clone(),
            UnboundedReceiverStream::new(spawned.inbox),
        );
        self.agents.insert(
            spawned.id,
            AgentRecord {
                pid: spawned.pid,
                job_id: None,
                channel: spawned.channel,
            },
        );
    }

    /// Apply one message from an agent.
    pub fn on_message(&mut self, agent_id: &AgentId, message: Message) {
        match message.kind() {
            Ok(MessageKind::JobFinished) => self.on_job_finished(agent_id),
            Ok(MessageKind::StopSending) => {
                tracing::debug!(agent_id = %agent_id, "Agent asked for no more work");
                self.pool.retire(agent_id);
                let sent = match self.agents.get(agent_id) {
                    Some(agent) => agent.channel.send(Message::last_message()),
                    None => Ok(()),
                };
                if let Err(e) = sent {
                    self.report(Some(agent_id), &e.into());
                }
            }
            Ok(MessageKind::KillMe) => {
                if let Some(agent) = self.agents.get(agent_id) {
                    tracing::debug!(agent_id = %agent_id, pid = agent.pid, "Agent asked to be killed");
                    self.host.kill(agent.pid);
                }
            }
            Ok(kind) => self.unhandled(agent_id, &message, &kind.to_string()),
            Err(e) => self.unhandled(agent_id, &message, &e.to_string()),
        }
    }

    fn on_job_finished(&mut self, agent_id: &AgentId) {
        self.pool.release(agent_id);
        let Some(job_id) = self
            .agents
            .get_mut(agent_id)
            .and_then(|agent| agent.job_id.take())
        else {
            tracing::debug!(agent_id = %agent_id, "Job finished from agent with no assignment");
            return;
        };
        tracing::debug!(agent_id = %agent_id, job_id = %job_id, "Job finished");
        self.scheduler.finish(&job_id, Utc::now());
        self.clear_assignment(&job_id);
    }

    /// Reconcile an exited agent. Its job becomes eligible again on its next tick.
    pub fn on_agent_exit(&mut self, pid: u32) {
        let Some(agent_id) = self.pids.remove(&pid) else {
            tracing::debug!(pid, "Reaped unknown pid");
            return;
        };

        if let Some(agent) = self.agents.remove(&agent_id)
            && let Some(job_id) = agent.job_id
        {
            tracing::warn!(agent_id = %agent_id, job_id = %job_id, "Agent exited while running job");
            self.scheduler.finish(&job_id, Utc::now());
            self.clear_assignment(&job_id);
        }
        self.pool.remove(&agent_id);
        self.inbound.remove(&agent_id);

        tracing::info!(agent_id = %agent_id, pid, "Agent exited");
        self.events.emit(DispatchEvent::AgentExit { agent_id, pid });
    }

    /// Collect exited agents from the host.
    pub fn reap_exited(&mut self) {
        for pid in self.host.reap() {
            self.on_agent_exit(pid);
        }
    }

    /// Advance the scheduler one tick and dispatch whatever fired.
    pub fn tick(&mut self) {
        for job_id in self.scheduler.on_tick(Utc::now()) {
            if let Err(e) = self.dispatch(&job_id) {
                tracing::warn!(job_id = %job_id, "Dispatch failed: {}", e);
                self.events.emit(DispatchEvent::Error {
                    agent_id: None,
                    message: e.to_string(),
                });
            }
        }
    }

    /// Request shutdown. The first recorded error is returned from `run`.
    /// Ignored unless the coordinator is running.
    pub fn shutdown(&mut self, error: Option<Error>) {
        if !self.state.is_running() {
            tracing::debug!(state = %self.state, "Shutdown requested while not running");
            return;
        }
        if let Some(error) = error {
            match self.shutdown_error {
                None => {
                    tracing::error!("Shutting down: {}", error);
                    self.shutdown_error = Some(error);
                }
                Some(_) => tracing::warn!("Additional shutdown error: {}", error),
            }
        }
        tracing::info!("Coordinator shutting down");
        self.transition(RunState::Shutting);
    }

    /// Run until shut down, then wind down every agent.
    pub async fn run(&mut self) -> Result<(), Error> {
        self.transition(RunState::Running);
        self.events.emit(DispatchEvent::Started { agent_id: None });
        tracing::info!(
            jobs = self.jobs.len(),
            "Coordinator started ({:.1} ticks/s)",
            self.scheduler.rate().ticks_per_second()
        );
        self.scheduler.start(Utc::now());

        let mut ticker = interval(self.config.tick);
        // The first tick completes immediately.
        ticker.tick().await;

        while self.state.is_running() {
            match self.pump(Some(&mut ticker), self.config.patrol_period).await {
                Wake::Tick => self.tick(),
                Wake::Message(agent_id, message) => self.on_message(&agent_id, message),
                Wake::Command(command) => self.on_command(command),
                Wake::Idle => {}
            }
            self.reap_exited();
            self.events.emit(DispatchEvent::Patrol);
        }

        self.scheduler.clear();
        self.inform_agents_quit().await;

        self.transition(RunState::Shutdown);
        self.events.emit(DispatchEvent::Shutdown { agent_id: None });
        tracing::info!("Coordinator stopped");
        match self.shutdown_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Broadcast last-message until every agent is gone or the timeout passes.
    async fn inform_agents_quit(&mut self) {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        let mut retry = interval(self.config.last_message_retry);

        while !self.agents.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(
                    agents = self.agents.len(),
                    "Shutdown timed out with agents still registered"
                );
                break;
            }
            match self.pump(Some(&mut retry), remaining).await {
                Wake::Tick => self.broadcast_last_message(),
                Wake::Message(agent_id, message) => self.on_message(&agent_id, message),
                Wake::Command(command) => self.on_command(command),
                Wake::Idle => {}
            }
            self.reap_exited();
        }
    }

    fn broadcast_last_message(&self) {
        for (agent_id, agent) in &self.agents {
            if let Err(e) = agent.channel.send(Message::last_message()) {
                tracing::debug!(agent_id = %agent_id, "Last message not delivered: {}", e);
            }
        }
    }

    /// Wait up to `wait` for the next tick, agent message or command.
    async fn pump(&mut self, ticker: Option<&mut Interval>, wait: Duration) -> Wake {
        let has_inbound = !self.inbound.is_empty();
        tokio::select! {
            _ = next_tick(ticker) => Wake::Tick,
            Some((agent_id, message)) = self.inbound.next(), if has_inbound => {
                Wake::Message(agent_id, message)
            }
            Some(command) = self.commands.recv() => Wake::Command(command),
            _ = sleep(wait) => Wake::Idle,
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::AddJob {
                id,
                payload,
                timing,
            } => self.add_job(&id, payload, timing),
            Command::RemoveJob { id } => self.remove_job(&id),
            Command::StopJob { id } => {
                if let Err(e) = self.stop_job(&id) {
                    self.report(None, &e);
                }
            }
            Command::Shutdown { reason } => {
                self.shutdown(reason.map(|reason| Error::Aborted { reason }))
            }
        }
    }

    fn send_stop(&self, job_id: &str, agent_id: &AgentId) -> Result<(), Error> {
        let agent = self
            .agents
            .get(agent_id)
            .ok_or_else(|| ChannelError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })?;
        agent.channel.send(Message::stop_execution(job_id)?)?;
        tracing::debug!(job_id = %job_id, agent_id = %agent_id, "Sent stop-execution");
        Ok(())
    }

    fn clear_assignment(&mut self, job_id: &str) {
        let Some(record) = self.jobs.get_mut(job_id) else {
            return;
        };
        record.agent_id = None;
        if record.pending_removal {
            tracing::debug!(job_id = %job_id, "Erasing removed job");
            self.jobs.remove(job_id);
        }
    }

    fn unhandled(&self, agent_id: &AgentId, message: &Message, what: &str) {
        tracing::warn!(agent_id = %agent_id, tag = message.tag, "Unhandled message: {}", what);
        self.events.emit(DispatchEvent::UnhandledMessage {
            agent_id: agent_id.clone(),
            tag: message.tag,
        });
    }

    fn report(&self, agent_id: Option<&AgentId>, error: &Error) {
        tracing::warn!("{}", error);
        self.events.emit(DispatchEvent::Error {
            agent_id: agent_id.cloned(),
            message: error.to_string(),
        });
    }

    fn transition(&mut self, next: RunState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!("Unexpected coordinator transition {} -> {}", self.state, next);
        }
        self.state = next;
    }
}

async fn next_tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::channel;
    use crate::error::SpawnError;
    use crate::host::{AgentFactory, ProcessControl};
    use crate::protocol::StopExecution;
    use crate::timer::Period;

    /// Agent-side halves of a fake agent.
    struct FakeAgent {
        id: AgentId,
        pid: u32,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    #[derive(Default)]
    struct FakeState {
        agents: Vec<FakeAgent>,
        killed: Vec<u32>,
        exited: Vec<u32>,
        fail_sends: bool,
        fail_spawn: bool,
    }

    struct FakeHost(Arc<Mutex<FakeState>>);

    struct FailingChannel;

    impl AgentChannel for FailingChannel {
        fn send(&self, _message: Message) -> Result<(), ChannelError> {
            Err(ChannelError::SendFailed {
                peer: "fake".into(),
                reason: "broken pipe".into(),
            })
        }

        fn is_writable(&self) -> bool {
            true
        }
    }

    impl AgentFactory for FakeHost {
        fn spawn(&mut self) -> Result<SpawnedAgent, SpawnError> {
            let mut state = self.0.lock().unwrap();
            if state.fail_spawn {
                return Err(SpawnError::Failed("no capacity".into()));
            }
            let id = AgentId::from(format!("agent-{}", state.agents.len() + 1).as_str());
            let pid = state.agents.len() as u32 + 100;
            let (to_agent, agent_inbox) = channel::memory(id.to_string());
            let (_to_coordinator, coordinator_inbox) = channel::memory("coordinator");
            let channel: Box<dyn AgentChannel> = if state.fail_sends {
                Box::new(FailingChannel)
            } else {
                Box::new(to_agent)
            };
            state.agents.push(FakeAgent {
                id: id.clone(),
                pid,
                rx: agent_inbox.into_inner(),
            });
            Ok(SpawnedAgent {
                id,
                pid,
                channel,
                inbox: coordinator_inbox.into_inner(),
            })
        }
    }

    impl ProcessControl for FakeHost {
        fn reap(&mut self) -> Vec<u32> {
            std::mem::take(&mut self.0.lock().unwrap().exited)
        }

        fn kill(&mut self, pid: u32) {
            self.0.lock().unwrap().killed.push(pid);
        }
    }

    fn coordinator() -> (Coordinator, Arc<Mutex<FakeState>>) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        let host = FakeHost(Arc::clone(&state));
        let coordinator = Coordinator::new(
            CoordinatorConfig::default(),
            Box::new(host),
            EventBus::new(64),
        );
        (coordinator, state)
    }

    fn echo() -> JobPayload {
        JobPayload::new("echo", serde_json::json!({"message": "hi"}))
    }

    fn every_second() -> Timing {
        Timing::every(Period::from_secs(1), false)
    }

    fn agent_id(state: &Arc<Mutex<FakeState>>, index: usize) -> AgentId {
        state.lock().unwrap().agents[index].id.clone()
    }

    fn received(state: &Arc<Mutex<FakeState>>, index: usize) -> Vec<Message> {
        let mut state = state.lock().unwrap();
        let mut messages = Vec::new();
        while let Ok(message) = state.agents[index].rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn dispatch_spawns_and_assigns() {
        let (mut coordinator, state) = coordinator();
        coordinator.add_job("a", echo(), every_second());
        coordinator.dispatch("a").unwrap();

        let agent = agent_id(&state, 0);
        let messages = received(&state, 0);
        assert_eq!(messages.len(), 1);
        let assignment: JobAssignment = messages[0].decode().unwrap();
        assert_eq!(assignment.job_id, "a");
        assert_eq!(assignment.job, echo());

        assert_eq!(coordinator.job("a").unwrap().agent_id, Some(agent.clone()));
        assert_eq!(coordinator.pool().busy_count(), 1);
        assert_eq!(coordinator.agents[&agent].job_id.as_deref(), Some("a"));
    }

    #[test]
    fn duplicate_or_unknown_dispatch_is_noop() {
        let (mut coordinator, state) = coordinator();
        coordinator.add_job("a", echo(), every_second());
        coordinator.dispatch("a").unwrap();
        coordinator.dispatch("a").unwrap();
        coordinator.dispatch("missing").unwrap();

        assert_eq!(state.lock().unwrap().agents.len(), 1);
        assert_eq!(received(&state, 0).len(), 1);
    }

    #[test]
    fn finished_agent_is_reused_lifo() {
        let (mut coordinator, state) = coordinator();
        coordinator.add_job("a", echo(), every_second());
        coordinator.add_job("b", echo(), every_second());
        coordinator.add_job("c", echo(), every_second());
        coordinator.dispatch("a").unwrap();
        coordinator.dispatch("b").unwrap();
        let first = agent_id(&state, 0);
        let second = agent_id(&state, 1);

        coordinator.on_message(&second, Message::job_finished());
        coordinator.on_message(&first, Message::job_finished());
        assert_eq!(coordinator.pool().idle_count(), 2);
        assert_eq!(coordinator.job("a").unwrap().agent_id, None);

        coordinator.dispatch("c").unwrap();
        assert_eq!(state.lock().unwrap().agents.len(), 2);
        assert_eq!(coordinator.job("c").unwrap().agent_id, Some(first));
    }

    #[test]
    fn removing_running_job_waits_for_finish() {
        let (mut coordinator, state) = coordinator();
        coordinator.add_job("a", echo(), every_second());
        coordinator.dispatch("a").unwrap();
        received(&state, 0);

        coordinator.remove_job("a");
        let record = coordinator.job("a").unwrap();
        assert!(record.pending_removal);
        let messages = received(&state, 0);
        assert_eq!(messages.len(), 1);
        let stop: StopExecution = messages[0].decode().unwrap();
        assert_eq!(stop.job_id, "a");

        coordinator.on_message(&agent_id(&state, 0), Message::job_finished());
        assert!(coordinator.job("a").is_none());
        assert_eq!(coordinator.pool().idle_count(), 1);
    }

    #[test]
    fn readding_clears_pending_removal() {
        let (mut coordinator, state) = coordinator();
        coordinator.add_job("a", echo(), every_second());
        coordinator.dispatch("a").unwrap();
        coordinator.remove_job("a");
        coordinator.add_job("a", echo(), every_second());

        coordinator.on_message(&agent_id(&state, 0), Message::job_finished());
        let record = coordinator.job("a").unwrap();
        assert!(!record.pending_removal);
        assert_eq!(record.agent_id, None);
    }

    #[test]
    fn removing_idle_or_unknown_job() {
        let (mut coordinator, _state) = coordinator();
        coordinator.add_job("a", echo(), every_second());
        coordinator.remove_job("a");
        assert!(coordinator.job("a").is_none());

        coordinator.remove_job("missing");
        assert_eq!(coordinator.job_count(), 0);
    }

    #[test]
    fn stop_job_only_reaches_running_jobs() {
        let (mut coordinator, state) = coordinator();
        coordinator.add_job("a", echo(), every_second());
        coordinator.add_job("b", echo(), every_second());
        coordinator.stop_job("a").unwrap();
        coordinator.stop_job("missing").unwrap();

        coordinator.dispatch("b").unwrap();
        received(&state, 0);
        coordinator.stop_job("b").unwrap();
        let messages = received(&state, 0);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind().unwrap(), MessageKind::StopExecution);
    }

    #[test]
    fn stop_sending_retires_and_replies() {
        let (mut coordinator, state) = coordinator();
        coordinator.add_job("a", echo(), every_second());
        coordinator.dispatch("a").unwrap();
        let agent = agent_id(&state, 0);
        coordinator.on_message(&agent, Message::job_finished());
        received(&state, 0);

        coordinator.on_message(&agent, Message::stop_sending());
        assert_eq!(coordinator.pool().retired_count(), 1);
        assert_eq!(received(&state, 0), vec![Message::last_message()]);

        coordinator.dispatch("a").unwrap();
        assert_eq!(state.lock().unwrap().agents.len(), 2);
    }

    #[test]
    fn kill_me_kills_pid() {
        let (mut coordinator, state) = coordinator();
        coordinator.add_job("a", echo(), every_second());
        coordinator.dispatch("a").unwrap();
        let (agent, pid) = {
            let state = state.lock().unwrap();
            (state.agents[0].id.clone(), state.agents[0].pid)
        };
        coordinator.on_message(&agent, Message::kill_me());
        assert_eq!(state.lock().unwrap().killed, vec![pid]);
    }

    #[test]
    fn unknown_message_is_reported() {
        let (mut coordinator, state) = coordinator();
        let mut events = coordinator.events.subscribe();
        coordinator.add_job("a", echo(), every_second());
        coordinator.dispatch("a").unwrap();
        let agent = agent_id(&state, 0);

        coordinator.on_message(
            &agent,
            Message {
                tag: 99,
                payload: Vec::new(),
            },
        );
        coordinator.on_message(&agent, Message::last_message());

        let tags: Vec<u16> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|event| match event {
                DispatchEvent::UnhandledMessage { tag, .. } => Some(tag),
                _ => None,
            })
            .collect();
        assert_eq!(tags, vec![99, 4]);
        assert_eq!(coordinator.job("a").unwrap().agent_id, Some(agent));
    }

    #[test]
    fn finished_without_assignment_is_ignored() {
        let (mut coordinator, state) = coordinator();
        coordinator.add_job("a", echo(), every_second());
        coordinator.dispatch("a").unwrap();
        let agent = agent_id(&state, 0);
        coordinator.on_message(&agent, Message::job_finished());
        coordinator.on_message(&agent, Message::job_finished());
        coordinator.on_message(&AgentId::from("ghost"), Message::job_finished());
        assert_eq!(coordinator.pool().idle_count(), 1);
    }

    #[test]
    fn stray_finished_frees_busy_agent() {
        let (mut coordinator, state) = coordinator();
        coordinator.add_job("a", echo(), every_second());
        coordinator.dispatch("a").unwrap();
        let agent = agent_id(&state, 0);
        coordinator.agents.get_mut(&agent).unwrap().job_id = None;
        assert_eq!(coordinator.pool().busy_count(), 1);

        coordinator.on_message(&agent, Message::job_finished());
        assert_eq!(coordinator.pool().busy_count(), 0);
        assert_eq!(coordinator.pool().idle_count(), 1);
    }

    #[test]
    fn dead_agent_job_is_retried_next_tick() {
        let (mut coordinator, state) = coordinator();
        coordinator.add_job("a", echo(), every_second());
        coordinator.scheduler.start(Utc::now());

        coordinator.tick();
        let (agent, pid) = {
            let state = state.lock().unwrap();
            (state.agents[0].id.clone(), state.agents[0].pid)
        };
        assert_eq!(coordinator.job("a").unwrap().agent_id, Some(agent.clone()));
        assert!(coordinator.scheduler.is_executing("a"));

        state.lock().unwrap().exited.push(pid);
        coordinator.reap_exited();
        assert_eq!(coordinator.job("a").unwrap().agent_id, None);
        assert!(!coordinator.scheduler.is_executing("a"));
        assert_eq!(coordinator.agent_count(), 0);
        assert!(coordinator.pool().is_empty());

        coordinator.tick();
        assert_eq!(state.lock().unwrap().agents.len(), 2);
        let replacement = agent_id(&state, 1);
        assert_eq!(coordinator.job("a").unwrap().agent_id, Some(replacement));
    }

    #[test]
    fn exit_erases_pending_removal() {
        let (mut coordinator, state) = coordinator();
        coordinator.add_job("a", echo(), every_second());
        coordinator.dispatch("a").unwrap();
        coordinator.remove_job("a");

        let pid = state.lock().unwrap().agents[0].pid;
        state.lock().unwrap().exited.push(pid);
        coordinator.reap_exited();
        assert!(coordinator.job("a").is_none());
    }

    #[test]
    fn send_failure_releases_agent() {
        let (mut coordinator, state) = coordinator();
        state.lock().unwrap().fail_sends = true;
        coordinator.add_job("a", echo(), every_second());
        coordinator.scheduler.start(Utc::now());

        assert_eq!(coordinator.scheduler.on_tick(Utc::now()), vec!["a".to_string()]);
        let result = coordinator.dispatch("a");
        assert!(matches!(
            result,
            Err(Error::Channel(ChannelError::SendFailed { .. }))
        ));
        assert_eq!(coordinator.pool().idle_count(), 1);
        assert_eq!(coordinator.job("a").unwrap().agent_id, None);
        assert!(!coordinator.scheduler.is_executing("a"));
        assert!(coordinator.scheduler.scheduled_tick("a").is_some());
    }

    #[test]
    fn spawn_failure_finishes_tick_job() {
        let (mut coordinator, state) = coordinator();
        state.lock().unwrap().fail_spawn = true;
        coordinator.add_job("a", echo(), every_second());
        coordinator.scheduler.start(Utc::now());
        coordinator.scheduler.on_tick(Utc::now());

        assert!(matches!(coordinator.dispatch("a"), Err(Error::Spawn(_))));
        assert!(!coordinator.scheduler.is_executing("a"));
    }

    #[test]
    fn unreachable_idle_agent_is_retired() {
        let (mut coordinator, state) = coordinator();
        coordinator.add_job("a", echo(), every_second());
        coordinator.add_job("b", echo(), every_second());
        coordinator.dispatch("a").unwrap();
        let first = agent_id(&state, 0);
        coordinator.on_message(&first, Message::job_finished());

        // Agent side goes away.
        let (_, rx) = mpsc::unbounded_channel();
        drop(std::mem::replace(&mut state.lock().unwrap().agents[0].rx, rx));

        coordinator.dispatch("b").unwrap();
        assert_eq!(coordinator.pool().retired_count(), 1);
        assert_eq!(coordinator.job("b").unwrap().agent_id, Some(agent_id(&state, 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_shutdown_reason() {
        let (mut coordinator, _state) = coordinator();
        let handle = coordinator.handle();
        handle.shutdown(Some("operator".into())).unwrap();

        let result = coordinator.run().await;
        assert!(matches!(result, Err(Error::Aborted { ref reason }) if reason == "operator"));
        assert_eq!(coordinator.state(), RunState::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_before_run_leaves_no_error() {
        let (mut coordinator, _state) = coordinator();
        coordinator.shutdown(Some(Error::Aborted {
            reason: "too early".into(),
        }));
        assert_eq!(coordinator.state(), RunState::Shutdown);

        coordinator.handle().shutdown(None).unwrap();
        assert!(coordinator.run().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn patrol_wakes_idle_coordinator() {
        let config = CoordinatorConfig {
            tick: Duration::from_secs(3_600),
            patrol_period: Duration::from_secs(5),
            ..Default::default()
        };
        let state = Arc::new(Mutex::new(FakeState::default()));
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let mut coordinator =
            Coordinator::new(config, Box::new(FakeHost(Arc::clone(&state))), events);
        let handle = coordinator.handle();

        let task = tokio::spawn(async move {
            let result = coordinator.run().await;
            (coordinator, result)
        });
        sleep(Duration::from_millis(21_000)).await;
        handle.shutdown(None).unwrap();
        let (_, result) = task.await.unwrap();
        assert!(result.is_ok());

        let patrols = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|event| matches!(event, DispatchEvent::Patrol))
            .count();
        // Four idle wakes at 5s, 10s, 15s and 20s, plus the pump that took the shutdown.
        assert_eq!(patrols, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_gives_up_after_timeout() {
        let (mut coordinator, state) = coordinator();
        coordinator.add_job("a", echo(), every_second());
        coordinator.dispatch("a").unwrap();
        coordinator.handle().shutdown(None).unwrap();

        let started = Instant::now();
        assert!(coordinator.run().await.is_ok());
        assert!(started.elapsed() >= Duration::from_secs(30));
        // Broadcast once per retry interval.
        let last_messages = received(&state, 0)
            .into_iter()
            .filter(|m| *m == Message::last_message())
            .count();
        assert!(last_messages >= 30);
        assert_eq!(coordinator.agent_count(), 1);
    }
}
