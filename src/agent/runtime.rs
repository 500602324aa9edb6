//! Agent run loop: receive assignments, execute jobs, negotiate shutdown.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::time::{Instant, sleep, sleep_until};

use crate::channel::{AgentChannel, AgentId, Inbox};
use crate::config::AgentConfig;
use crate::error::{ChannelError, Error, JobError, ProtocolError};
use crate::events::{DispatchEvent, EventBus};
use crate::job::{Job, JobContext, JobRegistry};
use crate::protocol::{JobAssignment, Message, MessageKind, StopExecution};
use crate::state::RunState;

/// What ended one pump of the agent's loop.
enum Wake {
    Message(Message),
    /// The inbox has no more senders.
    Closed,
    IdleExpired,
    Timeout,
}

/// A worker that executes jobs sent by the coordinator.
pub struct Agent {
    id: AgentId,
    config: AgentConfig,
    registry: Arc<JobRegistry>,
    channel: Box<dyn AgentChannel>,
    inbox: Inbox,
    events: EventBus,
    state: RunState,
    /// Job whose repeat loop is active. Cleared to stop the loop at its next boundary.
    repeating: Option<String>,
    idle_deadline: Option<Instant>,
}

impl Agent {
    pub fn new(
        id: AgentId,
        config: AgentConfig,
        registry: Arc<JobRegistry>,
        channel: Box<dyn AgentChannel>,
        inbox: Inbox,
        events: EventBus,
    ) -> Self {
        Self {
            id,
            config,
            registry,
            channel,
            inbox,
            events,
            state: RunState::Shutdown,
            repeating: None,
            idle_deadline: None,
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Run until shut down. Losing the link to the coordinator is an error.
    pub async fn run(&mut self) -> Result<(), Error> {
        self.transition(RunState::Running);
        self.events.emit(DispatchEvent::Started {
            agent_id: Some(self.id.clone()),
        });
        tracing::info!(agent_id = %self.id, "Agent started");
        self.arm_idle_timer();

        let result = loop {
            if self.state == RunState::Shutdown {
                break Ok(());
            }
            if self.is_disconnected() {
                tracing::warn!(agent_id = %self.id, "Lost connection to coordinator");
                self.events.emit(DispatchEvent::Disconnected {
                    agent_id: self.id.clone(),
                });
                self.transition(RunState::Shutdown);
                break Err(ChannelError::Disconnected {
                    agent_id: self.id.to_string(),
                }
                .into());
            }

            match self.pump(self.config.patrol_period, true).await {
                Wake::Message(message) => self.handle_message(message).await,
                Wake::IdleExpired => {
                    tracing::debug!(agent_id = %self.id, "Idle wait expired");
                    self.idle_deadline = None;
                    self.send(Message::stop_sending());
                }
                Wake::Closed | Wake::Timeout => {}
            }
        };

        self.events.emit(DispatchEvent::Shutdown {
            agent_id: Some(self.id.clone()),
        });
        tracing::info!(agent_id = %self.id, "Agent stopped");
        result
    }

    /// Wait up to `wait` for a message, or for the idle timer when `idle` is set.
    async fn pump(&mut self, wait: Duration, idle: bool) -> Wake {
        let idle_deadline = if idle { self.idle_deadline } else { None };
        let readable = self.inbox.is_readable();

        tokio::select! {
            message = self.inbox.recv(), if readable => match message {
                Some(message) => Wake::Message(message),
                None => Wake::Closed,
            },
            _ = until(idle_deadline) => Wake::IdleExpired,
            _ = sleep(wait) => Wake::Timeout,
        }
    }

    async fn handle_message(&mut self, message: Message) {
        self.idle_deadline = None;

        match message.kind() {
            Ok(MessageKind::JobAssignment) => self.on_job_assignment(&message).await,
            Ok(MessageKind::LastMessage) => self.run_shutdown(),
            Ok(MessageKind::StopExecution) => self.on_stop_execution(&message),
            Ok(kind) => self.report(
                ProtocolError::Unexpected {
                    kind: kind.to_string(),
                    context: "received by an agent".to_string(),
                }
                .into(),
            ),
            Err(e) => {
                tracing::warn!(agent_id = %self.id, "Dropping message: {}", e);
                self.events.emit(DispatchEvent::UnhandledMessage {
                    agent_id: self.id.clone(),
                    tag: message.tag,
                });
            }
        }

        if self.state.is_running() {
            self.arm_idle_timer();
        }
    }

    async fn on_job_assignment(&mut self, message: &Message) {
        match self.decode_assignment(message) {
            Ok((job_id, job)) => self.execute(job_id, job).await,
            Err(e) => self.report(e),
        }

        self.send(Message::job_finished());

        if self.state == RunState::Shutting {
            self.run_shutdown();
        } else if self.config.idle_wait.is_none() {
            self.send(Message::stop_sending());
        }
    }

    fn decode_assignment(&self, message: &Message) -> Result<(String, Box<dyn Job>), Error> {
        let assignment: JobAssignment = message.decode()?;
        if assignment.job_id.trim().is_empty() {
            return Err(ProtocolError::MissingField {
                kind: MessageKind::JobAssignment.to_string(),
                field: "job_id".to_string(),
            }
            .into());
        }
        let job = self.registry.build(&assignment.job)?;
        Ok((assignment.job_id, job))
    }

    /// Run a job, looping while its repeater allows and nobody stopped it.
    async fn execute(&mut self, job_id: String, mut job: Box<dyn Job>) {
        let started_at = Utc::now();
        let clock = Instant::now();
        self.events.emit(DispatchEvent::Executing {
            agent_id: self.id.clone(),
            job_id: job_id.clone(),
        });
        tracing::debug!(agent_id = %self.id, job_id = %job_id, "Executing job");

        let mut ctx = JobContext {
            job_id: job_id.clone(),
            agent_id: self.id.clone(),
            iteration: 0,
        };

        let outcome = match job.repeater() {
            None => run_once(job.as_mut(), &ctx).await,
            Some(mut repeater) => {
                self.repeating = Some(job_id.clone());
                let outcome = loop {
                    if let Err(e) = run_once(job.as_mut(), &ctx).await {
                        break Err(e);
                    }
                    if self.repeating.is_none()
                        || !repeater.is_repeatable(Utc::now())
                        || !self.channel.is_writable()
                    {
                        break Ok(());
                    }
                    self.wait_between_iterations(repeater.interval()).await;
                    if self.repeating.is_none() {
                        break Ok(());
                    }
                    ctx.iteration += 1;
                };
                self.repeating = None;
                outcome
            }
        };

        if let Err(e) = outcome {
            return self.report(e.into());
        }

        let runtime = clock.elapsed();
        self.events.emit(DispatchEvent::Executed {
            agent_id: self.id.clone(),
            job_id: job_id.clone(),
            started_at,
            runtime_ms: runtime.as_millis() as u64,
        });
        tracing::debug!(
            agent_id = %self.id,
            job_id = %job_id,
            iterations = ctx.iteration + 1,
            "Job executed in {:?}",
            runtime
        );
    }

    /// Sleep between two iterations while still handling control messages.
    async fn wait_between_iterations(&mut self, interval: Duration) {
        let deadline = Instant::now() + interval;
        while self.repeating.is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.pump(remaining, false).await {
                Wake::Message(message) => self.handle_loop_message(message),
                Wake::Timeout => break,
                Wake::Closed | Wake::IdleExpired => {}
            }
        }
    }

    fn handle_loop_message(&mut self, message: Message) {
        match message.kind() {
            Ok(MessageKind::StopExecution) => self.on_stop_execution(&message),
            Ok(MessageKind::LastMessage) => {
                tracing::debug!(agent_id = %self.id, "Last message during repeat loop");
                self.repeating = None;
                self.transition(RunState::Shutting);
            }
            Ok(kind) => self.report(
                ProtocolError::Unexpected {
                    kind: kind.to_string(),
                    context: "during a repeat loop".to_string(),
                }
                .into(),
            ),
            Err(e) => self.report(e.into()),
        }
    }

    fn on_stop_execution(&mut self, message: &Message) {
        let stop: StopExecution = match message.decode() {
            Ok(stop) => stop,
            Err(e) => return self.report(e.into()),
        };
        match &self.repeating {
            Some(active) if *active == stop.job_id => {
                tracing::debug!(agent_id = %self.id, job_id = %stop.job_id, "Stopping repeat loop");
                self.repeating = None;
            }
            Some(active) => self.report(
                ProtocolError::StopMismatch {
                    active: active.clone(),
                    requested: stop.job_id,
                }
                .into(),
            ),
            None => {
                tracing::debug!(
                    agent_id = %self.id,
                    job_id = %stop.job_id,
                    "No repeat loop active; ignoring stop"
                );
            }
        }
    }

    /// Active mode stops the loop; passive mode asks the coordinator to kill us.
    fn run_shutdown(&mut self) {
        if self.config.passive_shutdown {
            self.transition(RunState::Shutting);
            self.send(Message::kill_me());
        } else {
            self.transition(RunState::Shutdown);
        }
    }

    fn arm_idle_timer(&mut self) {
        if let Some(wait) = self.config.idle_wait
            && self.idle_deadline.is_none()
        {
            self.idle_deadline = Some(Instant::now() + wait);
        }
    }

    fn is_disconnected(&self) -> bool {
        !self.inbox.is_readable() && !self.channel.is_writable()
    }

    fn send(&self, message: Message) {
        if let Err(e) = self.channel.send(message) {
            self.report(e.into());
        }
    }

    fn report(&self, error: Error) {
        tracing::warn!(agent_id = %self.id, "{}", error);
        self.events.emit(DispatchEvent::Error {
            agent_id: Some(self.id.clone()),
            message: error.to_string(),
        });
    }

    fn transition(&mut self, next: RunState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!(agent_id = %self.id, "Unexpected transition {} -> {}", self.state, next);
        }
        self.state = next;
    }
}

/// Run one iteration, turning a panic into an error.
async fn run_once(job: &mut dyn Job, ctx: &JobContext) -> Result<(), JobError> {
    match AssertUnwindSafe(job.execute(ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(JobError::Panicked {
            job_id: ctx.job_id.clone(),
            reason: panic_message(panic.as_ref()),
        }),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
