//! The pool's coordinating actor.
//!
//! A single task owns the submission queue, the resource set, the rate
//! window and the closed flag; every mutation happens inside its message
//! loop, which serializes queueing, dispatch, re-admission, timers and
//! close against each other. Resources run as their own tasks and talk
//! back over an event channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::auth::Credentials;
use crate::config::PoolOptions;
use crate::errors::SmtpError;
use crate::observability::{EventSink, LogEventKind};
use crate::transport::ConnectionFactory;
use crate::types::PoolStatus;

use super::rate::{Admission, RateWindow};
use super::resource::{
    Assignment, PoolResource, ResourceEvent, ResourceEventKind, ResourceId, Submission,
};

/// Delay before re-running the queue after a resource error.
const REDRAIN_DELAY: Duration = Duration::from_millis(100);

/// Requests from the pool facade.
pub(crate) enum PoolCommand {
    /// Enqueue a submission.
    Send(Submission),
    /// Close the pool; acked once the queue is drained and idle
    /// resources are shut down.
    Close { ack: oneshot::Sender<()> },
    /// Report whether a send right now would dispatch immediately.
    IsIdle(oneshot::Sender<bool>),
    /// Report pool occupancy.
    Status(oneshot::Sender<PoolStatus>),
}

struct ResourceMeta {
    id: ResourceId,
    available: bool,
    assignments: mpsc::UnboundedSender<Assignment>,
}

pub(crate) struct Dispatcher {
    options: Arc<PoolOptions>,
    credentials: Option<Credentials>,
    factory: Arc<dyn ConnectionFactory>,
    events: EventSink,
    commands: mpsc::UnboundedReceiver<PoolCommand>,
    resource_events: mpsc::UnboundedReceiver<ResourceEvent>,
    resource_events_tx: mpsc::UnboundedSender<ResourceEvent>,
    queue: VecDeque<Submission>,
    resources: Vec<ResourceMeta>,
    rate: RateWindow,
    rate_deadline: Option<Instant>,
    redrain_deadline: Option<Instant>,
    connection_counter: u64,
    closed: bool,
    was_idle: bool,
}

impl Dispatcher {
    pub(crate) fn new(
        options: Arc<PoolOptions>,
        credentials: Option<Credentials>,
        factory: Arc<dyn ConnectionFactory>,
        events: EventSink,
        commands: mpsc::UnboundedReceiver<PoolCommand>,
    ) -> Self {
        let (resource_events_tx, resource_events) = mpsc::unbounded_channel();
        let rate = RateWindow::new(options.rate_limit);
        Self {
            options,
            credentials,
            factory,
            events,
            commands,
            resource_events,
            resource_events_tx,
            queue: VecDeque::new(),
            resources: Vec::new(),
            rate,
            rate_deadline: None,
            redrain_deadline: None,
            connection_counter: 0,
            closed: false,
            was_idle: true,
        }
    }

    /// Runs the actor until every facade handle is dropped.
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.resource_events.recv() => {
                    self.handle_resource_event(event);
                }
                _ = sleep_until(self.rate_deadline.unwrap_or_else(Instant::now)),
                    if self.rate_deadline.is_some() =>
                {
                    self.rate_deadline = None;
                    self.handle_rate_window_elapsed();
                }
                _ = sleep_until(self.redrain_deadline.unwrap_or_else(Instant::now)),
                    if self.redrain_deadline.is_some() =>
                {
                    self.redrain_deadline = None;
                    self.drain();
                }
            }
            self.check_idle();
        }

        // Facade gone. Stop every remaining resource; in-flight sends
        // still complete because their tasks own the submissions.
        for meta in self.resources.drain(..) {
            let _ = meta.assignments.send(Assignment::Shutdown);
        }
        while let Some(submission) = self.queue.pop_front() {
            let _ = submission.done.send(Err(SmtpError::pool_closed()));
        }
    }

    fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Send(submission) => {
                if self.closed {
                    let _ = submission.done.send(Err(SmtpError::pool_closed()));
                    return;
                }
                self.queue.push_back(submission);
                self.drain();
            }
            PoolCommand::Close { ack } => {
                self.close();
                let _ = ack.send(());
            }
            PoolCommand::IsIdle(reply) => {
                let _ = reply.send(self.compute_idle());
            }
            PoolCommand::Status(reply) => {
                let _ = reply.send(PoolStatus {
                    connections: self.resources.len(),
                    available: self.resources.iter().filter(|r| r.available).count(),
                    queued: self.queue.len(),
                    max_connections: self.options.max_connections(),
                });
            }
        }
    }

    fn handle_resource_event(&mut self, event: ResourceEvent) {
        let ResourceEvent { id, kind } = event;
        if !self.resources.iter().any(|r| r.id == id) {
            // Already shut down; a late event from a stopped task.
            return;
        }

        match kind {
            ResourceEventKind::SendSucceeded => {
                if self.closed {
                    self.shutdown_resource(id);
                    return;
                }
                match self.rate.admit(id, Instant::now()) {
                    Admission::Admit => self.make_available(id),
                    Admission::Parked { arm_timer } => {
                        if let Some(delay) = arm_timer {
                            self.rate_deadline = Some(Instant::now() + delay);
                        }
                    }
                    Admission::Cleared(ids) => {
                        self.rate_deadline = None;
                        for id in ids {
                            self.make_available(id);
                        }
                    }
                }
            }
            ResourceEventKind::Exhausted { messages } => {
                self.events.log(
                    LogEventKind::Close,
                    format!("Connection #{} closed after {} messages", id, messages),
                );
                self.remove_resource(id);
                if !self.closed {
                    self.drain();
                }
            }
            ResourceEventKind::Failed { error } => {
                self.events
                    .log(LogEventKind::Error, format!("Connection #{}: {}", id, error));
                self.rate.forget(id);
                self.remove_resource(id);
                if !self.closed {
                    // Damp reconnect storms instead of redialing at once.
                    self.redrain_deadline = Some(Instant::now() + REDRAIN_DELAY);
                }
            }
            ResourceEventKind::Retired => {
                self.events.log(
                    LogEventKind::Close,
                    format!("Connection #{} ended by server", id),
                );
                self.rate.forget(id);
                self.remove_resource(id);
                if !self.closed {
                    self.drain();
                }
            }
        }
    }

    fn handle_rate_window_elapsed(&mut self) {
        for id in self.rate.clear() {
            self.make_available(id);
        }
    }

    /// Binds queued submissions to resources until one side runs out.
    fn drain(&mut self) {
        loop {
            if self.closed || self.queue.is_empty() {
                return;
            }

            let slot = match self.resources.iter().position(|r| r.available) {
                Some(slot) => slot,
                None if self.resources.len() < self.options.max_connections() => {
                    self.create_resource()
                }
                None => return,
            };

            let submission = match self.queue.pop_front() {
                Some(submission) => submission,
                None => return,
            };

            let meta = &mut self.resources[slot];
            meta.available = false;
            let id = meta.id;

            match meta.assignments.send(Assignment::Deliver(submission)) {
                Ok(()) => {
                    self.rate.charge(Instant::now());
                    self.events
                        .log(LogEventKind::Message, format!("Sending message on #{}", id));
                }
                Err(returned) => {
                    // The task ended between events; requeue at the front
                    // to keep FIFO order and drop the dead slot.
                    if let Assignment::Deliver(submission) = returned.0 {
                        self.queue.push_front(submission);
                    }
                    self.remove_resource(id);
                }
            }
        }
    }

    fn create_resource(&mut self) -> usize {
        self.connection_counter += 1;
        let id = self.connection_counter;

        let (assignments_tx, assignments_rx) = mpsc::unbounded_channel();
        let resource = PoolResource::new(
            id,
            self.factory.create(),
            self.credentials.clone(),
            self.options.max_messages(),
            assignments_rx,
            self.resource_events_tx.clone(),
        );
        tokio::spawn(resource.run());

        self.events
            .log(LogEventKind::Created, format!("Created new pool resource #{}", id));
        self.resources.push(ResourceMeta {
            id,
            available: true,
            assignments: assignments_tx,
        });
        self.resources.len() - 1
    }

    /// Re-admits a resource after rate clearance, or turns the
    /// notification into a shutdown when the pool closed meanwhile.
    fn make_available(&mut self, id: ResourceId) {
        if self.closed {
            self.shutdown_resource(id);
            return;
        }
        let Some(meta) = self.resources.iter_mut().find(|r| r.id == id) else {
            return;
        };
        meta.available = true;
        self.events
            .log(LogEventKind::Available, format!("Connection #{} became available", id));
        self.drain();
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.events.log(LogEventKind::Close, "Closing pool");
        }

        self.rate_deadline = None;
        self.redrain_deadline = None;

        // Parked resources would only resume through a timer that no
        // longer exists; shut them down with the available ones.
        for id in self.rate.clear() {
            self.shutdown_resource(id);
        }
        let idle_ids: Vec<ResourceId> = self
            .resources
            .iter()
            .filter(|r| r.available)
            .map(|r| r.id)
            .collect();
        for id in idle_ids {
            self.shutdown_resource(id);
        }

        // Everything still queued gets the terminal error; in-flight
        // resources shut down when their send completes.
        while let Some(submission) = self.queue.pop_front() {
            let _ = submission.done.send(Err(SmtpError::pool_closed()));
        }
    }

    fn shutdown_resource(&mut self, id: ResourceId) {
        if let Some(slot) = self.resources.iter().position(|r| r.id == id) {
            let meta = self.resources.remove(slot);
            let _ = meta.assignments.send(Assignment::Shutdown);
        }
    }

    fn remove_resource(&mut self, id: ResourceId) {
        self.resources.retain(|r| r.id != id);
    }

    fn compute_idle(&self) -> bool {
        !self.closed
            && (self.resources.iter().any(|r| r.available)
                || self.resources.len() < self.options.max_connections())
    }

    fn check_idle(&mut self) {
        let idle = self.compute_idle();
        if idle && !self.was_idle {
            self.events.idle();
        }
        self.was_idle = idle;
    }
}
