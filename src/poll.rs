//! Ticket intake: poll the tracker and drive one engine run per ticket.

use anyhow::{Context, Result, bail};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::collab::{Collaborators, lifecycle};
use crate::config::Config;
use crate::graph::engine::Engine;
use crate::graph::standard_graph;
use crate::state::store::CheckpointStore;
use crate::state::{ExecutionState, RunStatus, TicketRef};

pub struct Pipeline {
    config: Arc<Config>,
    collab: Collaborators,
}

impl Pipeline {
    pub fn new(config: Arc<Config>, collab: Collaborators) -> Self {
        Self { config, collab }
    }

    fn engine(&self) -> Result<Engine> {
        let graph = standard_graph(self.config.clone(), &self.collab)
            .context("Failed to build the task graph")?;
        let store = CheckpointStore::new(self.config.state_dir.clone());
        Ok(Engine::new(graph, store, self.config.step_ceiling))
    }

    /// Drive one ticket from ready to a terminal status.
    pub async fn run_ticket(&self, ticket: TicketRef) -> Result<ExecutionState> {
        info!(identifier = ticket.identifier, title = ticket.title, "starting ticket run");
        self.collab
            .tracker
            .transition(&ticket.id, lifecycle::IN_PROGRESS)
            .await?;

        let state = self
            .engine()?
            .run(ExecutionState::for_ticket(ticket.clone()))
            .await?;

        if state.status == RunStatus::Complete {
            if let Err(err) = self
                .collab
                .tracker
                .transition(&ticket.id, lifecycle::DONE)
                .await
            {
                warn!(error = %err, "could not close ticket as done");
            }
        }

        // Failures the recovery stage never saw (supervisor rejection,
        // branch failure) still need to land on the ticket.
        if state.status == RunStatus::Failed && state.last_fault.is_none() {
            let reason = state
                .messages
                .last()
                .cloned()
                .unwrap_or_else(|| "no diagnostics recorded".to_string());
            if let Err(err) = self
                .collab
                .tracker
                .add_note(&ticket.id, &format!("Run failed: {reason}"))
                .await
            {
                warn!(error = %err, "could not post failure note");
            }
            if let Err(err) = self
                .collab
                .tracker
                .transition(&ticket.id, lifecycle::FAILED)
                .await
            {
                warn!(error = %err, "could not park ticket as failed");
            }
        }

        info!(identifier = ticket.identifier, status = %state.status, "ticket run finished");
        Ok(state)
    }

    /// One polling cycle: every ready ticket gets a run. Returns how many
    /// runs finished without an engine fault.
    pub async fn run_once(&self) -> Result<usize> {
        let tickets = self.collab.tracker.fetch_ready_tickets().await?;
        info!(count = tickets.len(), "fetched ready tickets");
        let mut finished = 0;
        for ticket in tickets {
            let identifier = ticket.identifier.clone();
            match self.run_ticket(ticket).await {
                Ok(_) => finished += 1,
                Err(err) => error!(identifier, error = %err, "ticket run aborted"),
            }
        }
        Ok(finished)
    }

    /// Poll forever at the configured interval.
    pub async fn watch(&self) -> Result<()> {
        info!(interval_secs = self.config.poll_interval.as_secs(), "watching for ready tickets");
        loop {
            if let Err(err) = self.run_once().await {
                error!(error = %err, "polling cycle failed");
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Run one specific ticket by its human-readable identifier.
    pub async fn run_identifier(&self, identifier: &str) -> Result<ExecutionState> {
        let tickets = self.collab.tracker.fetch_ready_tickets().await?;
        let Some(ticket) = tickets
            .into_iter()
            .find(|t| t.identifier.eq_ignore_ascii_case(identifier))
        else {
            bail!("no ready ticket with identifier '{identifier}'");
        };
        self.run_ticket(ticket).await
    }
}
