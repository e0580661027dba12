use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::DeleteParams;
use kube::{Api, Client};
use thiserror::Error;
use tokio::sync::watch as signal;
use tracing::{debug, info, warn};

use crate::apis::NodeClaim;
use crate::disruption::Command;
use crate::events::EventPublisher;
use crate::providers::provider::ProviderId;
use crate::state::Cluster;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("candidate {0} already belongs to an in-flight command")]
    Overlap(ProviderId),
}

#[derive(Debug)]
enum Outcome {
    /// Replacements still coming up; check again next pass.
    InProgress,
    /// Candidates deleted; command complete.
    Done,
    /// Command cannot complete; roll back its bookkeeping.
    Unrecoverable(String),
}

struct QueueState {
    commands: BTreeMap<uuid::Uuid, Command>,
    by_provider: BTreeMap<ProviderId, uuid::Uuid>,
}

/// Rate-limited executor for disruption commands, with launch-and-wait
/// semantics: replacements must be Initialized before any candidate is
/// deleted. The providerID index guarantees no two in-flight commands
/// share a candidate.
pub struct OrchestrationQueue {
    client: Client,
    cluster: Arc<Cluster>,
    events: EventPublisher,
    /// Per-command budget from creation to completion.
    max_retry: Duration,
    /// How long a vanished replacement is forgiven as eventual
    /// consistency before the command is abandoned.
    replacement_grace: Duration,
    inner: Mutex<QueueState>,
}

impl OrchestrationQueue {
    pub fn new(
        client: Client,
        cluster: Arc<Cluster>,
        max_retry: Duration,
        replacement_grace: Duration,
    ) -> Self {
        Self {
            events: EventPublisher::new(client.clone()),
            client,
            cluster,
            max_retry,
            replacement_grace,
            inner: Mutex::new(QueueState {
                commands: BTreeMap::new(),
                by_provider: BTreeMap::new(),
            }),
        }
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().unwrap().commands.len()
    }

    pub fn contains(&self, provider_id: &ProviderId) -> bool {
        self.inner.lock().unwrap().by_provider.contains_key(provider_id)
    }

    pub fn submit(&self, command: Command) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        for (provider_id, _) in &command.candidates {
            if inner.by_provider.contains_key(provider_id) {
                return Err(QueueError::Overlap(provider_id.clone()));
            }
        }
        for (provider_id, _) in &command.candidates {
            inner.by_provider.insert(provider_id.clone(), command.id);
        }
        debug!(command = %command.id, "command enqueued");
        inner.commands.insert(command.id, command);
        crate::metrics::QUEUE_DEPTH.set(inner.commands.len() as i64);
        Ok(())
    }

    pub async fn run(&self, interval: Duration, mut shutdown: signal::Receiver<bool>) {
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tick.tick() => self.process_all().await,
            }
        }
    }

    async fn process_all(&self) {
        let commands: Vec<Command> = {
            let inner = self.inner.lock().unwrap();
            inner.commands.values().cloned().collect()
        };
        for command in commands {
            match self.process(&command).await {
                Outcome::InProgress => {}
                Outcome::Done => {
                    info!(command = %command.id, "disruption command complete");
                    crate::metrics::DISRUPTION_DECISIONS
                        .with_label_values(&[
                            &command.reason.to_string(),
                            "succeeded",
                            &command
                                .consolidation_type
                                .map(|c| c.to_string())
                                .unwrap_or_default(),
                        ])
                        .inc();
                    self.remove(&command);
                }
                Outcome::Unrecoverable(message) => {
                    warn!(command = %command.id, message, "disruption command unrecoverable");
                    crate::metrics::DISRUPTION_DECISIONS
                        .with_label_values(&[
                            &command.reason.to_string(),
                            "failed",
                            &command
                                .consolidation_type
                                .map(|c| c.to_string())
                                .unwrap_or_default(),
                        ])
                        .inc();
                    let ids: Vec<ProviderId> =
                        command.candidates.iter().map(|(id, _)| id.clone()).collect();
                    // Surviving candidates go back into circulation.
                    self.cluster.unmark_for_deletion(&ids);
                    for (_, claim_name) in &command.candidates {
                        self.events
                            .warning(
                                &claim_ref(claim_name),
                                "DisruptionFailed",
                                &format!(
                                    "abandoning disruption command: {message}{}",
                                    command
                                        .last_error
                                        .as_ref()
                                        .map(|e| format!(" (last error: {e})"))
                                        .unwrap_or_default()
                                ),
                            )
                            .await;
                    }
                    self.remove(&command);
                }
            }
        }
    }

    async fn process(&self, command: &Command) -> Outcome {
        if command.created_at.elapsed() > self.max_retry {
            return Outcome::Unrecoverable("exceeded maxRetryDuration".into());
        }

        let api: Api<NodeClaim> = Api::all(self.client.clone());
        for name in &command.replacements {
            match api.get_opt(name).await {
                Ok(Some(claim)) => {
                    if claim.is_terminating() {
                        return Outcome::Unrecoverable(format!("replacement {name} is terminating"));
                    }
                    if !claim.is_initialized() {
                        debug!(command = %command.id, replacement = %name, "waiting for replacement to initialize");
                        return Outcome::InProgress;
                    }
                }
                Ok(None) => {
                    // A freshly created claim may lag the cache; beyond
                    // the grace it is genuinely gone.
                    if command.created_at.elapsed() > self.replacement_grace {
                        return Outcome::Unrecoverable(format!("replacement {name} no longer exists"));
                    }
                    return Outcome::InProgress;
                }
                Err(e) => {
                    self.record_error(command, &e.to_string());
                    return Outcome::InProgress;
                }
            }
        }

        // All replacements ready: release the candidates. Deletion is
        // idempotent; the termination controller takes it from here.
        for (_, claim_name) in &command.candidates {
            match api.delete(claim_name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => {
                    self.record_error(command, &e.to_string());
                    return Outcome::InProgress;
                }
            }
        }
        Outcome::Done
    }

    fn record_error(&self, command: &Command, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cmd) = inner.commands.get_mut(&command.id) {
            cmd.last_error = Some(error.to_string());
        }
    }

    fn remove(&self, command: &Command) {
        let mut inner = self.inner.lock().unwrap();
        inner.commands.remove(&command.id);
        for (provider_id, _) in &command.candidates {
            inner.by_provider.remove(provider_id);
        }
        crate::metrics::QUEUE_DEPTH.set(inner.commands.len() as i64);
    }
}

fn claim_ref(name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("canopy/v1alpha1".into()),
        kind: Some("NodeClaim".into()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}
