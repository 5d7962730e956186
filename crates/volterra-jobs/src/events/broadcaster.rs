//! Per-process fan-out of job updates to connected clients.

use super::{EventSubscriber, JobUpdate, JobUpdateEnvelope};
use crate::error::JobResult;
use crate::metrics::EventMetrics;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Event emitted to one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// A job update for the client's team.
    JobUpdate(JobUpdate),
    /// Updates were evicted from the pre-ready buffer; the client should poll.
    UpdatesDropped { count: u64 },
    /// Last event on a receiver whose client moved to another team.
    TeamLeft { team_id: String },
}

struct ClientState {
    team_id: String,
    init_start_time: DateTime<Utc>,
    ready: bool,
    pending: VecDeque<JobUpdate>,
    dropped: u64,
    tx: mpsc::UnboundedSender<ClientEvent>,
}

/// Routes updates from the shared channel to clients of the matching team.
///
/// Updates that arrive after a client subscribed but before it signalled
/// readiness are buffered and flushed in arrival order by
/// [`mark_ready`](Self::mark_ready). The buffer is bounded; once full, the
/// oldest update is evicted and counted, and the flush starts with
/// [`ClientEvent::UpdatesDropped`].
#[derive(Clone)]
pub struct TeamBroadcaster {
    clients: Arc<Mutex<HashMap<String, ClientState>>>,
    capacity: usize,
}

impl TeamBroadcaster {
    /// Creates a broadcaster with a pre-ready buffer of `capacity` updates per client.
    pub fn new(capacity: usize) -> Self {
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Subscribes `client_id` to `team_id`, leaving `previous_team` if given.
    ///
    /// The client starts buffering until [`mark_ready`](Self::mark_ready).
    /// A repeated subscription replaces the previous receiver. When the
    /// client was in `previous_team`, its old receiver gets a final
    /// [`ClientEvent::TeamLeft`] and its unflushed updates are discarded.
    pub fn subscribe_to_team(
        &self,
        client_id: &str,
        team_id: &str,
        previous_team: Option<&str>,
    ) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut clients = self.clients.lock();

        let replaced = clients.insert(
            client_id.to_string(),
            ClientState {
                team_id: team_id.to_string(),
                init_start_time: Utc::now(),
                ready: false,
                pending: VecDeque::new(),
                dropped: 0,
                tx,
            },
        );

        if let (Some(previous), Some(old)) = (previous_team, replaced) {
            if previous != team_id && old.team_id == previous {
                let _ = old.tx.send(ClientEvent::TeamLeft {
                    team_id: old.team_id.clone(),
                });
                EventMetrics::team_switched();
                debug!(
                    client_id = %client_id,
                    team_id = %previous,
                    discarded = old.pending.len(),
                    "Client left team"
                );
            }
        }

        EventMetrics::clients(clients.len());
        info!(client_id = %client_id, team_id = %team_id, "Client subscribed to team");
        rx
    }

    /// Flushes buffered updates in arrival order and switches to live delivery.
    ///
    /// Returns the number of updates flushed.
    pub fn mark_ready(&self, client_id: &str) -> usize {
        let mut clients = self.clients.lock();
        let Some(client) = clients.get_mut(client_id) else {
            return 0;
        };

        if client.dropped > 0 {
            let _ = client.tx.send(ClientEvent::UpdatesDropped {
                count: client.dropped,
            });
            client.dropped = 0;
        }

        let mut flushed = 0;
        while let Some(update) = client.pending.pop_front() {
            if client.tx.send(ClientEvent::JobUpdate(update)).is_err() {
                break;
            }
            flushed += 1;
        }
        client.pending.clear();
        client.ready = true;

        debug!(
            client_id = %client_id,
            flushed,
            waited_ms = (Utc::now() - client.init_start_time).num_milliseconds(),
            "Client ready"
        );
        flushed
    }

    /// Forgets a client.
    pub fn disconnect(&self, client_id: &str) {
        let mut clients = self.clients.lock();
        if clients.remove(client_id).is_some() {
            EventMetrics::clients(clients.len());
            debug!(client_id = %client_id, "Client disconnected");
        }
    }

    /// Delivers or buffers `envelope` for every client of its team.
    ///
    /// Returns how many clients received or buffered the update.
    pub fn dispatch(&self, envelope: &JobUpdateEnvelope) -> usize {
        let mut clients = self.clients.lock();
        let mut reached = 0;
        let mut gone = Vec::new();

        for (client_id, client) in clients.iter_mut() {
            if client.team_id != envelope.team_id {
                continue;
            }

            if client.ready {
                if client
                    .tx
                    .send(ClientEvent::JobUpdate(envelope.payload.clone()))
                    .is_err()
                {
                    gone.push(client_id.clone());
                    continue;
                }
            } else {
                if client.pending.len() >= self.capacity {
                    client.pending.pop_front();
                    client.dropped += 1;
                    EventMetrics::evicted(1);
                }
                client.pending.push_back(envelope.payload.clone());
            }
            reached += 1;
        }

        for client_id in gone {
            clients.remove(&client_id);
            debug!(client_id = %client_id, "Dropped closed client");
        }
        reached
    }

    /// Connected clients of `team_id`.
    pub fn client_count(&self, team_id: &str) -> usize {
        self.clients
            .lock()
            .values()
            .filter(|c| c.team_id == team_id)
            .count()
    }

    /// Relays the shared channel into [`dispatch`](Self::dispatch) until shutdown.
    pub async fn run(
        &self,
        subscriber: Arc<dyn EventSubscriber>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JobResult<()> {
        let mut stream = subscriber.subscribe().await?;
        info!("Team broadcaster relay started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                next = stream.next() => match next {
                    Some(envelope) => {
                        self.dispatch(&envelope);
                    }
                    None => {
                        warn!("Event channel closed");
                        break;
                    }
                },
            }
        }

        info!("Team broadcaster relay stopped");
        Ok(())
    }
}
