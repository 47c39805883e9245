//! WebSocket message hub.
//!
//! One actor task owns every client and the `subject -> clients` index. All
//! mutations arrive as [`HubCommand`]s on a single bounded channel. Delivery to
//! a client uses `try_send` on that client's bounded buffer; a client whose
//! buffer is full is evicted, so the actor never waits on a slow socket.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ErrorCode;
use crate::model::VirtualMachine;
use crate::pool::HostState;
use crate::telemetry::{HostStats, VmStats};

const COMMAND_CAPACITY: usize = 1024;

/// A telemetry topic: `host:<id>` or `vm:<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subject {
    Host(String),
    Vm(String),
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Host(id) => write!(f, "host:{}", id),
            Subject::Vm(uuid) => write!(f, "vm:{}", uuid),
        }
    }
}

impl FromStr for Subject {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid subject '{}'", s))?;
        let id = id.trim();
        if id.is_empty() {
            return Err(format!("invalid subject '{}'", s));
        }
        match kind {
            "host" => Ok(Subject::Host(id.to_string())),
            "vm" => Ok(Subject::Vm(id.to_string())),
            _ => Err(format!("unknown subject kind '{}'", kind)),
        }
    }
}

impl Serialize for Subject {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Subject {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Server to client frame: `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    VmsChanged {
        host_id: String,
        vm: Option<VirtualMachine>,
    },
    VmStats(VmStats),
    HostStats(HostStats),
    HostChanged {
        host_id: String,
        state: Option<HostState>,
        error: Option<String>,
        removed: bool,
    },
    DiscoveryChanged {
        host_id: String,
    },
    Error {
        subject: Option<Subject>,
        code: ErrorCode,
        message: String,
    },
}

/// Client to server frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { subject: Subject },
    Unsubscribe { subject: Subject },
    HostSubscribe { host_id: String },
    HostUnsubscribe { host_id: String },
}

/// Told when a subject gains its first subscriber and loses its last one.
/// Called from the hub's loop, so implementations must not block.
pub trait SubjectListener: Send + Sync {
    fn subscribed(&self, subject: &Subject);
    fn last_unsubscribed(&self, subject: &Subject);
}

pub type ClientId = u64;

enum HubCommand {
    Register {
        client: ClientId,
        tx: mpsc::Sender<ServerMessage>,
    },
    Unregister {
        client: ClientId,
    },
    Subscribe {
        client: ClientId,
        subject: Subject,
    },
    Unsubscribe {
        client: ClientId,
        subject: Subject,
    },
    Publish {
        subject: Subject,
        message: ServerMessage,
    },
    Broadcast {
        message: ServerMessage,
    },
    Send {
        client: ClientId,
        message: ServerMessage,
    },
    Subscribers {
        subject: Subject,
        reply: oneshot::Sender<usize>,
    },
}

/// Cheap, cloneable front door to the hub actor.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    next_id: Arc<AtomicU64>,
    client_buffer: usize,
}

impl HubHandle {
    /// Register a client; returns its id and the receiving end of its buffer.
    pub async fn register(&self) -> (ClientId, mpsc::Receiver<ServerMessage>) {
        let client = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(self.client_buffer);
        self.command(HubCommand::Register { client, tx }).await;
        (client, rx)
    }

    pub async fn unregister(&self, client: ClientId) {
        self.command(HubCommand::Unregister { client }).await;
    }

    pub async fn subscribe(&self, client: ClientId, subject: Subject) {
        self.command(HubCommand::Subscribe { client, subject }).await;
    }

    pub async fn unsubscribe(&self, client: ClientId, subject: Subject) {
        self.command(HubCommand::Unsubscribe { client, subject })
            .await;
    }

    /// Deliver to every subscriber of `subject`.
    pub async fn publish(&self, subject: Subject, message: ServerMessage) {
        self.command(HubCommand::Publish { subject, message }).await;
    }

    /// Deliver to every connected client.
    pub async fn broadcast(&self, message: ServerMessage) {
        self.command(HubCommand::Broadcast { message }).await;
    }

    pub async fn send_to(&self, client: ClientId, message: ServerMessage) {
        self.command(HubCommand::Send { client, message }).await;
    }

    /// Current subscriber count of a subject.
    pub async fn subscribers(&self, subject: Subject) -> usize {
        let (reply, rx) = oneshot::channel();
        self.command(HubCommand::Subscribers { subject, reply })
            .await;
        rx.await.unwrap_or(0)
    }

    async fn command(&self, cmd: HubCommand) {
        if self.tx.send(cmd).await.is_err() {
            debug!("hub stopped, command dropped");
        }
    }
}

struct Client {
    tx: mpsc::Sender<ServerMessage>,
    subjects: HashSet<Subject>,
}

/// The actor. Build with [`Hub::new`], then drive with [`Hub::run`].
pub struct Hub {
    rx: mpsc::Receiver<HubCommand>,
    clients: HashMap<ClientId, Client>,
    subjects: HashMap<Subject, HashSet<ClientId>>,
}

impl Hub {
    pub fn new(client_buffer: usize) -> (HubHandle, Hub) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = HubHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(0)),
            client_buffer: client_buffer.max(1),
        };
        let hub = Hub {
            rx,
            clients: HashMap::new(),
            subjects: HashMap::new(),
        };
        (handle, hub)
    }

    pub async fn run(mut self, listener: Arc<dyn SubjectListener>, token: CancellationToken) {
        info!("message hub started");
        loop {
            let cmd = tokio::select! {
                _ = token.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            self.handle(cmd, listener.as_ref());
        }

        let subjects: Vec<_> = self.subjects.drain().map(|(s, _)| s).collect();
        for subject in subjects {
            listener.last_unsubscribed(&subject);
        }
        self.clients.clear();
        info!("message hub stopped");
    }

    fn handle(&mut self, cmd: HubCommand, listener: &dyn SubjectListener) {
        match cmd {
            HubCommand::Register { client, tx } => {
                debug!(client, "client registered");
                self.clients.insert(
                    client,
                    Client {
                        tx,
                        subjects: HashSet::new(),
                    },
                );
            }
            HubCommand::Unregister { client } => self.remove_client(client, listener),
            HubCommand::Subscribe { client, subject } => {
                let Some(entry) = self.clients.get_mut(&client) else {
                    return;
                };
                if !entry.subjects.insert(subject.clone()) {
                    return;
                }
                let subscribers = self.subjects.entry(subject.clone()).or_default();
                subscribers.insert(client);
                debug!(client, subject = %subject, "subscribed");
                if subscribers.len() == 1 {
                    listener.subscribed(&subject);
                }
            }
            HubCommand::Unsubscribe { client, subject } => {
                if let Some(entry) = self.clients.get_mut(&client)
                    && entry.subjects.remove(&subject)
                {
                    debug!(client, subject = %subject, "unsubscribed");
                    self.drop_subscription(client, &subject, listener);
                }
            }
            HubCommand::Publish { subject, message } => {
                let targets: Vec<ClientId> = match self.subjects.get(&subject) {
                    Some(set) => set.iter().copied().collect(),
                    None => return,
                };
                self.deliver(targets, &message, listener);
            }
            HubCommand::Broadcast { message } => {
                let targets: Vec<ClientId> = self.clients.keys().copied().collect();
                self.deliver(targets, &message, listener);
            }
            HubCommand::Send { client, message } => {
                self.deliver(vec![client], &message, listener);
            }
            HubCommand::Subscribers { subject, reply } => {
                let _ = reply.send(self.subjects.get(&subject).map_or(0, HashSet::len));
            }
        }
    }

    fn deliver(
        &mut self,
        targets: Vec<ClientId>,
        message: &ServerMessage,
        listener: &dyn SubjectListener,
    ) {
        let mut evicted = Vec::new();
        for client in targets {
            let Some(entry) = self.clients.get(&client) else {
                continue;
            };
            match entry.tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client, "client buffer full, evicting");
                    evicted.push(client);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => evicted.push(client),
            }
        }
        for client in evicted {
            self.remove_client(client, listener);
        }
    }

    fn remove_client(&mut self, client: ClientId, listener: &dyn SubjectListener) {
        let Some(entry) = self.clients.remove(&client) else {
            return;
        };
        for subject in entry.subjects {
            self.drop_subscription(client, &subject, listener);
        }
        debug!(client, "client removed");
    }

    fn drop_subscription(
        &mut self,
        client: ClientId,
        subject: &Subject,
        listener: &dyn SubjectListener,
    ) {
        let Some(set) = self.subjects.get_mut(subject) else {
            return;
        };
        set.remove(&client);
        if set.is_empty() {
            self.subjects.remove(subject);
            listener.last_unsubscribed(subject);
        }
    }
}
