//! Replica-set routing over several connections

use crate::config::parse_host;
use crate::connection::{Connection, ConnectionContext, LivenessListener};
use crate::error::{ClientError, Result};
use crate::scheduler::{Callback, Scheduler};
use latchkey_protocol::{CommandResult, RequestCommand};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LiveEntry {
    index: usize,
    init_type: u8,
}

/// Indices of handshaken connections, kept in configured order.
#[derive(Default)]
struct LiveSet {
    entries: Mutex<Vec<LiveEntry>>,
    changed: Notify,
}

impl LiveSet {
    fn first(&self) -> Option<usize> {
        self.entries.lock().first().map(|entry| entry.index)
    }
}

impl LivenessListener for LiveSet {
    fn on_live(&self, index: usize, init_type: u8) {
        {
            let mut entries = self.entries.lock();
            entries.retain(|entry| entry.index != index);
            let at = entries.partition_point(|entry| entry.index < index);
            entries.insert(at, LiveEntry { index, init_type });
        }
        info!(index, init_type, "replica joined live set");
        self.changed.notify_waiters();
    }

    fn on_closed(&self, index: usize) {
        self.entries.lock().retain(|entry| entry.index != index);
        info!(index, "replica left live set");
        self.changed.notify_waiters();
    }
}

/// Routes every command to the first live replica.
pub struct ReplicaSet {
    connections: Vec<Connection>,
    live: Arc<LiveSet>,
    scheduler: Arc<Scheduler>,
}

impl ReplicaSet {
    /// Starts one background connection per well-formed host entry.
    pub(crate) fn new(hosts: &[String], context: ConnectionContext) -> Result<Self> {
        let live = Arc::new(LiveSet::default());
        let weak_live: Weak<LiveSet> = Arc::downgrade(&live);
        let listener: Weak<dyn LivenessListener> = weak_live;
        let scheduler = context.scheduler.clone();

        let mut connections = Vec::with_capacity(hosts.len());
        for host in hosts {
            let Some(address) = parse_host(host) else {
                warn!("skipping malformed replica host {:?}", host);
                continue;
            };
            connections.push(Connection::spawn(
                connections.len(),
                address,
                context.clone(),
                Some(listener.clone()),
            ));
        }

        if connections.is_empty() {
            return Err(ClientError::Config(
                "replica set has no valid hosts".to_string(),
            ));
        }
        Ok(Self {
            connections,
            live,
            scheduler,
        })
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn live_count(&self) -> usize {
        self.live.entries.lock().len()
    }

    /// Init types of the live replicas, by configured position.
    pub fn live_init_types(&self) -> Vec<(usize, u8)> {
        self.live
            .entries
            .lock()
            .iter()
            .map(|entry| (entry.index, entry.init_type))
            .collect()
    }

    /// The connection commands are routed to right now.
    pub fn primary(&self) -> Option<&Connection> {
        self.live.first().and_then(|index| self.connections.get(index))
    }

    /// Waits until at least one replica is live.
    pub async fn wait_for_live(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, async {
            loop {
                let changed = self.live.changed.notified();
                if self.primary().is_some() {
                    return;
                }
                changed.await;
            }
        })
        .await
        .map_err(|_| ClientError::Unconnected)
    }

    pub async fn send(&self, command: RequestCommand) -> Result<CommandResult> {
        self.primary()
            .ok_or(ClientError::Unconnected)?
            .send(command)
            .await
    }

    pub fn send_with_callback(&self, command: RequestCommand, callback: Callback) {
        match self.primary() {
            Some(connection) => connection.send_with_callback(command, callback),
            None => self.scheduler.dispatch(callback, Err(ClientError::Unconnected)),
        }
    }

    pub fn close(&self) {
        for connection in &self.connections {
            connection.close();
        }
    }
}
