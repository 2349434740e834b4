//! Client handle and the command-sending seam used by every primitive

use crate::config::{parse_host, ClientConfig};
use crate::connection::{Connection, ConnectionContext, ConnectionSettings};
use crate::database::Database;
use crate::error::{ClientError, Result};
use crate::replset::ReplicaSet;
use crate::scheduler::{Callback, Scheduler};
use async_trait::async_trait;
use latchkey_protocol::{CommandResult, IdGenerator, Ident, RequestCommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Anything that can carry a command to a lock server.
///
/// [`Client`] is the production implementation; primitives only see this
/// trait through their [`Database`].
#[async_trait]
pub trait CommandSender: Send + Sync {
    /// Sends and waits for the result.
    async fn send_command(&self, command: RequestCommand) -> Result<CommandResult>;

    /// Sends without waiting; `callback` runs exactly once off the I/O path.
    fn send_command_with_callback(&self, command: RequestCommand, callback: Callback);
}

enum Transport {
    Single(Connection),
    Replset(ReplicaSet),
}

struct ClientInner {
    transport: Transport,
    ids: Arc<IdGenerator>,
    scheduler: Arc<Scheduler>,
    client_id: Ident,
    config: ClientConfig,
}

/// Handle to a lock server or replica set. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connects according to `config`.
    ///
    /// One host connects before returning and reports failures directly.
    /// Several hosts form a replica set that connects in the background.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        Self::open(config, false).await
    }

    /// Connects to a single server at `host[:port]`.
    pub async fn connect_single(host: impl Into<String>) -> Result<Self> {
        Self::open(ClientConfig::single(host), false).await
    }

    /// Starts a replica set over `hosts`, even if there is only one.
    pub async fn connect_replset<I, S>(hosts: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::open(ClientConfig::replset(hosts), true).await
    }

    /// Like [`connect`](Self::connect), always routing through a replica set.
    pub async fn connect_replset_with(config: ClientConfig) -> Result<Self> {
        Self::open(config, true).await
    }

    async fn open(config: ClientConfig, replset: bool) -> Result<Self> {
        config.validate()?;

        let ids = Arc::new(IdGenerator::new());
        let client_id = ids.next_id();
        let scheduler = Scheduler::start(config.callback_workers);
        let context = ConnectionContext {
            client_id,
            ids: ids.clone(),
            scheduler: scheduler.clone(),
            settings: ConnectionSettings::from(&config),
        };

        let transport = if config.hosts.len() == 1 && !replset {
            let address = parse_host(&config.hosts[0]).ok_or_else(|| {
                ClientError::Config(format!("malformed host {:?}", config.hosts[0]))
            })?;
            debug!(%address, %client_id, "connecting to lock server");
            Transport::Single(Connection::connect(0, address, context, None).await?)
        } else {
            debug!(hosts = config.hosts.len(), %client_id, "starting replica set");
            Transport::Replset(ReplicaSet::new(&config.hosts, context)?)
        };

        Ok(Self {
            inner: Arc::new(ClientInner {
                transport,
                ids,
                scheduler,
                client_id,
                config,
            }),
        })
    }

    /// Identity presented in every session handshake.
    pub fn client_id(&self) -> Ident {
        self.inner.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn ids(&self) -> &Arc<IdGenerator> {
        &self.inner.ids
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.inner.scheduler
    }

    /// The replica set, when this client routes over several hosts.
    pub fn replset(&self) -> Option<&ReplicaSet> {
        match &self.inner.transport {
            Transport::Replset(replset) => Some(replset),
            Transport::Single(_) => None,
        }
    }

    /// The connection commands currently go to.
    pub fn connection(&self) -> Option<&Connection> {
        match &self.inner.transport {
            Transport::Single(connection) => Some(connection),
            Transport::Replset(replset) => replset.primary(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some_and(Connection::is_live)
    }

    /// Waits until some connection is live.
    pub async fn wait_for_live(&self, timeout: Duration) -> Result<()> {
        match &self.inner.transport {
            Transport::Replset(replset) => replset.wait_for_live(timeout).await,
            Transport::Single(connection) => connection.wait_for_live(timeout).await,
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.connection().ok_or(ClientError::Unconnected)?.ping().await
    }

    /// Handle for database `db_id`.
    pub fn database(&self, db_id: u8) -> Database {
        Database::new(
            db_id,
            Arc::new(self.clone()),
            self.inner.ids.clone(),
            self.inner.config.default_timeout,
            self.inner.config.default_expire,
        )
    }

    /// Handle for the configured database.
    pub fn default_database(&self) -> Database {
        self.database(self.inner.config.database)
    }

    /// Closes every connection and stops the timeout wheel.
    pub fn close(&self) {
        match &self.inner.transport {
            Transport::Single(connection) => connection.close(),
            Transport::Replset(replset) => replset.close(),
        }
        self.inner.scheduler.shutdown();
    }
}

#[async_trait]
impl CommandSender for Client {
    async fn send_command(&self, command: RequestCommand) -> Result<CommandResult> {
        match &self.inner.transport {
            Transport::Single(connection) => connection.send(command).await,
            Transport::Replset(replset) => replset.send(command).await,
        }
    }

    fn send_command_with_callback(&self, command: RequestCommand, callback: Callback) {
        match &self.inner.transport {
            Transport::Single(connection) => connection.send_with_callback(command, callback),
            Transport::Replset(replset) => replset.send_with_callback(command, callback),
        }
    }
}
