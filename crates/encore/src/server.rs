//! `EncoreServer` builder and server loop.
//!
//! Ties the layers together: transport → protocol → registry/coordinator,
//! plus the task that feeds engine acknowledgements to the coordinator.

use std::sync::Arc;
use std::time::Duration;

use encore_channel::{Channel, InMemoryChannel, LocalConnections, RedisChannel};
use encore_engine::{
    AckReceiver, AckSender, EngineGateway, Geocoder, GoogleGeocoder, HttpEngineGateway,
    InMemoryEngine, StaticGeocoder, ack_channel,
};
use encore_protocol::{Codec, JsonCodec};
use encore_room::{
    Collaborators, Coordinator, CoordinatorConfig, InMemoryUserLock, RedisUserLock, Registry,
    UserLock,
};
use encore_store::{InMemoryStore, PgStore, Store};
use encore_transport::{Transport, WebSocketTransport};
use secrecy::{ExposeSecret, SecretString};

use crate::auth::Authenticator;
use crate::config::EncoreConfig;
use crate::handler::handle_connection;
use crate::EncoreError;

/// The current protocol version. Clients must send this in their
/// handshake or be rejected.
pub const PROTOCOL_VERSION: u32 = 1;

/// Per-connection time limits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timeouts {
    pub(crate) handshake: Duration,
    pub(crate) idle: Duration,
}

/// Shared server state passed to each connection handler task.
pub(crate) struct ServerState<A: Authenticator, C: Codec> {
    pub(crate) registry: Registry,
    pub(crate) coordinator: Arc<Coordinator>,
    pub(crate) local: LocalConnections,
    pub(crate) auth: A,
    pub(crate) codec: C,
    pub(crate) timeouts: Timeouts,
}

/// Builder for configuring and starting an Encore server.
///
/// Every collaborator defaults to its in-process implementation, so
/// `ServerBuilder::new().build(auth)` gives a self-contained server.
///
/// ```rust,ignore
/// let server = ServerBuilder::new()
///     .bind("0.0.0.0:8080")
///     .build(my_auth)
///     .await?;
/// server.run().await
/// ```
pub struct ServerBuilder {
    bind_addr: String,
    timeouts: Timeouts,
    coordinator_config: CoordinatorConfig,
    local: LocalConnections,
    acks: (AckSender, AckReceiver),
    store: Arc<dyn Store>,
    channel: Option<Arc<dyn Channel>>,
    engine: Option<Arc<dyn EngineGateway>>,
    geocoder: Arc<dyn Geocoder>,
    locks: Arc<dyn UserLock>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            timeouts: Timeouts {
                handshake: Duration::from_secs(5),
                idle: Duration::from_secs(30),
            },
            coordinator_config: CoordinatorConfig::default(),
            local: LocalConnections::new(),
            acks: ack_channel(),
            store: Arc::new(InMemoryStore::new()),
            channel: None,
            engine: None,
            geocoder: Arc::new(StaticGeocoder::new()),
            locks: Arc::new(InMemoryUserLock::new()),
        }
    }

    /// Wires every backend named in `config`; absent URLs keep the
    /// in-process defaults.
    pub async fn from_config(config: &EncoreConfig) -> Result<Self, EncoreError> {
        let mut builder = Self::new()
            .bind(&config.server.bind_addr)
            .handshake_timeout(config.server.handshake_timeout())
            .idle_timeout(config.server.idle_timeout())
            .coordinator_config(config.rooms.coordinator_config());

        if let Some(url) = &config.database.url {
            let store = PgStore::connect(url, config.database.max_connections).await?;
            store.migrate().await?;
            builder = builder.store(Arc::new(store));
        } else {
            tracing::warn!("no database configured, state will not survive a restart");
        }

        if let Some(url) = &config.redis.url {
            let channel = RedisChannel::connect(url, builder.local_connections()).await?;
            channel.spawn_listener();
            let locks = RedisUserLock::connect(url, config.redis.lock_ttl()).await?;
            builder = builder.channel(Arc::new(channel)).locks(Arc::new(locks));
        }

        if let Some(url) = &config.engine.base_url {
            let engine =
                HttpEngineGateway::new(url.clone(), config.engine.timeout(), builder.ack_sender())?;
            builder = builder.engine(Arc::new(engine));
        } else {
            tracing::warn!("no workflow engine configured, using the in-process engine");
        }

        if let Some(key) = &config.geocoder.api_key {
            let geocoder = GoogleGeocoder::new(
                config.geocoder.base_url.clone(),
                SecretString::new(key.expose_secret().clone()),
                config.geocoder.timeout(),
            )?;
            builder = builder.geocoder(Arc::new(geocoder));
        }

        Ok(builder)
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.handshake = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.idle = timeout;
        self
    }

    pub fn coordinator_config(mut self, config: CoordinatorConfig) -> Self {
        self.coordinator_config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    /// Uses `channel` for presence. It must deliver through
    /// [`local_connections`](Self::local_connections).
    pub fn channel(mut self, channel: Arc<dyn Channel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Uses `engine`. It must push acknowledgements to
    /// [`ack_sender`](Self::ack_sender).
    pub fn engine(mut self, engine: Arc<dyn EngineGateway>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = geocoder;
        self
    }

    pub fn locks(mut self, locks: Arc<dyn UserLock>) -> Self {
        self.locks = locks;
        self
    }

    /// The sockets this process owns. Channels deliver into it.
    pub fn local_connections(&self) -> LocalConnections {
        self.local.clone()
    }

    /// Where engine gateways push acknowledgements.
    pub fn ack_sender(&self) -> AckSender {
        self.acks.0.clone()
    }

    /// The store the server will use.
    pub fn store_handle(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    /// Binds the listener and assembles the server.
    pub async fn build<A: Authenticator>(
        self,
        auth: A,
    ) -> Result<EncoreServer<A, JsonCodec>, EncoreError> {
        let transport = WebSocketTransport::bind(&self.bind_addr).await?;
        let (ack_tx, acks) = self.acks;

        let channel = self
            .channel
            .unwrap_or_else(|| Arc::new(InMemoryChannel::new(self.local.clone())));
        let engine = self
            .engine
            .unwrap_or_else(|| Arc::new(InMemoryEngine::new(ack_tx)));

        let coordinator = Arc::new(Coordinator::new(
            Collaborators {
                store: self.store,
                channel,
                engine,
                geocoder: self.geocoder,
                locks: self.locks,
            },
            self.coordinator_config,
        ));

        let state = Arc::new(ServerState {
            registry: Registry::new(Arc::clone(&coordinator)),
            coordinator,
            local: self.local,
            auth,
            codec: JsonCodec,
            timeouts: self.timeouts,
        });

        Ok(EncoreServer {
            transport,
            state,
            acks,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running Encore server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct EncoreServer<A: Authenticator, C: Codec> {
    transport: WebSocketTransport,
    state: Arc<ServerState<A, C>>,
    acks: AckReceiver,
}

impl<A, C> EncoreServer<A, C>
where
    A: Authenticator,
    C: Codec,
{
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// Runs the accept loop until the process is terminated.
    ///
    /// Each accepted connection gets its own handler task. Engine
    /// acknowledgements are applied in arrival order by a dedicated task.
    pub async fn run(self) -> Result<(), EncoreError> {
        let Self {
            mut transport,
            state,
            acks,
        } = self;
        tracing::info!("Encore server running");

        tokio::spawn(pump_acks(Arc::clone(&state.coordinator), acks));

        loop {
            match transport.accept().await {
                Ok(conn) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, state).await {
                            tracing::debug!(error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }
}

/// Applies engine acknowledgements one at a time.
async fn pump_acks(coordinator: Arc<Coordinator>, mut acks: AckReceiver) {
    while let Some(ack) = acks.recv().await {
        tracing::debug!(?ack, "engine acknowledgement");
        if let Err(e) = coordinator.handle_engine_ack(ack).await {
            tracing::warn!(error = %e, "failed to apply engine acknowledgement");
        }
    }
    tracing::debug!("engine acknowledgement stream closed");
}
