//! Process-wide server context
//!
//! [`ServerState`] owns every client [`Connection`], the capability [`Registry`] and the
//! [`ExportRegistry`]. It is constructed once at startup and is the sole mutator of core state:
//! every operation of the [`shm`](crate::shm), [`compositor`](crate::compositor) and
//! [`shell`](crate::shell) modules is a method on it, taking connection-scoped handles.
//!
//! ```
//! use tessera::server::{ServerConfig, ServerState};
//!
//! let mut server = ServerState::new(ServerConfig::default());
//! let client = server.connect();
//! let compositor = server.bind(client, "wl_compositor", 6).unwrap();
//! let surface = server.create_surface(client, 6).unwrap();
//! server.commit(surface).unwrap();
//! # let _ = compositor;
//! server.disconnect(client);
//! ```

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::{
    export::ExportRegistry,
    shm::{bytes_per_pixel, Fourcc},
    utils::{DeadResource, Size},
};

mod connection;
mod events;
pub mod registry;

pub use self::connection::{
    BufferId, CallbackId, Connection, ConnectionId, InstanceId, PoolId, SurfaceId, ToplevelId,
    WindowSurfaceId,
};
pub use self::events::Event;
pub use self::registry::{Capability, CapabilityKind, Instance, Registry, RegistryError};

/// Configuration of the server core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Pixel formats supported in addition to `Argb8888` and `Xrgb8888`
    pub shm_formats: Vec<Fourcc>,
    /// Size suggested in the initial configure of every toplevel
    pub default_window_size: Size,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            shm_formats: Vec::new(),
            default_window_size: Size { w: 800, h: 600 },
        }
    }
}

/// The server context
#[derive(Debug)]
pub struct ServerState {
    pub(crate) config: ServerConfig,
    pub(crate) registry: Registry,
    pub(crate) shm_formats: Vec<Fourcc>,
    pub(crate) connections: IndexMap<ConnectionId, Connection>,
    next_connection: u32,
    pub(crate) export: ExportRegistry,
}

impl ServerState {
    /// Create the server context
    ///
    /// Extra formats whose pixel size is unknown are dropped, stride validation could not be
    /// carried out for them.
    pub fn new(config: ServerConfig) -> ServerState {
        let mut shm_formats = vec![Fourcc::Argb8888, Fourcc::Xrgb8888];
        for format in &config.shm_formats {
            if shm_formats.contains(format) {
                continue;
            }
            if bytes_per_pixel(*format).is_none() {
                warn!(?format, "Ignoring shm format of unknown pixel size");
                continue;
            }
            shm_formats.push(*format);
        }
        info!(formats = ?shm_formats, "Server state initialized");

        ServerState {
            config,
            registry: Registry::new(),
            shm_formats,
            connections: IndexMap::new(),
            next_connection: 0,
            export: ExportRegistry::new(),
        }
    }

    /// The configuration this server was created with
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The capability registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Pixel formats accepted for shared-memory buffers
    pub fn shm_formats(&self) -> &[Fourcc] {
        &self.shm_formats
    }

    /// The export registry, for collaborators to subscribe to committed buffers
    pub fn export(&self) -> &ExportRegistry {
        &self.export
    }

    /// Mutable access to the export registry
    pub fn export_mut(&mut self) -> &mut ExportRegistry {
        &mut self.export
    }

    /// Accept a new client connection
    pub fn connect(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_connection);
        self.next_connection = self.next_connection.wrapping_add(1);
        self.connections.insert(id, Connection::new(id));
        debug!(connection = %id, "Client connected");
        id
    }

    /// Tear down a connection and everything it owns
    ///
    /// Surfaces go first, then pools along with their buffers. Uncommitted state and queued
    /// events are discarded.
    pub fn disconnect(&mut self, id: ConnectionId) {
        let Some(mut connection) = self.connections.shift_remove(&id) else {
            return;
        };

        for (surface, _) in connection.surfaces.drain(..) {
            self.export.forget_surface(surface);
        }
        connection.toplevels.clear();
        connection.window_surfaces.clear();
        connection.buffers.clear();
        // dropping a pool unmaps its memory and closes the fd
        connection.pools.clear();

        debug!(connection = %id, dropped_events = connection.events.len(), "Client disconnected");
    }

    /// Whether this connection is still live
    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Access a live connection
    pub fn connection(&self, id: ConnectionId) -> Result<&Connection, DeadResource> {
        self.connections.get(&id).ok_or(DeadResource)
    }

    /// Mutably access a live connection
    pub fn connection_mut(&mut self, id: ConnectionId) -> Result<&mut Connection, DeadResource> {
        self.connections.get_mut(&id).ok_or(DeadResource)
    }

    /// Ids of all live connections
    pub fn connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.connections.keys().copied()
    }

    /// Remove and return the events queued for a connection
    pub fn take_events(&mut self, id: ConnectionId) -> Vec<Event> {
        self.connections
            .get_mut(&id)
            .map(|conn| conn.events.drain(..).collect())
            .unwrap_or_default()
    }

    /// Remove and return the events queued for all connections
    pub fn drain_events(&mut self) -> Vec<(ConnectionId, Event)> {
        let mut events = Vec::new();
        for (id, conn) in self.connections.iter_mut() {
            events.extend(conn.events.drain(..).map(|event| (*id, event)));
        }
        events
    }

    pub(crate) fn push_event(&mut self, id: ConnectionId, event: Event) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.events.push_back(event);
        }
    }
}
