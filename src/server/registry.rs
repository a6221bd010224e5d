//! Capability registry and per-client binding
//!
//! The registry advertises a fixed set of named, versioned factories. Clients bind them to obtain
//! an instance, the version of which decides which requests and behaviours apply to the objects
//! they create through it.

use tracing::{debug, trace};

use super::{connection::InstanceId, events::Event, ConnectionId, ServerState};
use crate::utils::DeadResource;

/// Highest supported version of the surface factory
pub const COMPOSITOR_VERSION: u32 = 6;
/// Highest supported version of the memory-pool factory
pub const SHM_VERSION: u32 = 1;
/// Highest supported version of the window-shell factory
pub const WINDOW_SHELL_VERSION: u32 = 3;

/// The kind of factory a capability stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    /// Creates surfaces
    Compositor,
    /// Creates shared-memory pools
    Shm,
    /// Assigns the window role to surfaces
    WindowShell,
}

/// A named, versioned factory advertised to every client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    /// Interface name clients bind by
    pub name: &'static str,
    /// Highest version a client may request
    pub version: u32,
    /// Which factory this is
    pub kind: CapabilityKind,
}

/// The set of capabilities advertised by this server
#[derive(Debug, Clone)]
pub struct Registry {
    capabilities: Vec<Capability>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl Registry {
    /// Registry exposing the compositor, shm and window-shell capabilities
    pub fn new() -> Registry {
        Registry {
            capabilities: vec![
                Capability {
                    name: "wl_compositor",
                    version: COMPOSITOR_VERSION,
                    kind: CapabilityKind::Compositor,
                },
                Capability {
                    name: "wl_shm",
                    version: SHM_VERSION,
                    kind: CapabilityKind::Shm,
                },
                Capability {
                    name: "xdg_wm_base",
                    version: WINDOW_SHELL_VERSION,
                    kind: CapabilityKind::WindowShell,
                },
            ],
        }
    }

    /// All advertised capabilities, in advertisement order
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Find a capability by interface name
    pub fn lookup(&self, name: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|cap| cap.name == name)
    }

    /// Find the capability of a given kind
    pub fn by_kind(&self, kind: CapabilityKind) -> Option<&Capability> {
        self.capabilities.iter().find(|cap| cap.kind == kind)
    }
}

/// A capability instance bound by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instance {
    /// The bound capability
    pub kind: CapabilityKind,
    /// The negotiated version
    pub version: u32,
}

/// Errors of the binding process
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No capability with this name is registered
    #[error("unknown capability `{0}`")]
    UnknownCapability(String),
    /// The requested version is not supported
    #[error("`{name}` requested in version {requested}, supported versions are 1 to {max}")]
    VersionError {
        /// Name of the capability
        name: &'static str,
        /// Version asked for
        requested: u32,
        /// Highest supported version
        max: u32,
    },
    /// The connection is gone
    #[error(transparent)]
    Dead(#[from] DeadResource),
}

impl ServerState {
    /// Bind a capability by name for a connection
    ///
    /// Binding the shared-memory capability immediately queues one [`Event::Format`] per
    /// supported pixel format for the new instance.
    pub fn bind(
        &mut self,
        connection: ConnectionId,
        name: &str,
        requested_version: u32,
    ) -> Result<InstanceId, RegistryError> {
        let capability = *self
            .registry
            .lookup(name)
            .ok_or_else(|| RegistryError::UnknownCapability(name.to_owned()))?;

        if requested_version == 0 || requested_version > capability.version {
            return Err(RegistryError::VersionError {
                name: capability.name,
                requested: requested_version,
                max: capability.version,
            });
        }

        let formats = self.shm_formats.clone();
        let conn = self.connection_mut(connection)?;
        let instance = InstanceId::from_parts(connection, conn.next_index());
        conn.instances.insert(
            instance,
            Instance {
                kind: capability.kind,
                version: requested_version,
            },
        );
        debug!(%instance, name = capability.name, version = requested_version, "Capability bound");

        if capability.kind == CapabilityKind::Shm {
            for format in formats {
                trace!(%instance, ?format, "Advertising shm format");
                conn.events.push_back(Event::Format { instance, format });
            }
        }

        Ok(instance)
    }

    /// Drop an instance record, objects created through it stay alive
    pub fn unbind(&mut self, instance: InstanceId) {
        if let Ok(conn) = self.connection_mut(instance.connection) {
            if conn.instances.shift_remove(&instance).is_some() {
                trace!(%instance, "Capability instance destroyed");
            }
        }
    }

    /// Look up a bound instance
    pub fn instance(&self, instance: InstanceId) -> Option<&Instance> {
        self.connection(instance.connection)
            .ok()
            .and_then(|conn| conn.instances.get(&instance))
    }
}
