use std::collections::VecDeque;

use indexmap::IndexMap;

use crate::{
    compositor::Surface,
    shell::{Toplevel, WindowSurface},
    shm::{ShmBuffer, ShmPool},
    utils::ids::connection_handle,
};

use super::{events::Event, registry::Instance};

/// Identifier of a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u32);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection#{}", self.0)
    }
}

connection_handle!(
    /// Handle to a capability instance bound by a client
    InstanceId
);
connection_handle!(
    /// Handle to a shared-memory pool
    PoolId
);
connection_handle!(
    /// Handle to a buffer carved out of a shared-memory pool
    BufferId
);
connection_handle!(
    /// Handle to a surface
    SurfaceId
);
connection_handle!(
    /// Handle to the window-role object of a surface
    WindowSurfaceId
);
connection_handle!(
    /// Handle to the toplevel object of a window surface
    ToplevelId
);
connection_handle!(
    /// Handle to a one-shot frame callback
    CallbackId
);

/// One connected peer and every object it owns
///
/// Objects live in per-kind arenas keyed by their handles. Indices are drawn from a single
/// per-connection counter and never reused.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    pub(crate) instances: IndexMap<InstanceId, Instance>,
    pub(crate) pools: IndexMap<PoolId, ShmPool>,
    pub(crate) buffers: IndexMap<BufferId, ShmBuffer>,
    pub(crate) surfaces: IndexMap<SurfaceId, Surface>,
    pub(crate) window_surfaces: IndexMap<WindowSurfaceId, WindowSurface>,
    pub(crate) toplevels: IndexMap<ToplevelId, Toplevel>,
    pub(crate) events: VecDeque<Event>,
    next_index: u32,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId) -> Connection {
        Connection {
            id,
            instances: IndexMap::new(),
            pools: IndexMap::new(),
            buffers: IndexMap::new(),
            surfaces: IndexMap::new(),
            window_surfaces: IndexMap::new(),
            toplevels: IndexMap::new(),
            events: VecDeque::new(),
            next_index: 0,
        }
    }

    /// Id of this connection
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn next_index(&mut self) -> u32 {
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        index
    }

    /// Live pools of this connection, in creation order
    pub fn pools(&self) -> impl Iterator<Item = PoolId> + '_ {
        self.pools.keys().copied()
    }

    /// Live buffers of this connection, in creation order
    pub fn buffers(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.buffers.keys().copied()
    }

    /// Live surfaces of this connection, in creation order
    pub fn surfaces(&self) -> impl Iterator<Item = SurfaceId> + '_ {
        self.surfaces.keys().copied()
    }

    /// Number of events queued for this connection
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }
}
