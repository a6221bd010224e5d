//! Wayland protocol frontend
//!
//! This module plugs the core state into [`wayland_server`]: it advertises the registry
//! capabilities as globals, translates requests of real clients into calls on
//! [`ServerState`](crate::server::ServerState) and delivers the queued [`Event`]s back as
//! protocol events.
//!
//! Your compositor state type owns a [`FrontendState`] and implements [`ServerHandler`] to give
//! access to it. The [`delegate_frontend!`](crate::delegate_frontend) macro then forwards every
//! interface handled here to it:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tessera::delegate_frontend;
//! use tessera::server::{ServerConfig, ServerState};
//! use tessera::wayland::{FrontendState, ServerHandler};
//!
//! struct State {
//!     frontend: FrontendState,
//! }
//!
//! impl ServerHandler for State {
//!     fn frontend_state(&mut self) -> &mut FrontendState {
//!         &mut self.frontend
//!     }
//! }
//! delegate_frontend!(State);
//!
//! let display = tessera::reexports::wayland_server::Display::<State>::new().unwrap();
//! let server = ServerState::new(ServerConfig::default());
//! let mut state = State {
//!     frontend: FrontendState::new::<State>(&display.handle(), server),
//! };
//!
//! // every client must be inserted with the data provided by the frontend
//! # let stream: std::os::unix::net::UnixStream = unimplemented!();
//! let client_data = state.frontend.new_client();
//! display.handle().insert_client(stream, Arc::new(client_data)).unwrap();
//! ```
//!
//! Clients inserted with other client data are refused service.
//!
//! After each dispatch of the display, call [`FrontendState::reap_disconnected`] to release
//! the resources of clients that went away.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tracing::{debug, trace};
use wayland_protocols::xdg::shell::server::{
    xdg_surface::XdgSurface, xdg_toplevel::XdgToplevel, xdg_wm_base::XdgWmBase,
};
use wayland_server::{
    backend::{ClientData, ClientId, DisconnectReason, GlobalId, ObjectId},
    protocol::{
        wl_buffer::WlBuffer,
        wl_callback::WlCallback,
        wl_compositor::WlCompositor,
        wl_shm::{self, WlShm},
    },
    Client, DisplayHandle, GlobalDispatch, Resource,
};

use crate::server::{
    BufferId, CallbackId, CapabilityKind, ConnectionId, Event, InstanceId, PoolId, ServerState, SurfaceId,
    ToplevelId,
};

mod compositor;
mod shm;
pub mod socket;
mod xdg;

pub use self::compositor::SurfaceUserData;
pub use self::shm::{BufferUserData, PoolUserData};
pub use self::xdg::XdgSurfaceUserData;

/// Hooks of the compositor state into the frontend
pub trait ServerHandler: 'static {
    /// [`FrontendState`] getter
    fn frontend_state(&mut self) -> &mut FrontendState;

    /// A surface has been committed
    fn commit(&mut self, surface: SurfaceId) {
        let _ = surface;
    }

    /// A client created a new toplevel, its initial configure is already on its way
    fn new_toplevel(&mut self, toplevel: ToplevelId) {
        let _ = toplevel;
    }
}

/// Per-client data, tying a wayland client to its core connection
#[derive(Debug)]
pub struct ClientState {
    connection: ConnectionId,
    disconnected: Arc<Mutex<Vec<ConnectionId>>>,
}

impl ClientState {
    /// Core connection of this client
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }
}

impl ClientData for ClientState {
    fn initialized(&self, client_id: ClientId) {
        debug!(?client_id, connection = %self.connection, "Client initialized");
    }

    fn disconnected(&self, client_id: ClientId, reason: DisconnectReason) {
        debug!(?client_id, connection = %self.connection, ?reason, "Client disconnected");
        self.disconnected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.connection);
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolRefs {
    resource_alive: bool,
    buffers: usize,
}

/// State of the protocol frontend
#[derive(Debug)]
pub struct FrontendState {
    server: ServerState,
    disconnected: Arc<Mutex<Vec<ConnectionId>>>,
    globals: Vec<GlobalId>,
    instances: HashMap<ObjectId, InstanceId>,
    shm_instances: HashMap<InstanceId, WlShm>,
    pools: HashMap<PoolId, PoolRefs>,
    buffers: HashMap<BufferId, WlBuffer>,
    callbacks: HashMap<CallbackId, WlCallback>,
    toplevels: HashMap<ToplevelId, (XdgToplevel, XdgSurface)>,
}

impl FrontendState {
    /// Take over a core state and create one global per registry capability
    pub fn new<D>(display: &DisplayHandle, server: ServerState) -> FrontendState
    where
        D: GlobalDispatch<WlCompositor, ()>
            + GlobalDispatch<WlShm, ()>
            + GlobalDispatch<XdgWmBase, ()>
            + ServerHandler,
    {
        let globals = server
            .registry()
            .capabilities()
            .iter()
            .map(|capability| {
                debug!(name = capability.name, version = capability.version, "Creating global");
                match capability.kind {
                    CapabilityKind::Compositor => display.create_global::<D, WlCompositor, _>(
                        capability.version.min(WlCompositor::interface().version),
                        (),
                    ),
                    CapabilityKind::Shm => display
                        .create_global::<D, WlShm, _>(capability.version.min(WlShm::interface().version), ()),
                    CapabilityKind::WindowShell => display.create_global::<D, XdgWmBase, _>(
                        capability.version.min(XdgWmBase::interface().version),
                        (),
                    ),
                }
            })
            .collect();

        FrontendState {
            server,
            disconnected: Arc::new(Mutex::new(Vec::new())),
            globals,
            instances: HashMap::new(),
            shm_instances: HashMap::new(),
            pools: HashMap::new(),
            buffers: HashMap::new(),
            callbacks: HashMap::new(),
            toplevels: HashMap::new(),
        }
    }

    /// The core state
    pub fn server(&self) -> &ServerState {
        &self.server
    }

    /// Mutable access to the core state
    ///
    /// Events queued through it are delivered on the next [`FrontendState::flush_events`].
    pub fn server_mut(&mut self) -> &mut ServerState {
        &mut self.server
    }

    /// Ids of the globals advertised by the frontend
    pub fn globals(&self) -> &[GlobalId] {
        &self.globals
    }

    /// Open a core connection for a new client, returning the data to insert it with
    pub fn new_client(&mut self) -> ClientState {
        ClientState {
            connection: self.server.connect(),
            disconnected: self.disconnected.clone(),
        }
    }

    /// Release the core state of every client that disconnected since the last call
    pub fn reap_disconnected(&mut self) {
        let gone = std::mem::take(&mut *self.disconnected.lock().unwrap_or_else(PoisonError::into_inner));
        if gone.is_empty() {
            return;
        }
        for connection in &gone {
            self.server.disconnect(*connection);
        }
        self.instances.retain(|_, instance| !gone.contains(&instance.connection()));
        self.shm_instances
            .retain(|instance, _| !gone.contains(&instance.connection()));
        self.pools.retain(|pool, _| !gone.contains(&pool.connection()));
        self.buffers.retain(|buffer, _| !gone.contains(&buffer.connection()));
        self.callbacks
            .retain(|callback, _| !gone.contains(&callback.connection()));
        self.toplevels
            .retain(|toplevel, _| !gone.contains(&toplevel.connection()));
    }

    /// Notify every committed surface that it has been presented, then deliver events
    pub fn present(&mut self, time: u32) {
        self.server.present_all(time);
        self.flush_events();
    }

    /// Deliver all queued core events to their clients
    pub fn flush_events(&mut self) {
        for (connection, event) in self.server.drain_events() {
            trace!(%connection, ?event, "Delivering event");
            match event {
                Event::Format { instance, format } => {
                    let Some(shm) = self.shm_instances.get(&instance) else {
                        continue;
                    };
                    match format_to_wire(format) {
                        Some(wire) => shm.format(wire),
                        None => debug!(?format, "Format has no wire representation"),
                    }
                }
                Event::BufferReleased { buffer } => {
                    if let Some(wl_buffer) = self.buffers.get(&buffer) {
                        wl_buffer.release();
                    }
                }
                Event::Configure {
                    toplevel, size, serial, ..
                } => {
                    if let Some((xdg_toplevel, xdg_surface)) = self.toplevels.get(&toplevel) {
                        xdg_toplevel.configure(size.w, size.h, Vec::new());
                        xdg_surface.configure(serial.into());
                    }
                }
                Event::FrameDone { callback, time } => {
                    if let Some(wl_callback) = self.callbacks.remove(&callback) {
                        wl_callback.done(time);
                    }
                }
                Event::BufferAccessFailed { buffer } => {
                    if let Some(wl_buffer) = self.buffers.get(&buffer) {
                        wl_buffer.post_error(
                            wl_shm::Error::InvalidFd,
                            "Error accessing the buffer contents.",
                        );
                    }
                }
            }
        }
    }

    pub(crate) fn bound(&mut self, object: ObjectId, instance: InstanceId) {
        self.instances.insert(object, instance);
    }

    pub(crate) fn unbound(&mut self, object: &ObjectId) {
        if let Some(instance) = self.instances.remove(object) {
            self.shm_instances.remove(&instance);
            self.server.unbind(instance);
        }
    }
}

/// Core connection of a client, if it was inserted with a [`ClientState`]
pub(crate) fn connection_of(client: &Client) -> Option<ConnectionId> {
    client.get_data::<ClientState>().map(ClientState::connection)
}

pub(crate) fn format_to_wire(format: crate::shm::Fourcc) -> Option<wl_shm::Format> {
    use crate::shm::Fourcc;
    match format {
        Fourcc::Argb8888 => Some(wl_shm::Format::Argb8888),
        Fourcc::Xrgb8888 => Some(wl_shm::Format::Xrgb8888),
        other => wl_shm::Format::try_from(other as u32).ok(),
    }
}

pub(crate) fn format_from_wire(format: wl_shm::Format) -> Option<crate::shm::Fourcc> {
    use crate::shm::Fourcc;
    match format {
        wl_shm::Format::Argb8888 => Some(Fourcc::Argb8888),
        wl_shm::Format::Xrgb8888 => Some(Fourcc::Xrgb8888),
        other => Fourcc::try_from(other as u32).ok(),
    }
}

/// Forward all the interfaces of the frontend to a [`ServerHandler`]
#[macro_export]
macro_rules! delegate_frontend {
    ($(@<$( $lt:tt $( : $clt:tt $(+ $dlt:tt )* )? ),+>)? $ty: ty) => {
        $crate::reexports::wayland_server::delegate_global_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            $crate::reexports::wayland_server::protocol::wl_compositor::WlCompositor: ()
        ] => $crate::wayland::FrontendState);
        $crate::reexports::wayland_server::delegate_global_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            $crate::reexports::wayland_server::protocol::wl_shm::WlShm: ()
        ] => $crate::wayland::FrontendState);
        $crate::reexports::wayland_server::delegate_global_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            $crate::reexports::wayland_protocols::xdg::shell::server::xdg_wm_base::XdgWmBase: ()
        ] => $crate::wayland::FrontendState);

        $crate::reexports::wayland_server::delegate_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            $crate::reexports::wayland_server::protocol::wl_compositor::WlCompositor: ()
        ] => $crate::wayland::FrontendState);
        $crate::reexports::wayland_server::delegate_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            $crate::reexports::wayland_server::protocol::wl_surface::WlSurface: $crate::wayland::SurfaceUserData
        ] => $crate::wayland::FrontendState);
        $crate::reexports::wayland_server::delegate_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            $crate::reexports::wayland_server::protocol::wl_region::WlRegion: ()
        ] => $crate::wayland::FrontendState);
        $crate::reexports::wayland_server::delegate_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            $crate::reexports::wayland_server::protocol::wl_callback::WlCallback: ()
        ] => $crate::wayland::FrontendState);
        $crate::reexports::wayland_server::delegate_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            $crate::reexports::wayland_server::protocol::wl_shm::WlShm: ()
        ] => $crate::wayland::FrontendState);
        $crate::reexports::wayland_server::delegate_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            $crate::reexports::wayland_server::protocol::wl_shm_pool::WlShmPool: $crate::wayland::PoolUserData
        ] => $crate::wayland::FrontendState);
        $crate::reexports::wayland_server::delegate_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            $crate::reexports::wayland_server::protocol::wl_buffer::WlBuffer: $crate::wayland::BufferUserData
        ] => $crate::wayland::FrontendState);
        $crate::reexports::wayland_server::delegate_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            $crate::reexports::wayland_protocols::xdg::shell::server::xdg_wm_base::XdgWmBase: ()
        ] => $crate::wayland::FrontendState);
        $crate::reexports::wayland_server::delegate_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            $crate::reexports::wayland_protocols::xdg::shell::server::xdg_positioner::XdgPositioner: ()
        ] => $crate::wayland::FrontendState);
        $crate::reexports::wayland_server::delegate_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            $crate::reexports::wayland_protocols::xdg::shell::server::xdg_surface::XdgSurface: $crate::wayland::XdgSurfaceUserData
        ] => $crate::wayland::FrontendState);
        $crate::reexports::wayland_server::delegate_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            $crate::reexports::wayland_protocols::xdg::shell::server::xdg_toplevel::XdgToplevel: $crate::server::ToplevelId
        ] => $crate::wayland::FrontendState);
        $crate::reexports::wayland_server::delegate_dispatch!($(@< $( $lt $( : $clt $(+ $dlt )* )? ),+ >)? $ty: [
            $crate::reexports::wayland_protocols::xdg::shell::server::xdg_popup::XdgPopup: ()
        ] => $crate::wayland::FrontendState);
    };
}

#[cfg(test)]
mod tests;
