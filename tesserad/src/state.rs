use std::time::Instant;

use tessera::{
    delegate_frontend,
    reexports::wayland_server::DisplayHandle,
    server::{SurfaceId, ToplevelId},
    wayland::{FrontendState, ServerHandler},
};
use tracing::{info, trace};

pub struct Tesserad {
    pub start_time: Instant,
    pub display_handle: DisplayHandle,
    pub frontend: FrontendState,
}

impl Tesserad {
    /// Milliseconds since startup, as sent in frame callbacks
    pub fn clock(&self) -> u32 {
        self.start_time.elapsed().as_millis() as u32
    }
}

impl ServerHandler for Tesserad {
    fn frontend_state(&mut self) -> &mut FrontendState {
        &mut self.frontend
    }

    fn commit(&mut self, surface: SurfaceId) {
        trace!(%surface, status = ?self.frontend.server().surface_status(surface), "Surface committed");
    }

    fn new_toplevel(&mut self, toplevel: ToplevelId) {
        info!(%toplevel, "New window");
    }
}

delegate_frontend!(Tesserad);
