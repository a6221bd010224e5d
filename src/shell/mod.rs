//! Window role assignment and the configure handshake
//!
//! A surface becomes a window by obtaining a *window surface* for it, which permanently gives it
//! the [`Window`](RoleKind::Window) role, and then a *toplevel* from the window surface. The
//! toplevel is immediately sent a configure event suggesting a size, along with a serial the
//! client acknowledges once it has applied the configuration.
//!
//! Serials are allocated per window surface and increase monotonically. Acknowledgements are
//! accepted leniently: an out-of-order, repeated or unknown serial is only logged.
//!
//! Both window objects only hold lookup handles: destroying them clears their own record and
//! leaves the surface, and its role, alone.

use tracing::{debug, trace, warn};

use crate::{
    compositor::{RoleKind, SurfaceError},
    server::{Event, ServerState, SurfaceId, ToplevelId, WindowSurfaceId},
    utils::{DeadResource, Rectangle, Serial, SerialCounter, Size},
};

pub use crate::compositor::AlreadyHasRole;

/// Window-role object of a surface
#[derive(Debug)]
pub struct WindowSurface {
    pub(crate) surface: SurfaceId,
    pub(crate) toplevel: Option<ToplevelId>,
    serials: SerialCounter,
    last_sent: Option<Serial>,
    last_acked: Option<Serial>,
    geometry: Option<Rectangle>,
}

/// Toplevel object of a window surface
#[derive(Debug)]
pub struct Toplevel {
    pub(crate) window_surface: WindowSurfaceId,
    pub(crate) surface: SurfaceId,
    title: Option<String>,
    app_id: Option<String>,
    size: Size,
}

/// Errors of the window shell
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// The surface is not alive
    #[error("the surface is not alive")]
    InvalidSurface,
    /// The surface has a role that is not the window role
    #[error(transparent)]
    Role(#[from] AlreadyHasRole),
    /// The window surface already has a toplevel
    #[error("window surface already constructed")]
    AlreadyConstructed,
    /// Window geometry must have a positive size
    #[error("invalid window geometry {0:?}")]
    InvalidGeometry(Rectangle),
    /// The window object is gone
    #[error(transparent)]
    Dead(#[from] DeadResource),
}

impl ServerState {
    /// Give a surface the window role and return its window surface
    ///
    /// Calling this again on a surface whose window surface is alive returns the same handle.
    pub fn get_window_surface(&mut self, surface: SurfaceId) -> Result<WindowSurfaceId, ShellError> {
        if self.surface(surface).is_err() {
            return Err(ShellError::InvalidSurface);
        }
        self.give_role(surface, RoleKind::Window).map_err(|err| match err {
            SurfaceError::Role(err) => ShellError::Role(err),
            _ => ShellError::InvalidSurface,
        })?;

        let conn = self.connection_mut(surface.connection)?;
        let existing = conn
            .surfaces
            .get(&surface)
            .ok_or(ShellError::InvalidSurface)?
            .window_surface;
        if let Some(existing) = existing {
            if conn.window_surfaces.contains_key(&existing) {
                return Ok(existing);
            }
        }

        let id = WindowSurfaceId::from_parts(surface.connection, conn.next_index());
        if let Some(surf) = conn.surfaces.get_mut(&surface) {
            surf.window_surface = Some(id);
        }
        conn.window_surfaces.insert(
            id,
            WindowSurface {
                surface,
                toplevel: None,
                serials: SerialCounter::new(),
                last_sent: None,
                last_acked: None,
                geometry: None,
            },
        );
        debug!(window_surface = %id, %surface, "Window surface created");
        Ok(id)
    }

    /// Create the toplevel of a window surface and send its initial configure
    pub fn get_toplevel(&mut self, window_surface: WindowSurfaceId) -> Result<ToplevelId, ShellError> {
        let size = self.config.default_window_size;
        let conn = self.connection_mut(window_surface.connection)?;
        let surface = {
            let record = conn.window_surfaces.get(&window_surface).ok_or(DeadResource)?;
            if record.toplevel.is_some() {
                return Err(ShellError::AlreadyConstructed);
            }
            record.surface
        };

        let id = ToplevelId::from_parts(window_surface.connection, conn.next_index());
        conn.toplevels.insert(
            id,
            Toplevel {
                window_surface,
                surface,
                title: None,
                app_id: None,
                size,
            },
        );
        if let Some(record) = conn.window_surfaces.get_mut(&window_surface) {
            record.toplevel = Some(id);
        }
        debug!(toplevel = %id, %window_surface, "Toplevel created");

        self.send_configure(id, size)?;
        Ok(id)
    }

    /// Suggest a new size to a toplevel
    ///
    /// Returns the serial the client is expected to acknowledge.
    pub fn send_configure(&mut self, toplevel: ToplevelId, size: Size) -> Result<Serial, ShellError> {
        let conn = self.connection_mut(toplevel.connection)?;
        let tl = conn.toplevels.get_mut(&toplevel).ok_or(DeadResource)?;
        tl.size = size;
        let window_surface = tl.window_surface;
        let record = conn
            .window_surfaces
            .get_mut(&window_surface)
            .ok_or(DeadResource)?;

        let serial = record.serials.next_serial();
        record.last_sent = Some(serial);
        conn.events.push_back(Event::Configure {
            window_surface,
            toplevel,
            size,
            serial,
        });
        trace!(%toplevel, ?size, ?serial, "Configure sent");
        Ok(serial)
    }

    /// Record the acknowledgement of a configure
    pub fn ack_configure(&mut self, window_surface: WindowSurfaceId, serial: Serial) -> Result<(), ShellError> {
        let record = self.window_surface_mut(window_surface)?;
        match record.last_sent {
            Some(last_sent) if last_sent.is_no_older_than(&serial) => {}
            _ => warn!(%window_surface, ?serial, "Client acknowledged a configure that was never sent"),
        }
        if let Some(last_acked) = record.last_acked {
            if !serial.is_no_older_than(&last_acked) {
                debug!(%window_surface, ?serial, ?last_acked, "Out of order configure acknowledgement");
            }
        }
        record.last_acked = Some(serial);
        Ok(())
    }

    /// Set the region of the surface that makes up the window, excluding decorations
    pub fn set_window_geometry(
        &mut self,
        window_surface: WindowSurfaceId,
        geometry: Rectangle,
    ) -> Result<(), ShellError> {
        let record = self.window_surface_mut(window_surface)?;
        if !geometry.size.is_positive() {
            return Err(ShellError::InvalidGeometry(geometry));
        }
        record.geometry = Some(geometry);
        Ok(())
    }

    /// Set the title of a toplevel
    pub fn set_title(&mut self, toplevel: ToplevelId, title: String) -> Result<(), ShellError> {
        self.toplevel_mut(toplevel)?.title = Some(title);
        Ok(())
    }

    /// Set the application id of a toplevel
    pub fn set_app_id(&mut self, toplevel: ToplevelId, app_id: String) -> Result<(), ShellError> {
        self.toplevel_mut(toplevel)?.app_id = Some(app_id);
        Ok(())
    }

    /// Destroy a window surface, and its toplevel if still alive
    ///
    /// The surface keeps its window role.
    pub fn destroy_window_surface(&mut self, window_surface: WindowSurfaceId) {
        let Ok(conn) = self.connection_mut(window_surface.connection) else {
            return;
        };
        let Some(record) = conn.window_surfaces.shift_remove(&window_surface) else {
            return;
        };
        if let Some(toplevel) = record.toplevel {
            conn.toplevels.shift_remove(&toplevel);
        }
        if let Some(surf) = conn.surfaces.get_mut(&record.surface) {
            if surf.window_surface == Some(window_surface) {
                surf.window_surface = None;
            }
        }
        debug!(%window_surface, "Window surface destroyed");
    }

    /// Destroy a toplevel, its window surface may get a new one
    pub fn destroy_toplevel(&mut self, toplevel: ToplevelId) {
        let Ok(conn) = self.connection_mut(toplevel.connection) else {
            return;
        };
        let Some(record) = conn.toplevels.shift_remove(&toplevel) else {
            return;
        };
        if let Some(ws) = conn.window_surfaces.get_mut(&record.window_surface) {
            ws.toplevel = None;
        }
        debug!(%toplevel, "Toplevel destroyed");
    }

    /// Live window surface of a surface
    pub fn window_surface_of(&self, surface: SurfaceId) -> Option<WindowSurfaceId> {
        let conn = self.connection(surface.connection).ok()?;
        conn.surfaces
            .get(&surface)?
            .window_surface
            .filter(|ws| conn.window_surfaces.contains_key(ws))
    }

    /// Live toplevel of a window surface
    pub fn toplevel_of(&self, window_surface: WindowSurfaceId) -> Option<ToplevelId> {
        self.window_surface(window_surface).ok()?.toplevel
    }

    /// Surface a toplevel belongs to
    pub fn toplevel_surface(&self, toplevel: ToplevelId) -> Option<SurfaceId> {
        self.toplevel(toplevel).ok().map(|t| t.surface)
    }

    /// Title of a toplevel
    pub fn toplevel_title(&self, toplevel: ToplevelId) -> Option<&str> {
        self.toplevel(toplevel).ok()?.title.as_deref()
    }

    /// Application id of a toplevel
    pub fn toplevel_app_id(&self, toplevel: ToplevelId) -> Option<&str> {
        self.toplevel(toplevel).ok()?.app_id.as_deref()
    }

    /// Last size suggested to a toplevel
    pub fn toplevel_size(&self, toplevel: ToplevelId) -> Option<Size> {
        self.toplevel(toplevel).ok().map(|t| t.size)
    }

    /// Last serial acknowledged on a window surface
    pub fn last_acked_serial(&self, window_surface: WindowSurfaceId) -> Option<Serial> {
        self.window_surface(window_surface).ok()?.last_acked
    }

    /// Window geometry of a window surface
    pub fn window_geometry(&self, window_surface: WindowSurfaceId) -> Option<Rectangle> {
        self.window_surface(window_surface).ok()?.geometry
    }

    fn window_surface(&self, id: WindowSurfaceId) -> Result<&WindowSurface, DeadResource> {
        self.connection(id.connection)?
            .window_surfaces
            .get(&id)
            .ok_or(DeadResource)
    }

    fn window_surface_mut(&mut self, id: WindowSurfaceId) -> Result<&mut WindowSurface, DeadResource> {
        self.connection_mut(id.connection)?
            .window_surfaces
            .get_mut(&id)
            .ok_or(DeadResource)
    }

    fn toplevel(&self, id: ToplevelId) -> Result<&Toplevel, DeadResource> {
        self.connection(id.connection)?
            .toplevels
            .get(&id)
            .ok_or(DeadResource)
    }

    fn toplevel_mut(&mut self, id: ToplevelId) -> Result<&mut Toplevel, DeadResource> {
        self.connection_mut(id.connection)?
            .toplevels
            .get_mut(&id)
            .ok_or(DeadResource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{ConnectionId, ServerConfig};

    fn setup() -> (ServerState, ConnectionId, SurfaceId) {
        let mut server = ServerState::new(ServerConfig {
            default_window_size: Size { w: 640, h: 480 },
            ..Default::default()
        });
        let client = server.connect();
        let surface = server.create_surface(client, 6).unwrap();
        (server, client, surface)
    }

    #[test]
    fn window_surface_is_idempotent() {
        let (mut server, _, surface) = setup();
        let first = server.get_window_surface(surface).unwrap();
        let second = server.get_window_surface(surface).unwrap();
        assert_eq!(first, second);
        assert_eq!(server.surface_role(surface), Some(RoleKind::Window));
        assert_eq!(server.window_surface_of(surface), Some(first));
    }

    #[test]
    fn other_role_is_rejected() {
        let (mut server, _, surface) = setup();
        server.give_role(surface, RoleKind::Cursor).unwrap();
        assert!(matches!(
            server.get_window_surface(surface),
            Err(ShellError::Role(AlreadyHasRole {
                current: RoleKind::Cursor
            }))
        ));
    }

    #[test]
    fn dead_surface_is_invalid() {
        let (mut server, _, surface) = setup();
        server.destroy_surface(surface);
        assert!(matches!(
            server.get_window_surface(surface),
            Err(ShellError::InvalidSurface)
        ));
    }

    #[test]
    fn toplevel_gets_initial_configure() {
        let (mut server, client, surface) = setup();
        let ws = server.get_window_surface(surface).unwrap();
        let toplevel = server.get_toplevel(ws).unwrap();

        let events = server.take_events(client);
        assert_eq!(
            events,
            vec![Event::Configure {
                window_surface: ws,
                toplevel,
                size: Size { w: 640, h: 480 },
                serial: Serial::from(1),
            }]
        );
        assert_eq!(server.toplevel_of(ws), Some(toplevel));
        assert_eq!(server.toplevel_surface(toplevel), Some(surface));

        assert!(matches!(
            server.get_toplevel(ws),
            Err(ShellError::AlreadyConstructed)
        ));
    }

    #[test]
    fn serials_increase_per_window_surface() {
        let (mut server, client, surface) = setup();
        let other = server.create_surface(client, 6).unwrap();
        let ws = server.get_window_surface(surface).unwrap();
        let toplevel = server.get_toplevel(ws).unwrap();
        let other_ws = server.get_window_surface(other).unwrap();
        server.get_toplevel(other_ws).unwrap();

        let second = server.send_configure(toplevel, Size { w: 100, h: 100 }).unwrap();
        let third = server.send_configure(toplevel, Size { w: 200, h: 100 }).unwrap();
        assert_eq!(second, Serial::from(2));
        assert!(second < third);
        assert_eq!(server.toplevel_size(toplevel), Some(Size { w: 200, h: 100 }));
    }

    #[test]
    fn acks_are_lenient() {
        let (mut server, _, surface) = setup();
        let ws = server.get_window_surface(surface).unwrap();
        // never sent
        server.ack_configure(ws, Serial::from(42)).unwrap();
        server.get_toplevel(ws).unwrap();
        server.ack_configure(ws, Serial::from(1)).unwrap();
        server.ack_configure(ws, Serial::from(1)).unwrap();
        assert_eq!(server.last_acked_serial(ws), Some(Serial::from(1)));
    }

    #[test]
    fn destroying_window_objects_keeps_the_role() {
        let (mut server, _, surface) = setup();
        let ws = server.get_window_surface(surface).unwrap();
        let toplevel = server.get_toplevel(ws).unwrap();
        server.set_title(toplevel, "Terminal".into()).unwrap();
        server.set_app_id(toplevel, "org.example.term".into()).unwrap();
        assert_eq!(server.toplevel_title(toplevel), Some("Terminal"));
        assert_eq!(server.toplevel_app_id(toplevel), Some("org.example.term"));

        server.destroy_toplevel(toplevel);
        assert_eq!(server.toplevel_of(ws), None);
        assert!(matches!(server.set_title(toplevel, "x".into()), Err(ShellError::Dead(_))));

        server.destroy_window_surface(ws);
        assert_eq!(server.window_surface_of(surface), None);
        assert_eq!(server.surface_role(surface), Some(RoleKind::Window));

        let again = server.get_window_surface(surface).unwrap();
        assert_ne!(again, ws);
    }

    #[test]
    fn surface_destruction_cascades_to_window_objects() {
        let (mut server, _, surface) = setup();
        let ws = server.get_window_surface(surface).unwrap();
        let toplevel = server.get_toplevel(ws).unwrap();
        server.destroy_surface(surface);
        assert_eq!(server.toplevel_surface(toplevel), None);
        assert!(matches!(
            server.ack_configure(ws, Serial::from(1)),
            Err(ShellError::Dead(_))
        ));
    }

    #[test]
    fn geometry_must_have_a_size() {
        let (mut server, _, surface) = setup();
        let ws = server.get_window_surface(surface).unwrap();
        assert!(matches!(
            server.set_window_geometry(ws, Rectangle::from_loc_and_size((0, 0), (0, 10))),
            Err(ShellError::InvalidGeometry(_))
        ));
        let geometry = Rectangle::from_loc_and_size((5, 5), (100, 80));
        server.set_window_geometry(ws, geometry).unwrap();
        assert_eq!(server.window_geometry(ws), Some(geometry));
    }
}
