//! Tools for handling surface roles
//!
//! A surface has no meaning on its own: it needs to be given a role, defining how the compositor
//! will use it. The role is set at most once: trying to assign a different role to a surface
//! that already has one is a protocol error, assigning the same one again is allowed and does
//! nothing.
//!
//! The role kind outlives the objects implementing it: once a surface became a window,
//! destroying its window objects leaves it a window.

use tracing::trace;

use super::SurfaceError;
use crate::server::{ServerState, SurfaceId};

/// The roles a surface may be given
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleKind {
    /// The surface is displayed as a window, driven by the window shell
    Window,
    /// The surface is used as a pointer image
    Cursor,
}

/// The surface already has a role of another kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("surface already has the {current:?} role")]
pub struct AlreadyHasRole {
    /// The role the surface carries
    pub current: RoleKind,
}

impl ServerState {
    /// Give a role to a surface, permanently
    ///
    /// Succeeds without change if the surface already carries this role kind.
    pub fn give_role(&mut self, surface: SurfaceId, kind: RoleKind) -> Result<(), SurfaceError> {
        let surf = self.surface_mut(surface)?;
        match surf.role {
            Some(current) if current == kind => Ok(()),
            Some(current) => Err(AlreadyHasRole { current }.into()),
            None => {
                surf.role = Some(kind);
                trace!(%surface, role = ?kind, "Role assigned");
                Ok(())
            }
        }
    }

    /// Role kind of a live surface
    pub fn surface_role(&self, surface: SurfaceId) -> Option<RoleKind> {
        self.surface(surface).ok().and_then(|s| s.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerConfig;

    #[test]
    fn role_is_permanent() {
        let mut server = ServerState::new(ServerConfig::default());
        let client = server.connect();
        let surface = server.create_surface(client, 6).unwrap();

        assert_eq!(server.surface_role(surface), None);
        server.give_role(surface, RoleKind::Cursor).unwrap();
        server.give_role(surface, RoleKind::Cursor).unwrap();
        assert!(matches!(
            server.give_role(surface, RoleKind::Window),
            Err(SurfaceError::Role(AlreadyHasRole {
                current: RoleKind::Cursor
            }))
        ));
        assert_eq!(server.surface_role(surface), Some(RoleKind::Cursor));
    }
}
