//! Surfaces and their double-buffered state
//!
//! A surface accumulates client requests (buffer attachment, damage, scale, transform, frame
//! callbacks) in its *pending* state. None of it is visible until the client commits, at which
//! point pending state is promoted to the *current* state, the one a renderer or any other
//! collaborator is allowed to look at.
//!
//! ## Buffers and commits
//!
//! Attaching a buffer only records it as pending. On commit:
//!
//! - if the attachment replaces a different buffer, the compositor's claim on the old one ends.
//!   Once no surface holds it as current any more it is released, and
//!   [`Event::BufferReleased`] is queued for its client;
//! - the attached buffer (or none, to unmap) becomes current, along with its dimensions;
//! - if the current buffer changed to a live buffer, its metadata is published to the
//!   [`export`](crate::export) subscribers.
//!
//! A commit without a new attachment leaves the buffer state untouched. A buffer destroyed
//! between attach and commit is treated as if none had been attached.
//!
//! Surfaces never own buffers: destroying a surface simply drops its references, without
//! releasing anything.
//!
//! ## Frame callbacks
//!
//! Callbacks requested with [`frame`](ServerState::frame) become active on the next commit and
//! fire exactly once, when the presentation collaborator calls
//! [`present`](ServerState::present) for the surface.
//!
//! ## Damage
//!
//! Each commit replaces the committed damage with the damage accumulated since the previous
//! commit. A presentation clears it.

use tracing::{debug, trace};

use crate::{
    server::{BufferId, CallbackId, ConnectionId, Event, ServerState, SurfaceId, WindowSurfaceId},
    utils::{DeadResource, Point, Rectangle, Transform},
};

pub mod roles;

pub use self::roles::{AlreadyHasRole, RoleKind};

/// Description of which part of a surface
/// should be considered damaged and needs to be redrawn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Damage {
    /// A rectangle containing the damaged zone, in surface coordinates
    Surface(Rectangle),
    /// A rectangle containing the damaged zone, in buffer coordinates
    ///
    /// Note: Buffer scaling must be taken into consideration
    Buffer(Rectangle),
}

/// New buffer assignation for a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAssignment {
    /// The surface no longer has a buffer attached to it
    Removed,
    /// A new buffer has been attached
    NewBuffer(BufferId),
}

/// Pending state of a surface, not yet committed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SurfaceAttributes {
    /// Buffer attached since the last commit
    ///
    /// `None` means the client did not attach anything, `Some(Removed)` that it explicitly
    /// attached no buffer.
    pub buffer: Option<BufferAssignment>,
    /// Location of the new buffer relative to the previous one
    pub buffer_delta: Option<Point>,
    /// Scale requested since the last commit
    pub buffer_scale: Option<i32>,
    /// Transform requested since the last commit
    pub buffer_transform: Option<Transform>,
    /// Damage accumulated since the last commit
    pub damage: Vec<Damage>,
    /// Frame callbacks requested since the last commit
    pub frame_callbacks: Vec<CallbackId>,
}

/// Current, committed state of a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceState {
    /// The committed buffer
    ///
    /// The handle stops resolving if its pool is destroyed while committed.
    pub buffer: Option<BufferId>,
    /// Width of the committed buffer, 0 without buffer
    pub width: i32,
    /// Height of the committed buffer, 0 without buffer
    pub height: i32,
    /// Last committed buffer offset
    pub buffer_delta: Point,
    /// Scale of the buffer contents
    pub buffer_scale: i32,
    /// Transform of the buffer contents
    pub buffer_transform: Transform,
}

impl Default for SurfaceState {
    fn default() -> Self {
        SurfaceState {
            buffer: None,
            width: 0,
            height: 0,
            buffer_delta: Point::default(),
            buffer_scale: 1,
            buffer_transform: Transform::Normal,
        }
    }
}

/// Buffer-related status of a surface, derived from its pending and current states
///
/// A committed buffer that died along with its pool no longer counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus {
    /// Nothing attached, nothing committed
    Unattached,
    /// A buffer is attached and awaits a commit
    HasPendingBuffer,
    /// A live buffer is committed and no new one is pending
    HasCommittedBuffer,
}

/// A drawable surface
#[derive(Debug)]
pub struct Surface {
    pub(crate) version: u32,
    pub(crate) pending: SurfaceAttributes,
    pub(crate) current: SurfaceState,
    pub(crate) damage: Vec<Damage>,
    pub(crate) frame_callbacks: Vec<CallbackId>,
    pub(crate) role: Option<RoleKind>,
    pub(crate) window_surface: Option<WindowSurfaceId>,
}

/// Errors of surface requests
#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    /// Surfaces of version 5 and later take their offset through `offset`, not `attach`
    #[error("non-zero attach offset ({x}, {y}) on a version 5 surface")]
    InvalidOffset {
        /// Requested horizontal offset
        x: i32,
        /// Requested vertical offset
        y: i32,
    },
    /// The buffer is dead or belongs to another client
    #[error("{0} cannot be attached")]
    InvalidBuffer(BufferId),
    /// Buffer scale must be at least 1
    #[error("invalid buffer scale {0}")]
    InvalidScale(i32),
    /// Role assignment failed
    #[error(transparent)]
    Role(#[from] AlreadyHasRole),
    /// The surface is gone
    #[error(transparent)]
    Dead(#[from] DeadResource),
}

impl ServerState {
    /// Create a surface with the version of the compositor instance it was created through
    pub fn create_surface(&mut self, connection: ConnectionId, version: u32) -> Result<SurfaceId, DeadResource> {
        let conn = self.connection_mut(connection)?;
        let id = SurfaceId::from_parts(connection, conn.next_index());
        conn.surfaces.insert(
            id,
            Surface {
                version,
                pending: SurfaceAttributes::default(),
                current: SurfaceState::default(),
                damage: Vec::new(),
                frame_callbacks: Vec::new(),
                role: None,
                window_surface: None,
            },
        );
        trace!(surface = %id, version, "Surface created");
        Ok(id)
    }

    /// Attach a buffer, or none, to the pending state
    pub fn attach(
        &mut self,
        surface: SurfaceId,
        buffer: Option<BufferId>,
        x: i32,
        y: i32,
    ) -> Result<(), SurfaceError> {
        let conn = self.connection_mut(surface.connection)?;
        let surf = conn.surfaces.get_mut(&surface).ok_or(DeadResource)?;

        if surf.version >= 5 && (x != 0 || y != 0) {
            return Err(SurfaceError::InvalidOffset { x, y });
        }
        if let Some(buffer) = buffer {
            if buffer.connection != surface.connection || !conn.buffers.contains_key(&buffer) {
                return Err(SurfaceError::InvalidBuffer(buffer));
            }
        }

        // an attachment replaced before commit gives up its claim
        if let Some(BufferAssignment::NewBuffer(previous)) = surf.pending.buffer {
            if let Some(shm_buffer) = conn.buffers.get_mut(&previous) {
                shm_buffer.pending_refs = shm_buffer.pending_refs.saturating_sub(1);
            }
        }
        surf.pending.buffer = Some(match buffer {
            Some(buffer) => {
                if let Some(shm_buffer) = conn.buffers.get_mut(&buffer) {
                    shm_buffer.pending_refs += 1;
                }
                BufferAssignment::NewBuffer(buffer)
            }
            None => BufferAssignment::Removed,
        });
        if surf.version < 5 {
            surf.pending.buffer_delta = Some(Point { x, y });
        }
        trace!(%surface, ?buffer, x, y, "Buffer attached");
        Ok(())
    }

    /// Set the pending buffer offset
    pub fn offset(&mut self, surface: SurfaceId, x: i32, y: i32) -> Result<(), SurfaceError> {
        self.surface_mut(surface)?.pending.buffer_delta = Some(Point { x, y });
        Ok(())
    }

    /// Add damage in surface coordinates
    pub fn damage(&mut self, surface: SurfaceId, rect: Rectangle) -> Result<(), SurfaceError> {
        self.surface_mut(surface)?.pending.damage.push(Damage::Surface(rect));
        Ok(())
    }

    /// Add damage in buffer coordinates
    pub fn damage_buffer(&mut self, surface: SurfaceId, rect: Rectangle) -> Result<(), SurfaceError> {
        self.surface_mut(surface)?.pending.damage.push(Damage::Buffer(rect));
        Ok(())
    }

    /// Set the pending buffer scale
    pub fn set_buffer_scale(&mut self, surface: SurfaceId, scale: i32) -> Result<(), SurfaceError> {
        let surf = self.surface_mut(surface)?;
        if scale < 1 {
            return Err(SurfaceError::InvalidScale(scale));
        }
        surf.pending.buffer_scale = Some(scale);
        Ok(())
    }

    /// Set the pending buffer transform
    pub fn set_buffer_transform(&mut self, surface: SurfaceId, transform: Transform) -> Result<(), SurfaceError> {
        self.surface_mut(surface)?.pending.buffer_transform = Some(transform);
        Ok(())
    }

    /// Request a one-shot notification for the next presentation of this surface
    pub fn frame(&mut self, surface: SurfaceId) -> Result<CallbackId, SurfaceError> {
        let conn = self.connection_mut(surface.connection)?;
        let callback = CallbackId::from_parts(surface.connection, conn.next_index());
        conn.surfaces
            .get_mut(&surface)
            .ok_or(DeadResource)?
            .pending
            .frame_callbacks
            .push(callback);
        Ok(callback)
    }

    /// Promote the pending state of a surface to its current state
    pub fn commit(&mut self, surface: SurfaceId) -> Result<(), SurfaceError> {
        let conn = self.connection_mut(surface.connection)?;
        let surf = conn.surfaces.get_mut(&surface).ok_or(DeadResource)?;

        let mut published = None;
        if let Some(assignment) = surf.pending.buffer.take() {
            let new = match assignment {
                BufferAssignment::NewBuffer(buffer) => match conn.buffers.get_mut(&buffer) {
                    Some(shm_buffer) => {
                        shm_buffer.pending_refs = shm_buffer.pending_refs.saturating_sub(1);
                        Some(buffer)
                    }
                    None => {
                        debug!(%surface, %buffer, "Attached buffer died before commit");
                        None
                    }
                },
                BufferAssignment::Removed => None,
            };

            let old = surf.current.buffer;
            if old != new {
                if let Some(old) = old {
                    if let Some(shm_buffer) = conn.buffers.get_mut(&old) {
                        shm_buffer.current_refs = shm_buffer.current_refs.saturating_sub(1);
                        if shm_buffer.current_refs == 0 {
                            shm_buffer.released = true;
                            conn.events.push_back(Event::BufferReleased { buffer: old });
                            trace!(buffer = %old, "Buffer released");
                        }
                    }
                }
                if let Some(new) = new {
                    if let Some(shm_buffer) = conn.buffers.get_mut(&new) {
                        shm_buffer.current_refs += 1;
                        shm_buffer.released = false;
                    }
                    published = Some(new);
                }
            }

            let (width, height) = new
                .and_then(|buffer| conn.buffers.get(&buffer))
                .map(|shm_buffer| (shm_buffer.data.width, shm_buffer.data.height))
                .unwrap_or((0, 0));
            surf.current.buffer = new;
            surf.current.width = width;
            surf.current.height = height;
        }

        if let Some(delta) = surf.pending.buffer_delta.take() {
            surf.current.buffer_delta = delta;
        }
        if let Some(scale) = surf.pending.buffer_scale.take() {
            surf.current.buffer_scale = scale;
        }
        if let Some(transform) = surf.pending.buffer_transform.take() {
            surf.current.buffer_transform = transform;
        }
        surf.damage = std::mem::take(&mut surf.pending.damage);
        surf.frame_callbacks.append(&mut surf.pending.frame_callbacks);

        trace!(%surface, current = ?surf.current, "Surface committed");

        if let Some(buffer) = published {
            self.publish_buffer(surface, buffer);
        }
        Ok(())
    }

    /// Report that the current content of a surface was presented
    ///
    /// Every committed frame callback fires exactly once and accumulated damage is cleared.
    pub fn present(&mut self, surface: SurfaceId, time: u32) -> Result<(), SurfaceError> {
        let conn = self.connection_mut(surface.connection)?;
        let surf = conn.surfaces.get_mut(&surface).ok_or(DeadResource)?;
        surf.damage.clear();
        for callback in surf.frame_callbacks.drain(..) {
            conn.events.push_back(Event::FrameDone { callback, time });
        }
        Ok(())
    }

    /// Present every surface that has a committed buffer
    pub fn present_all(&mut self, time: u32) {
        for conn in self.connections.values_mut() {
            for surf in conn.surfaces.values_mut() {
                if surf.current.buffer.is_none() {
                    continue;
                }
                surf.damage.clear();
                for callback in surf.frame_callbacks.drain(..) {
                    conn.events.push_back(Event::FrameDone { callback, time });
                }
            }
        }
    }

    /// Destroy a surface along with its window objects
    ///
    /// Buffer references are dropped without any release. Frame callbacks never fire: the
    /// discarded ones, pending and committed, are returned.
    pub fn destroy_surface(&mut self, surface: SurfaceId) -> Vec<CallbackId> {
        let Ok(conn) = self.connection_mut(surface.connection) else {
            return Vec::new();
        };
        let Some(mut surf) = conn.surfaces.shift_remove(&surface) else {
            return Vec::new();
        };

        if let Some(BufferAssignment::NewBuffer(buffer)) = surf.pending.buffer {
            if let Some(shm_buffer) = conn.buffers.get_mut(&buffer) {
                shm_buffer.pending_refs = shm_buffer.pending_refs.saturating_sub(1);
            }
        }
        if let Some(buffer) = surf.current.buffer {
            if let Some(shm_buffer) = conn.buffers.get_mut(&buffer) {
                shm_buffer.current_refs = shm_buffer.current_refs.saturating_sub(1);
            }
        }
        if let Some(window_surface) = surf.window_surface {
            if let Some(record) = conn.window_surfaces.shift_remove(&window_surface) {
                if let Some(toplevel) = record.toplevel {
                    conn.toplevels.shift_remove(&toplevel);
                }
            }
        }

        self.export.forget_surface(surface);
        debug!(%surface, "Surface destroyed");

        let mut discarded = std::mem::take(&mut surf.frame_callbacks);
        discarded.append(&mut surf.pending.frame_callbacks);
        discarded
    }

    /// Committed state of a live surface
    pub fn surface_current(&self, surface: SurfaceId) -> Option<&SurfaceState> {
        self.surface(surface).ok().map(|s| &s.current)
    }

    /// Pending state of a live surface
    pub fn surface_pending(&self, surface: SurfaceId) -> Option<&SurfaceAttributes> {
        self.surface(surface).ok().map(|s| &s.pending)
    }

    /// Damage of the last commit, unless a presentation cleared it
    pub fn surface_damage(&self, surface: SurfaceId) -> Option<&[Damage]> {
        self.surface(surface).ok().map(|s| &s.damage[..])
    }

    /// Buffer status of a live surface
    pub fn surface_status(&self, surface: SurfaceId) -> Option<SurfaceStatus> {
        let conn = self.connection(surface.connection).ok()?;
        let surf = conn.surfaces.get(&surface)?;
        Some(match (surf.pending.buffer, surf.current.buffer) {
            (Some(BufferAssignment::NewBuffer(_)), _) => SurfaceStatus::HasPendingBuffer,
            (_, Some(buffer)) if conn.buffers.contains_key(&buffer) => SurfaceStatus::HasCommittedBuffer,
            _ => SurfaceStatus::Unattached,
        })
    }

    /// Protocol version of a live surface
    pub fn surface_version(&self, surface: SurfaceId) -> Option<u32> {
        self.surface(surface).ok().map(|s| s.version)
    }

    pub(crate) fn surface(&self, surface: SurfaceId) -> Result<&Surface, DeadResource> {
        self.connection(surface.connection)?
            .surfaces
            .get(&surface)
            .ok_or(DeadResource)
    }

    pub(crate) fn surface_mut(&mut self, surface: SurfaceId) -> Result<&mut Surface, DeadResource> {
        self.connection_mut(surface.connection)?
            .surfaces
            .get_mut(&surface)
            .ok_or(DeadResource)
    }
}
