use tracing::{trace, warn};
use wayland_server::{
    backend::ClientId,
    protocol::{
        wl_callback::{self, WlCallback},
        wl_compositor::{self, WlCompositor},
        wl_region::{self, WlRegion},
        wl_surface::{self, WlSurface},
    },
    Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource, WEnum,
};

use super::{connection_of, BufferUserData, FrontendState, ServerHandler};
use crate::{
    compositor::SurfaceError,
    server::SurfaceId,
    utils::{Rectangle, Transform},
};

/*
 * wl_compositor
 */

impl<D> GlobalDispatch<WlCompositor, (), D> for FrontendState
where
    D: GlobalDispatch<WlCompositor, ()>,
    D: Dispatch<WlCompositor, ()>,
    D: Dispatch<WlSurface, SurfaceUserData>,
    D: Dispatch<WlRegion, ()>,
    D: ServerHandler,
{
    fn bind(
        state: &mut D,
        _handle: &DisplayHandle,
        client: &Client,
        resource: New<WlCompositor>,
        _global_data: &(),
        data_init: &mut DataInit<'_, D>,
    ) {
        let compositor = data_init.init(resource, ());
        let Some(connection) = connection_of(client) else {
            compositor.post_error(0u32, "client is not managed by this server");
            return;
        };
        let frontend = state.frontend_state();
        match frontend
            .server
            .bind(connection, "wl_compositor", compositor.version())
        {
            Ok(instance) => frontend.bound(compositor.id(), instance),
            Err(err) => warn!(%connection, %err, "Failed to bind wl_compositor"),
        }
    }
}

impl<D> Dispatch<WlCompositor, (), D> for FrontendState
where
    D: Dispatch<WlCompositor, ()>,
    D: Dispatch<WlSurface, SurfaceUserData>,
    D: Dispatch<WlRegion, ()>,
    D: ServerHandler,
{
    fn request(
        state: &mut D,
        client: &Client,
        compositor: &WlCompositor,
        request: wl_compositor::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, D>,
    ) {
        match request {
            wl_compositor::Request::CreateSurface { id } => {
                let Some(connection) = connection_of(client) else {
                    return;
                };
                let version = compositor.version();
                match state.frontend_state().server.create_surface(connection, version) {
                    Ok(surface) => {
                        trace!(%surface, "Creating a new wl_surface.");
                        data_init.init(id, SurfaceUserData { surface });
                    }
                    Err(_) => compositor.post_error(0u32, "client connection is gone"),
                }
            }
            wl_compositor::Request::CreateRegion { id } => {
                trace!("Creating a new wl_region.");
                data_init.init(id, ());
            }
            _ => unreachable!(),
        }
    }

    fn destroyed(state: &mut D, _client: ClientId, resource: &WlCompositor, _data: &()) {
        state.frontend_state().unbound(&resource.id());
    }
}

/*
 * wl_surface
 */

/// User data of a wl_surface
#[derive(Debug)]
pub struct SurfaceUserData {
    /// The core surface
    pub surface: SurfaceId,
}

impl<D> Dispatch<WlSurface, SurfaceUserData, D> for FrontendState
where
    D: Dispatch<WlSurface, SurfaceUserData>,
    D: Dispatch<WlCallback, ()>,
    D: ServerHandler,
{
    fn request(
        state: &mut D,
        _client: &Client,
        resource: &WlSurface,
        request: wl_surface::Request,
        data: &SurfaceUserData,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, D>,
    ) {
        let surface = data.surface;
        let frontend = state.frontend_state();
        let result = match request {
            wl_surface::Request::Attach { buffer: None, x, y } => frontend.server.attach(surface, None, x, y),
            wl_surface::Request::Attach {
                buffer: Some(buffer),
                x,
                y,
            } => match buffer.data::<BufferUserData>() {
                Some(buffer_data) => frontend.server.attach(surface, Some(buffer_data.buffer), x, y),
                None => {
                    warn!(%surface, "Ignoring attach of a buffer not created through wl_shm");
                    Ok(())
                }
            },
            wl_surface::Request::Offset { x, y } => frontend.server.offset(surface, x, y),
            wl_surface::Request::Damage { x, y, width, height } => frontend
                .server
                .damage(surface, Rectangle::from_loc_and_size((x, y), (width, height))),
            wl_surface::Request::DamageBuffer { x, y, width, height } => frontend
                .server
                .damage_buffer(surface, Rectangle::from_loc_and_size((x, y), (width, height))),
            wl_surface::Request::Frame { callback } => match frontend.server.frame(surface) {
                Ok(id) => {
                    let callback = data_init.init(callback, ());
                    frontend.callbacks.insert(id, callback);
                    Ok(())
                }
                Err(err) => Err(err),
            },
            wl_surface::Request::SetOpaqueRegion { .. } | wl_surface::Request::SetInputRegion { .. } => Ok(()),
            wl_surface::Request::Commit => match frontend.server.commit(surface) {
                Ok(()) => {
                    trace!(%surface, "Calling user implementation for wl_surface.commit");
                    state.commit(surface);
                    state.frontend_state().flush_events();
                    Ok(())
                }
                Err(err) => Err(err),
            },
            wl_surface::Request::SetBufferTransform { transform } => match transform {
                WEnum::Value(transform) => frontend
                    .server
                    .set_buffer_transform(surface, Transform::from(transform)),
                WEnum::Unknown(value) => {
                    resource.post_error(
                        wl_surface::Error::InvalidTransform,
                        format!("Unknown buffer transform {}.", value),
                    );
                    Ok(())
                }
            },
            wl_surface::Request::SetBufferScale { scale } => frontend.server.set_buffer_scale(surface, scale),
            wl_surface::Request::Destroy => {
                // handled by the destructor
                Ok(())
            }
            _ => unreachable!(),
        };

        match result {
            Ok(()) => {}
            Err(SurfaceError::InvalidOffset { .. }) => resource.post_error(
                wl_surface::Error::InvalidOffset,
                "Attaching with an offset is not allowed from version 5 on.",
            ),
            Err(SurfaceError::InvalidScale(scale)) => resource.post_error(
                wl_surface::Error::InvalidScale,
                format!("Buffer scale {} must be at least 1.", scale),
            ),
            Err(err) => warn!(%surface, %err, "Ignoring failed surface request"),
        }
    }

    fn destroyed(state: &mut D, _client: ClientId, _resource: &WlSurface, data: &SurfaceUserData) {
        let frontend = state.frontend_state();
        for callback in frontend.server.destroy_surface(data.surface) {
            frontend.callbacks.remove(&callback);
        }
    }
}

/*
 * wl_region
 */

impl<D> Dispatch<WlRegion, (), D> for FrontendState
where
    D: Dispatch<WlRegion, ()>,
    D: ServerHandler,
{
    fn request(
        _state: &mut D,
        _client: &Client,
        _resource: &WlRegion,
        request: wl_region::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, D>,
    ) {
        // regions only matter for input and opaque hints, which are not tracked
        match request {
            wl_region::Request::Add { .. } | wl_region::Request::Subtract { .. } => {}
            wl_region::Request::Destroy => {}
            _ => unreachable!(),
        }
    }
}

/*
 * wl_callback
 */

impl<D> Dispatch<WlCallback, (), D> for FrontendState
where
    D: Dispatch<WlCallback, ()>,
    D: ServerHandler,
{
    fn request(
        _state: &mut D,
        _client: &Client,
        _resource: &WlCallback,
        _request: wl_callback::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, D>,
    ) {
    }
}
