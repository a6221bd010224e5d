use tracing::{debug, trace, warn};
use wayland_protocols::xdg::shell::server::{
    xdg_popup::{self, XdgPopup},
    xdg_positioner::{self, XdgPositioner},
    xdg_surface::{self, XdgSurface},
    xdg_toplevel::{self, XdgToplevel},
    xdg_wm_base::{self, XdgWmBase},
};
use wayland_server::{
    backend::ClientId, Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource,
};

use super::{connection_of, FrontendState, ServerHandler, SurfaceUserData};
use crate::{
    server::{ToplevelId, WindowSurfaceId},
    shell::ShellError,
    utils::{Rectangle, Serial},
};

/*
 * xdg_wm_base
 */

impl<D> GlobalDispatch<XdgWmBase, (), D> for FrontendState
where
    D: GlobalDispatch<XdgWmBase, ()>,
    D: Dispatch<XdgWmBase, ()>,
    D: Dispatch<XdgSurface, XdgSurfaceUserData>,
    D: Dispatch<XdgPositioner, ()>,
    D: ServerHandler,
{
    fn bind(
        state: &mut D,
        _dh: &DisplayHandle,
        client: &Client,
        resource: New<XdgWmBase>,
        _global_data: &(),
        data_init: &mut DataInit<'_, D>,
    ) {
        let shell = data_init.init(resource, ());
        let Some(connection) = connection_of(client) else {
            shell.post_error(0u32, "client is not managed by this server");
            return;
        };
        let frontend = state.frontend_state();
        match frontend.server.bind(connection, "xdg_wm_base", shell.version()) {
            Ok(instance) => frontend.bound(shell.id(), instance),
            Err(err) => warn!(%connection, %err, "Failed to bind xdg_wm_base"),
        }
    }
}

impl<D> Dispatch<XdgWmBase, (), D> for FrontendState
where
    D: Dispatch<XdgWmBase, ()>,
    D: Dispatch<XdgSurface, XdgSurfaceUserData>,
    D: Dispatch<XdgPositioner, ()>,
    D: ServerHandler,
{
    fn request(
        state: &mut D,
        _client: &Client,
        shell: &XdgWmBase,
        request: xdg_wm_base::Request,
        _data: &(),
        _dh: &DisplayHandle,
        data_init: &mut DataInit<'_, D>,
    ) {
        match request {
            xdg_wm_base::Request::CreatePositioner { id } => {
                data_init.init(id, ());
            }
            xdg_wm_base::Request::GetXdgSurface { id, surface } => {
                let Some(surface) = surface.data::<SurfaceUserData>().map(|data| data.surface) else {
                    return;
                };
                let server = &mut state.frontend_state().server;

                if server.window_surface_of(surface).is_some() {
                    shell.post_error(
                        xdg_wm_base::Error::Role,
                        "Surface already has an xdg_surface.",
                    );
                    return;
                }

                match server.get_window_surface(surface) {
                    Ok(window_surface) => {
                        trace!(%window_surface, "Creating a new xdg_surface.");
                        data_init.init(
                            id,
                            XdgSurfaceUserData {
                                window_surface,
                                wm_base: shell.clone(),
                            },
                        );
                    }
                    Err(ShellError::Role(_)) => {
                        shell.post_error(xdg_wm_base::Error::Role, "Surface already has a role.");
                    }
                    Err(err) => warn!(%surface, %err, "Failed to create xdg_surface"),
                }
            }
            xdg_wm_base::Request::Pong { serial } => {
                trace!(serial, "Client pong");
            }
            xdg_wm_base::Request::Destroy => {
                // all is handled by destructor
            }
            _ => unreachable!(),
        }
    }

    fn destroyed(state: &mut D, _client: ClientId, resource: &XdgWmBase, _data: &()) {
        state.frontend_state().unbound(&resource.id());
    }
}

/*
 * xdg_positioner
 */

impl<D> Dispatch<XdgPositioner, (), D> for FrontendState
where
    D: Dispatch<XdgPositioner, ()>,
    D: ServerHandler,
{
    fn request(
        _state: &mut D,
        _client: &Client,
        _resource: &XdgPositioner,
        _request: xdg_positioner::Request,
        _data: &(),
        _dh: &DisplayHandle,
        _data_init: &mut DataInit<'_, D>,
    ) {
        // popups are dismissed right away, their placement is irrelevant
    }
}

/*
 * xdg_surface
 */

/// User data of an xdg_surface
#[derive(Debug)]
pub struct XdgSurfaceUserData {
    /// The core window surface
    pub window_surface: WindowSurfaceId,
    pub(crate) wm_base: XdgWmBase,
}

impl<D> Dispatch<XdgSurface, XdgSurfaceUserData, D> for FrontendState
where
    D: Dispatch<XdgSurface, XdgSurfaceUserData>,
    D: Dispatch<XdgToplevel, ToplevelId>,
    D: Dispatch<XdgPopup, ()>,
    D: ServerHandler,
{
    fn request(
        state: &mut D,
        _client: &Client,
        xdg_surface: &XdgSurface,
        request: xdg_surface::Request,
        data: &XdgSurfaceUserData,
        _dh: &DisplayHandle,
        data_init: &mut DataInit<'_, D>,
    ) {
        let window_surface = data.window_surface;
        match request {
            xdg_surface::Request::GetToplevel { id } => {
                let frontend = state.frontend_state();
                match frontend.server.get_toplevel(window_surface) {
                    Ok(toplevel) => {
                        let xdg_toplevel = data_init.init(id, toplevel);
                        frontend
                            .toplevels
                            .insert(toplevel, (xdg_toplevel, xdg_surface.clone()));
                        state.new_toplevel(toplevel);
                        state.frontend_state().flush_events();
                    }
                    Err(ShellError::AlreadyConstructed) => xdg_surface.post_error(
                        xdg_surface::Error::AlreadyConstructed,
                        "xdg_surface already has a role object.",
                    ),
                    Err(ShellError::Role(_)) => {
                        data.wm_base
                            .post_error(xdg_wm_base::Error::Role, "Surface already has a role.");
                    }
                    Err(err) => xdg_surface.post_error(xdg_surface::Error::NotConstructed, err.to_string()),
                }
            }
            xdg_surface::Request::GetPopup { id, .. } => {
                debug!(%window_surface, "Popups are not supported, dismissing");
                let popup = data_init.init(id, ());
                popup.popup_done();
            }
            xdg_surface::Request::SetWindowGeometry { x, y, width, height } => {
                let geometry = Rectangle::from_loc_and_size((x, y), (width, height));
                if let Err(err) = state
                    .frontend_state()
                    .server
                    .set_window_geometry(window_surface, geometry)
                {
                    warn!(%window_surface, %err, "Ignoring window geometry");
                }
            }
            xdg_surface::Request::AckConfigure { serial } => {
                if let Err(err) = state
                    .frontend_state()
                    .server
                    .ack_configure(window_surface, Serial::from(serial))
                {
                    warn!(%window_surface, %err, "Failed to acknowledge configure");
                }
            }
            xdg_surface::Request::Destroy => {
                // all is handled by destructor
            }
            _ => unreachable!(),
        }
    }

    fn destroyed(state: &mut D, _client: ClientId, _resource: &XdgSurface, data: &XdgSurfaceUserData) {
        state
            .frontend_state()
            .server
            .destroy_window_surface(data.window_surface);
    }
}

/*
 * xdg_toplevel
 */

impl<D> Dispatch<XdgToplevel, ToplevelId, D> for FrontendState
where
    D: Dispatch<XdgToplevel, ToplevelId>,
    D: ServerHandler,
{
    fn request(
        state: &mut D,
        _client: &Client,
        _resource: &XdgToplevel,
        request: xdg_toplevel::Request,
        data: &ToplevelId,
        _dh: &DisplayHandle,
        _data_init: &mut DataInit<'_, D>,
    ) {
        let toplevel = *data;
        let server = &mut state.frontend_state().server;
        let result = match request {
            xdg_toplevel::Request::SetTitle { title } => server.set_title(toplevel, title),
            xdg_toplevel::Request::SetAppId { app_id } => server.set_app_id(toplevel, app_id),
            xdg_toplevel::Request::Destroy => Ok(()),
            request => {
                trace!(%toplevel, ?request, "Ignoring toplevel request");
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(%toplevel, %err, "Toplevel request failed");
        }
    }

    fn destroyed(state: &mut D, _client: ClientId, _resource: &XdgToplevel, data: &ToplevelId) {
        let frontend = state.frontend_state();
        frontend.toplevels.remove(data);
        frontend.server.destroy_toplevel(*data);
    }
}

/*
 * xdg_popup
 */

impl<D> Dispatch<XdgPopup, (), D> for FrontendState
where
    D: Dispatch<XdgPopup, ()>,
    D: ServerHandler,
{
    fn request(
        _state: &mut D,
        _client: &Client,
        _resource: &XdgPopup,
        _request: xdg_popup::Request,
        _data: &(),
        _dh: &DisplayHandle,
        _data_init: &mut DataInit<'_, D>,
    ) {
    }
}
