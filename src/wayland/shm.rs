use tracing::{debug, trace, warn};
use wayland_server::{
    backend::ClientId,
    protocol::{
        wl_buffer::{self, WlBuffer},
        wl_shm::{self, WlShm},
        wl_shm_pool::{self, WlShmPool},
    },
    Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource, WEnum,
};

use super::{connection_of, format_from_wire, FrontendState, PoolRefs, ServerHandler};
use crate::{
    server::{BufferId, PoolId},
    shm::ShmError,
};

/// User data of a wl_shm_pool
#[derive(Debug)]
pub struct PoolUserData {
    /// The core pool
    pub pool: PoolId,
}

/// User data of a wl_buffer
#[derive(Debug)]
pub struct BufferUserData {
    /// The core buffer
    pub buffer: BufferId,
    /// Pool the buffer was created from
    pub pool: PoolId,
}

impl FrontendState {
    // The core pool outlives its wl_shm_pool as long as buffers created from it are alive.
    fn maybe_destroy_pool(&mut self, pool: PoolId) {
        let Some(refs) = self.pools.get(&pool) else {
            return;
        };
        if !refs.resource_alive && refs.buffers == 0 {
            self.pools.remove(&pool);
            self.server.destroy_pool(pool);
            debug!(%pool, "Pool released");
        }
    }
}

/*
 * wl_shm
 */

impl<D> GlobalDispatch<WlShm, (), D> for FrontendState
where
    D: GlobalDispatch<WlShm, ()>,
    D: Dispatch<WlShm, ()>,
    D: Dispatch<WlShmPool, PoolUserData>,
    D: ServerHandler,
{
    fn bind(
        state: &mut D,
        _dh: &DisplayHandle,
        client: &Client,
        resource: New<WlShm>,
        _global_data: &(),
        data_init: &mut DataInit<'_, D>,
    ) {
        let shm = data_init.init(resource, ());
        let Some(connection) = connection_of(client) else {
            shm.post_error(0u32, "client is not managed by this server");
            return;
        };

        let frontend = state.frontend_state();
        match frontend.server.bind(connection, "wl_shm", shm.version()) {
            Ok(instance) => {
                frontend.bound(shm.id(), instance);
                frontend.shm_instances.insert(instance, shm);
                // send the formats
                frontend.flush_events();
            }
            Err(err) => warn!(%connection, %err, "Failed to bind wl_shm"),
        }
    }
}

impl<D> Dispatch<WlShm, (), D> for FrontendState
where
    D: Dispatch<WlShm, ()>,
    D: Dispatch<WlShmPool, PoolUserData>,
    D: ServerHandler,
{
    fn request(
        state: &mut D,
        client: &Client,
        shm: &WlShm,
        request: wl_shm::Request,
        _data: &(),
        _dh: &DisplayHandle,
        data_init: &mut DataInit<'_, D>,
    ) {
        let (pool, fd, size) = match request {
            wl_shm::Request::CreatePool { id, fd, size } => (id, fd, size),
            _ => unreachable!(),
        };
        let Some(connection) = connection_of(client) else {
            return;
        };

        let frontend = state.frontend_state();
        match frontend.server.create_pool(connection, fd, size) {
            Ok(id) => {
                trace!(pool = %id, size, "Creating a new wl_shm_pool.");
                frontend.pools.insert(
                    id,
                    PoolRefs {
                        resource_alive: true,
                        buffers: 0,
                    },
                );
                data_init.init(pool, PoolUserData { pool: id });
            }
            Err(ShmError::InvalidSize(size)) => {
                shm.post_error(wl_shm::Error::InvalidStride, format!("invalid wl_shm_pool size {}", size));
            }
            Err(err) => {
                shm.post_error(wl_shm::Error::InvalidFd, format!("Failed to create pool: {}", err));
            }
        }
    }

    fn destroyed(state: &mut D, _client: ClientId, resource: &WlShm, _data: &()) {
        state.frontend_state().unbound(&resource.id());
    }
}

/*
 * wl_shm_pool
 */

impl<D> Dispatch<WlShmPool, PoolUserData, D> for FrontendState
where
    D: Dispatch<WlShmPool, PoolUserData>,
    D: Dispatch<WlBuffer, BufferUserData>,
    D: ServerHandler,
{
    fn request(
        state: &mut D,
        _client: &Client,
        resource: &WlShmPool,
        request: wl_shm_pool::Request,
        data: &PoolUserData,
        _dh: &DisplayHandle,
        data_init: &mut DataInit<'_, D>,
    ) {
        let frontend = state.frontend_state();
        match request {
            wl_shm_pool::Request::CreateBuffer {
                id,
                offset,
                width,
                height,
                stride,
                format,
            } => {
                let format = match format {
                    WEnum::Value(wire) => match format_from_wire(wire) {
                        Some(format) => format,
                        None => {
                            resource.post_error(
                                wl_shm::Error::InvalidFormat,
                                format!("format {:?} not supported", wire),
                            );
                            return;
                        }
                    },
                    WEnum::Unknown(unknown) => {
                        resource.post_error(
                            wl_shm::Error::InvalidFormat,
                            format!("unknown format 0x{:x}", unknown),
                        );
                        return;
                    }
                };

                match frontend
                    .server
                    .create_buffer(data.pool, offset, width, height, stride, format)
                {
                    Ok(buffer) => {
                        trace!(%buffer, "Creating a new wl_buffer.");
                        let wl_buffer = data_init.init(
                            id,
                            BufferUserData {
                                buffer,
                                pool: data.pool,
                            },
                        );
                        frontend.buffers.insert(buffer, wl_buffer);
                        if let Some(refs) = frontend.pools.get_mut(&data.pool) {
                            refs.buffers += 1;
                        }
                    }
                    Err(ShmError::UnsupportedFormat(format)) => resource.post_error(
                        wl_shm::Error::InvalidFormat,
                        format!("format {} not supported", format),
                    ),
                    Err(ShmError::Dead(_)) => warn!(pool = %data.pool, "Buffer requested from a dead pool"),
                    Err(err) => resource.post_error(wl_shm::Error::InvalidStride, err.to_string()),
                }
            }
            wl_shm_pool::Request::Resize { size } => {
                if let Err(err) = frontend.server.resize_pool(data.pool, size) {
                    resource.post_error(wl_shm::Error::InvalidFd, err.to_string());
                }
            }
            wl_shm_pool::Request::Destroy => {}
            _ => unreachable!(),
        }
    }

    fn destroyed(state: &mut D, _client: ClientId, _resource: &WlShmPool, data: &PoolUserData) {
        let frontend = state.frontend_state();
        if let Some(refs) = frontend.pools.get_mut(&data.pool) {
            refs.resource_alive = false;
        }
        frontend.maybe_destroy_pool(data.pool);
    }
}

/*
 * wl_buffer
 */

impl<D> Dispatch<WlBuffer, BufferUserData, D> for FrontendState
where
    D: Dispatch<WlBuffer, BufferUserData>,
    D: ServerHandler,
{
    fn request(
        _state: &mut D,
        _client: &Client,
        _resource: &WlBuffer,
        request: wl_buffer::Request,
        _data: &BufferUserData,
        _dh: &DisplayHandle,
        _data_init: &mut DataInit<'_, D>,
    ) {
        match request {
            wl_buffer::Request::Destroy => {
                // handled by the destructor
            }
            _ => unreachable!(),
        }
    }

    fn destroyed(state: &mut D, _client: ClientId, _resource: &WlBuffer, data: &BufferUserData) {
        let frontend = state.frontend_state();
        frontend.buffers.remove(&data.buffer);
        frontend.server.destroy_buffer(data.buffer);
        if let Some(refs) = frontend.pools.get_mut(&data.pool) {
            refs.buffers = refs.buffers.saturating_sub(1);
        }
        frontend.maybe_destroy_pool(data.pool);
    }
}
