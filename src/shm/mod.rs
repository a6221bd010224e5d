//! Shared-memory pools and buffers
//!
//! SHM (Shared Memory) is the most basic way clients can send content to the server: by sending
//! a file descriptor to some (likely RAM-backed) storage containing the actual pixel data. A
//! client first creates a pool from such a descriptor, which the server maps read-write and
//! shared, and then carves buffers out of it. Every buffer's geometry is validated against the
//! pool once, at creation, and stays fixed afterwards:
//!
//! ```
//! use std::{io::Write, os::unix::io::OwnedFd};
//! use tessera::{server::{ServerConfig, ServerState}, shm::Fourcc};
//!
//! let mut server = ServerState::new(ServerConfig::default());
//! let client = server.connect();
//!
//! let mut file = tempfile::tempfile().unwrap();
//! file.write_all(&[0u8; 16000]).unwrap();
//! let pool = server.create_pool(client, OwnedFd::from(file), 16000).unwrap();
//!
//! let buffer = server.create_buffer(pool, 0, 100, 40, 400, Fourcc::Argb8888).unwrap();
//! assert_eq!(server.buffer_data(buffer).unwrap().size(), 16000);
//! ```
//!
//! When a buffer's contents are needed, use
//! [`with_buffer_contents`](ServerState::with_buffer_contents). Reading is protected against
//! clients truncating the backing file behind the server's back by a SIGBUS handler. If you are
//! already using a handler for this signal, you probably don't want to use this module.

use std::{io, os::unix::io::OwnedFd, sync::Arc};

use indexmap::IndexSet;
use rustix::fs::FileType;
use tracing::{debug, trace, warn};

use crate::{
    server::{BufferId, ConnectionId, Event, PoolId, ServerState},
    utils::DeadResource,
};

mod pool;

pub(crate) use self::pool::Pool;

/// Pixel formats, as DRM fourcc codes
pub use drm_fourcc::DrmFourcc as Fourcc;

/// Size of a pixel in bytes for the packed formats this server knows about
///
/// Returns `None` for formats not in the table, stride validation then assumes a single byte per
/// pixel.
pub fn bytes_per_pixel(format: Fourcc) -> Option<u32> {
    use Fourcc::*;

    let bpp = match format {
        C8 | R8 | Rgb332 | Bgr233 => 1,
        Rgb565 | Bgr565 | R16 | Gr88 | Rg88 | Argb4444 | Xrgb4444 | Abgr4444 | Xbgr4444 | Argb1555
        | Xrgb1555 | Abgr1555 | Xbgr1555 => 2,
        Rgb888 | Bgr888 => 3,
        Argb8888 | Xrgb8888 | Abgr8888 | Xbgr8888 | Rgba8888 | Rgbx8888 | Bgra8888 | Bgrx8888
        | Argb2101010 | Xrgb2101010 | Abgr2101010 | Xbgr2101010 => 4,
        Abgr16161616f | Xbgr16161616f => 8,
        _ => return None,
    };
    Some(bpp)
}

/// Details of the contents of a buffer relative to its pool
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferData {
    /// Offset of the start of the buffer relative to the beginning of the pool in bytes
    pub offset: i32,
    /// Width of the buffer in pixels
    pub width: i32,
    /// Height of the buffer in pixels
    pub height: i32,
    /// Stride of the buffer in bytes
    pub stride: i32,
    /// Format used by this buffer
    pub format: Fourcc,
}

impl BufferData {
    /// Number of bytes of the pool covered by this buffer
    pub fn size(&self) -> usize {
        self.height as usize * self.stride as usize
    }
}

/// Where a buffer is in its ownership cycle
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferState {
    /// Not referenced by any surface
    Free,
    /// Referenced by the pending state of some surface
    Attached,
    /// Referenced by the current state of some surface, the compositor may read it
    Current,
    /// The compositor's claim ended, the client may reuse it
    Released,
}

/// A shared-memory pool
#[derive(Debug)]
pub struct ShmPool {
    pub(crate) pool: Pool,
    pub(crate) buffers: IndexSet<BufferId>,
}

/// A buffer carved out of a shared-memory pool
#[derive(Debug)]
pub struct ShmBuffer {
    pub(crate) pool: PoolId,
    pub(crate) data: BufferData,
    pub(crate) pending_refs: u32,
    pub(crate) current_refs: u32,
    pub(crate) released: bool,
}

impl ShmBuffer {
    /// Lifecycle state derived from the surfaces referencing this buffer
    pub fn state(&self) -> BufferState {
        if self.current_refs > 0 {
            BufferState::Current
        } else if self.pending_refs > 0 {
            BufferState::Attached
        } else if self.released {
            BufferState::Released
        } else {
            BufferState::Free
        }
    }
}

/// Errors of pool and buffer management
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// The file descriptor cannot back a pool
    #[error("file descriptor cannot back a shm pool")]
    InvalidFd,
    /// A pool needs a strictly positive size
    #[error("invalid pool size {0}")]
    InvalidSize(i32),
    /// Pools may only grow
    #[error("pool cannot be resized from {current} to {requested} bytes")]
    InvalidResize {
        /// Current size of the pool
        current: usize,
        /// Requested size
        requested: i32,
    },
    /// Mapping the pool memory failed
    #[error("failed to map pool memory")]
    MapError(#[source] io::Error),
    /// The buffer offset lies outside of the pool
    #[error("invalid buffer offset {0}")]
    InvalidOffset(i32),
    /// Width and height must be strictly positive
    #[error("invalid buffer dimensions {width}x{height}")]
    InvalidDimensions {
        /// Requested width
        width: i32,
        /// Requested height
        height: i32,
    },
    /// The stride cannot hold a row of pixels
    #[error("stride {stride} too small for width {width} in {format}")]
    InvalidStride {
        /// Requested stride
        stride: i32,
        /// Requested width
        width: i32,
        /// Requested format
        format: Fourcc,
    },
    /// The buffer would extend past the end of the pool
    #[error("buffer of {size} bytes at offset {offset} exceeds pool of {pool_size} bytes")]
    OutOfBounds {
        /// Requested offset
        offset: i32,
        /// `height * stride`
        size: i64,
        /// Size of the pool
        pool_size: usize,
    },
    /// The format is not supported by this server
    #[error("format {0} is not supported")]
    UnsupportedFormat(Fourcc),
    /// The pool or buffer is gone
    #[error(transparent)]
    Dead(#[from] DeadResource),
}

/// Error that can occur when accessing an SHM buffer
#[derive(Debug, thiserror::Error)]
pub enum BufferAccessError {
    /// The buffer is gone
    #[error("the buffer is no longer alive")]
    Dead,
    /// An error occurred while accessing the memory map
    ///
    /// This can happen if the client advertised a wrong size for the memory map, or truncated
    /// its backing file afterwards. A [`Event::BufferAccessFailed`] is queued for the client.
    #[error("the buffer memory could not be read")]
    BadMap,
}

impl ServerState {
    /// Create a pool from a client-supplied file descriptor
    ///
    /// The descriptor must refer to a regular (or shared-memory) file. On any failure it is
    /// closed and nothing is registered.
    pub fn create_pool(&mut self, connection: ConnectionId, fd: OwnedFd, size: i32) -> Result<PoolId, ShmError> {
        self.connection(connection)?;

        match rustix::fs::fstat(&fd) {
            Ok(stat) if FileType::from_raw_mode(stat.st_mode) == FileType::RegularFile => {}
            Ok(_) => {
                debug!(%connection, "Rejecting shm pool fd that is not a regular file");
                return Err(ShmError::InvalidFd);
            }
            Err(err) => {
                debug!(%connection, ?err, "Rejecting shm pool fd that cannot be stat'ed");
                return Err(ShmError::InvalidFd);
            }
        }
        if size <= 0 {
            return Err(ShmError::InvalidSize(size));
        }

        let pool = Pool::new(fd, size as usize).map_err(ShmError::MapError)?;

        let conn = self.connection_mut(connection)?;
        let id = PoolId::from_parts(connection, conn.next_index());
        conn.pools.insert(
            id,
            ShmPool {
                pool,
                buffers: IndexSet::new(),
            },
        );
        debug!(pool = %id, size, "Shm pool created");
        Ok(id)
    }

    /// Grow a pool
    ///
    /// The new mapping is established before the old one is released, so a failure leaves the
    /// pool exactly as it was. Offsets of live buffers stay valid.
    pub fn resize_pool(&mut self, pool: PoolId, new_size: i32) -> Result<(), ShmError> {
        let shm_pool = self.shm_pool_mut(pool)?;
        let current = shm_pool.pool.size();
        if new_size <= 0 || new_size as usize <= current {
            return Err(ShmError::InvalidResize {
                current,
                requested: new_size,
            });
        }
        shm_pool
            .pool
            .resize(new_size as usize)
            .map_err(ShmError::MapError)?;
        trace!(%pool, new_size, "Shm pool resized");
        Ok(())
    }

    /// Carve a buffer out of a pool
    ///
    /// Checks run in a fixed order and the first failure is reported; nothing is allocated
    /// unless all of them pass.
    pub fn create_buffer(
        &mut self,
        pool: PoolId,
        offset: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: Fourcc,
    ) -> Result<BufferId, ShmError> {
        let supported = self.shm_formats.contains(&format);
        let pool_size = self.shm_pool(pool)?.pool.size();

        if offset < 0 || offset as usize >= pool_size {
            return Err(ShmError::InvalidOffset(offset));
        }
        if width <= 0 || height <= 0 {
            return Err(ShmError::InvalidDimensions { width, height });
        }
        let bpp = bytes_per_pixel(format).unwrap_or(1) as i64;
        if (stride as i64) < width as i64 * bpp {
            return Err(ShmError::InvalidStride { stride, width, format });
        }
        let size = height as i64 * stride as i64;
        if offset as i64 + size > pool_size as i64 {
            return Err(ShmError::OutOfBounds {
                offset,
                size,
                pool_size,
            });
        }
        if !supported {
            return Err(ShmError::UnsupportedFormat(format));
        }

        let conn = self.connection_mut(pool.connection)?;
        let id = BufferId::from_parts(pool.connection, conn.next_index());
        let data = BufferData {
            offset,
            width,
            height,
            stride,
            format,
        };
        conn.buffers.insert(
            id,
            ShmBuffer {
                pool,
                data,
                pending_refs: 0,
                current_refs: 0,
                released: false,
            },
        );
        if let Some(shm_pool) = conn.pools.get_mut(&pool) {
            shm_pool.buffers.insert(id);
        }
        trace!(buffer = %id, %pool, ?data, "Shm buffer created");
        Ok(id)
    }

    /// Destroy a pool, along with every buffer still carved out of it
    ///
    /// Surfaces referencing one of those buffers keep a handle that no longer resolves.
    pub fn destroy_pool(&mut self, pool: PoolId) {
        let buffers = match self.shm_pool(pool) {
            Ok(shm_pool) => shm_pool.buffers.iter().copied().collect::<Vec<_>>(),
            Err(_) => return,
        };
        for buffer in buffers {
            self.destroy_buffer(buffer);
        }
        if let Ok(conn) = self.connection_mut(pool.connection) {
            // unmaps the memory, the fd closes once the last exported metadata is gone
            conn.pools.shift_remove(&pool);
        }
        debug!(%pool, "Shm pool destroyed");
    }

    /// Destroy a buffer, the memory of its pool is left untouched
    pub fn destroy_buffer(&mut self, buffer: BufferId) {
        let Ok(conn) = self.connection_mut(buffer.connection) else {
            return;
        };
        let Some(shm_buffer) = conn.buffers.shift_remove(&buffer) else {
            return;
        };
        if let Some(shm_pool) = conn.pools.get_mut(&shm_buffer.pool) {
            shm_pool.buffers.shift_remove(&buffer);
        }
        trace!(%buffer, state = ?shm_buffer.state(), "Shm buffer destroyed");
    }

    /// Geometry of a live buffer
    pub fn buffer_data(&self, buffer: BufferId) -> Option<BufferData> {
        self.shm_buffer(buffer).ok().map(|b| b.data)
    }

    /// Lifecycle state of a live buffer
    pub fn buffer_state(&self, buffer: BufferId) -> Option<BufferState> {
        self.shm_buffer(buffer).ok().map(ShmBuffer::state)
    }

    /// Pool a live buffer was carved from
    pub fn buffer_pool(&self, buffer: BufferId) -> Option<PoolId> {
        self.shm_buffer(buffer).ok().map(|b| b.pool)
    }

    /// Current size of a live pool in bytes
    pub fn pool_size(&self, pool: PoolId) -> Option<usize> {
        self.shm_pool(pool).ok().map(|p| p.pool.size())
    }

    /// Live buffers of a pool, in creation order
    pub fn pool_buffers(&self, pool: PoolId) -> Option<Vec<BufferId>> {
        self.shm_pool(pool)
            .ok()
            .map(|p| p.buffers.iter().copied().collect())
    }

    /// Call given closure with the contents of the given buffer
    ///
    /// The closure receives the bytes covered by the buffer (`height * stride` bytes starting at
    /// its offset) along with its geometry.
    pub fn with_buffer_contents<F, T>(&mut self, buffer: BufferId, f: F) -> Result<T, BufferAccessError>
    where
        F: FnOnce(&[u8], BufferData) -> T,
    {
        let shm_buffer = self.shm_buffer(buffer).map_err(|_| BufferAccessError::Dead)?;
        let data = shm_buffer.data;
        let shm_pool = self
            .shm_pool(shm_buffer.pool)
            .map_err(|_| BufferAccessError::Dead)?;

        let range = data.offset as usize..data.offset as usize + data.size();
        let result = shm_pool
            .pool
            .with_data_slice(|slice| slice.get(range).map(|bytes| f(bytes, data)));

        match result {
            Ok(Some(t)) => Ok(t),
            Ok(None) | Err(()) => {
                warn!(%buffer, "Client provided a bad shm mapping");
                self.push_event(buffer.connection, Event::BufferAccessFailed { buffer });
                Err(BufferAccessError::BadMap)
            }
        }
    }

    pub(crate) fn shm_pool(&self, pool: PoolId) -> Result<&ShmPool, DeadResource> {
        self.connection(pool.connection)?
            .pools
            .get(&pool)
            .ok_or(DeadResource)
    }

    pub(crate) fn shm_pool_mut(&mut self, pool: PoolId) -> Result<&mut ShmPool, DeadResource> {
        self.connection_mut(pool.connection)?
            .pools
            .get_mut(&pool)
            .ok_or(DeadResource)
    }

    pub(crate) fn shm_buffer(&self, buffer: BufferId) -> Result<&ShmBuffer, DeadResource> {
        self.connection(buffer.connection)?
            .buffers
            .get(&buffer)
            .ok_or(DeadResource)
    }

    pub(crate) fn shm_buffer_mut(&mut self, buffer: BufferId) -> Result<&mut ShmBuffer, DeadResource> {
        self.connection_mut(buffer.connection)?
            .buffers
            .get_mut(&buffer)
            .ok_or(DeadResource)
    }

    /// Shared descriptor backing a live pool
    pub(crate) fn pool_fd(&self, pool: PoolId) -> Option<Arc<OwnedFd>> {
        self.shm_pool(pool).ok().map(|p| p.pool.fd().clone())
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, os::unix::io::OwnedFd};

    use super::*;
    use crate::server::ServerConfig;

    fn pool_fd(len: usize) -> OwnedFd {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![0u8; len]).unwrap();
        OwnedFd::from(file)
    }

    fn server_with_pool(size: i32) -> (ServerState, PoolId) {
        let mut server = ServerState::new(ServerConfig::default());
        let client = server.connect();
        let pool = server.create_pool(client, pool_fd(size as usize), size).unwrap();
        (server, pool)
    }

    #[test]
    fn create_pool_validates_fd_then_size() {
        let mut server = ServerState::new(ServerConfig::default());
        let client = server.connect();

        let (sock, _) = std::os::unix::net::UnixStream::pair().unwrap();
        assert!(matches!(
            server.create_pool(client, OwnedFd::from(sock), 64),
            Err(ShmError::InvalidFd)
        ));
        assert!(matches!(
            server.create_pool(client, pool_fd(64), 0),
            Err(ShmError::InvalidSize(0))
        ));
        assert!(matches!(
            server.create_pool(client, pool_fd(64), -4),
            Err(ShmError::InvalidSize(-4))
        ));
        assert_eq!(server.connection(client).unwrap().pools().count(), 0);
    }

    #[test]
    fn buffer_fitting_the_pool_exactly() {
        let (mut server, pool) = server_with_pool(16000);
        let buffer = server
            .create_buffer(pool, 0, 100, 40, 400, Fourcc::Argb8888)
            .unwrap();
        assert_eq!(server.buffer_data(buffer).unwrap().size(), 16000);
        assert_eq!(server.buffer_state(buffer), Some(BufferState::Free));
        assert_eq!(server.pool_buffers(pool), Some(vec![buffer]));
    }

    #[test]
    fn each_violated_clause_has_its_error() {
        let (mut server, pool) = server_with_pool(16000);

        assert!(matches!(
            server.create_buffer(pool, -1, 100, 40, 400, Fourcc::Argb8888),
            Err(ShmError::InvalidOffset(-1))
        ));
        assert!(matches!(
            server.create_buffer(pool, 16000, 1, 1, 4, Fourcc::Argb8888),
            Err(ShmError::InvalidOffset(16000))
        ));
        assert!(matches!(
            server.create_buffer(pool, 0, 0, 40, 400, Fourcc::Argb8888),
            Err(ShmError::InvalidDimensions { .. })
        ));
        assert!(matches!(
            server.create_buffer(pool, 0, 100, -1, 400, Fourcc::Argb8888),
            Err(ShmError::InvalidDimensions { .. })
        ));
        assert!(matches!(
            server.create_buffer(pool, 0, 100, 40, 399, Fourcc::Argb8888),
            Err(ShmError::InvalidStride { stride: 399, .. })
        ));
        assert!(matches!(
            server.create_buffer(pool, 4, 100, 40, 400, Fourcc::Argb8888),
            Err(ShmError::OutOfBounds { .. })
        ));
        assert!(matches!(
            server.create_buffer(pool, 0, 100, 40, 400, Fourcc::Abgr8888),
            Err(ShmError::UnsupportedFormat(Fourcc::Abgr8888))
        ));

        assert_eq!(server.pool_buffers(pool), Some(Vec::new()));
    }

    #[test]
    fn first_failing_check_wins() {
        let (mut server, pool) = server_with_pool(100);
        // bad offset, dimensions, stride, bounds and format all at once
        assert!(matches!(
            server.create_buffer(pool, 100, 0, 0, 0, Fourcc::Nv12),
            Err(ShmError::InvalidOffset(100))
        ));
        // bad stride, bounds and format
        assert!(matches!(
            server.create_buffer(pool, 0, 10, 100, 1, Fourcc::Nv12),
            Err(ShmError::InvalidStride { .. })
        ));
        // unknown pixel size counts as one byte, bounds still checked before the format
        assert!(matches!(
            server.create_buffer(pool, 0, 10, 100, 10, Fourcc::Nv12),
            Err(ShmError::OutOfBounds { .. })
        ));
        assert!(matches!(
            server.create_buffer(pool, 0, 10, 10, 10, Fourcc::Nv12),
            Err(ShmError::UnsupportedFormat(Fourcc::Nv12))
        ));
    }

    #[test]
    fn bounds_check_cannot_overflow() {
        let (mut server, pool) = server_with_pool(4096);
        assert!(matches!(
            server.create_buffer(pool, 4095, i32::MAX / 4, i32::MAX, i32::MAX, Fourcc::Argb8888),
            Err(ShmError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn pools_only_grow() {
        let (mut server, pool) = server_with_pool(4096);
        assert!(matches!(
            server.resize_pool(pool, 4096),
            Err(ShmError::InvalidResize { current: 4096, .. })
        ));
        assert!(matches!(
            server.resize_pool(pool, 1024),
            Err(ShmError::InvalidResize { .. })
        ));
        assert_eq!(server.pool_size(pool), Some(4096));

        server.resize_pool(pool, 8192).unwrap();
        assert_eq!(server.pool_size(pool), Some(8192));
        server
            .create_buffer(pool, 4096, 32, 32, 128, Fourcc::Xrgb8888)
            .unwrap();
    }

    #[test]
    fn destroying_a_pool_destroys_its_buffers() {
        let (mut server, pool) = server_with_pool(8192);
        let a = server.create_buffer(pool, 0, 16, 16, 64, Fourcc::Argb8888).unwrap();
        let b = server
            .create_buffer(pool, 4096, 16, 16, 64, Fourcc::Argb8888)
            .unwrap();

        server.destroy_buffer(a);
        assert_eq!(server.pool_buffers(pool), Some(vec![b]));

        server.destroy_pool(pool);
        assert!(server.buffer_data(b).is_none());
        assert!(server.pool_size(pool).is_none());
        assert_eq!(server.connection(pool.connection()).unwrap().buffers().count(), 0);

        assert!(matches!(
            server.create_buffer(pool, 0, 1, 1, 4, Fourcc::Argb8888),
            Err(ShmError::Dead(_))
        ));
    }

    #[test]
    fn read_buffer_contents() {
        let mut server = ServerState::new(ServerConfig::default());
        let client = server.connect();
        let mut file = tempfile::tempfile().unwrap();
        let mut bytes = vec![0u8; 64];
        bytes[32..48].copy_from_slice(&[7u8; 16]);
        file.write_all(&bytes).unwrap();
        let pool = server.create_pool(client, OwnedFd::from(file), 64).unwrap();
        let buffer = server
            .create_buffer(pool, 32, 2, 2, 8, Fourcc::Argb8888)
            .unwrap();

        let contents = server
            .with_buffer_contents(buffer, |slice, data| {
                assert_eq!(data.width, 2);
                slice.to_vec()
            })
            .unwrap();
        assert_eq!(contents, vec![7u8; 16]);

        server.destroy_buffer(buffer);
        assert!(matches!(
            server.with_buffer_contents(buffer, |_, _| ()),
            Err(BufferAccessError::Dead)
        ));
    }

    #[test]
    fn unknown_formats_have_no_pixel_size() {
        assert_eq!(bytes_per_pixel(Fourcc::Argb8888), Some(4));
        assert_eq!(bytes_per_pixel(Fourcc::Rgb565), Some(2));
        assert_eq!(bytes_per_pixel(Fourcc::Nv12), None);
    }
}
