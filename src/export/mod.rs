//! Handing committed buffers to collaborators on other threads
//!
//! Collaborators never touch core state. Each commit that changes a surface's current buffer to
//! a live buffer produces:
//!
//! - a [`BufferMetadata`], stored in the shared [`MetadataView`] and sent to every metadata
//!   subscriber. It carries the backing file descriptor, so out-of-process consumers can map the
//!   pixels themselves;
//! - a [`BufferSnapshot`] with a copy of the pixel bytes, sent to broadcast subscribers, only
//!   built when at least one is registered.
//!
//! Subscriptions are [`calloop`] channels: the receiving end is an event source for the
//! collaborator's own event loop. Subscribers that went away are dropped on the next publish.
//! Broadcast channels are bounded to [`BROADCAST_BACKLOG`] snapshots: a subscriber lagging
//! further behind misses the frames committed in the meantime.
//!
//! ```
//! use tessera::server::{ServerConfig, ServerState};
//!
//! let mut server = ServerState::new(ServerConfig::default());
//! let view = server.export().view();
//! let metadata = server.export_mut().subscribe_metadata();
//! # drop((view, metadata));
//! ```

use std::{
    collections::HashMap,
    os::unix::io::OwnedFd,
    sync::{mpsc::TrySendError, Arc, Mutex, PoisonError},
};

use calloop::channel::{self, Channel, Sender, SyncSender};
use tracing::{debug, trace};

use crate::{
    server::{BufferId, ServerState, SurfaceId},
    shm::{BufferAccessError, Fourcc},
};

pub mod frame;

pub use self::frame::{decode_frame, encode_frame, encode_snapshot, BufferSnapshot, FrameError, FrameHeader};

/// Number of snapshots a broadcast subscriber may have queued before new ones are dropped
pub const BROADCAST_BACKLOG: usize = 4;

/// Type of the storage backing a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Client shared memory
    Shm,
}

impl BufferKind {
    /// Numeric tag of this kind on the wire
    pub fn tag(&self) -> u32 {
        match self {
            BufferKind::Shm => 1,
        }
    }

    /// Kind from its numeric tag
    pub fn from_tag(tag: u32) -> Option<BufferKind> {
        match tag {
            1 => Some(BufferKind::Shm),
            _ => None,
        }
    }
}

/// Metadata of a freshly committed buffer
#[derive(Debug, Clone)]
pub struct BufferMetadata {
    /// Surface the buffer was committed to
    pub surface: SurfaceId,
    /// The committed buffer
    pub buffer: BufferId,
    /// Width in pixels
    pub width: i32,
    /// Height in pixels
    pub height: i32,
    /// Stride in bytes
    pub stride: i32,
    /// Offset of the buffer inside its backing storage
    pub offset: i32,
    /// Pixel format
    pub format: Fourcc,
    /// Descriptor of the backing storage, shared with the pool
    pub fd: Arc<OwnedFd>,
    /// Type of the backing storage
    pub kind: BufferKind,
}

/// Latest metadata per surface, readable from any thread
#[derive(Debug, Clone, Default)]
pub struct MetadataView(Arc<Mutex<HashMap<SurfaceId, BufferMetadata>>>);

impl MetadataView {
    /// Metadata of the buffer last committed to a surface
    pub fn get(&self, surface: SurfaceId) -> Option<BufferMetadata> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&surface)
            .cloned()
    }

    /// Metadata of every surface with a committed buffer
    pub fn snapshot(&self) -> Vec<BufferMetadata> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Number of surfaces with published metadata
    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is published
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, metadata: BufferMetadata) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(metadata.surface, metadata);
    }

    fn remove(&self, surface: SurfaceId) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&surface);
    }
}

/// Registrations of the export collaborators
pub struct ExportRegistry {
    view: MetadataView,
    metadata_subscribers: Vec<Sender<BufferMetadata>>,
    broadcast_subscribers: Vec<SyncSender<Arc<BufferSnapshot>>>,
}

impl std::fmt::Debug for ExportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportRegistry")
            .field("view", &self.view)
            .field("metadata_subscribers", &self.metadata_subscribers.len())
            .field("broadcast_subscribers", &self.broadcast_subscribers.len())
            .finish()
    }
}

impl Default for ExportRegistry {
    fn default() -> Self {
        ExportRegistry::new()
    }
}

impl ExportRegistry {
    /// Registry without subscribers
    pub fn new() -> ExportRegistry {
        ExportRegistry {
            view: MetadataView::default(),
            metadata_subscribers: Vec::new(),
            broadcast_subscribers: Vec::new(),
        }
    }

    /// A handle to the shared metadata view
    pub fn view(&self) -> MetadataView {
        self.view.clone()
    }

    /// Receive the metadata of every buffer commit
    pub fn subscribe_metadata(&mut self) -> Channel<BufferMetadata> {
        let (sender, channel) = channel::channel();
        self.metadata_subscribers.push(sender);
        debug!("Metadata subscriber registered");
        channel
    }

    /// Receive a snapshot of the contents of every buffer commit
    ///
    /// At most [`BROADCAST_BACKLOG`] snapshots are queued, later ones are dropped until the
    /// subscriber catches up.
    pub fn subscribe_broadcast(&mut self) -> Channel<Arc<BufferSnapshot>> {
        let (sender, channel) = channel::sync_channel(BROADCAST_BACKLOG);
        self.broadcast_subscribers.push(sender);
        debug!("Broadcast subscriber registered");
        channel
    }

    /// Whether some subscriber wants buffer contents
    pub fn wants_contents(&self) -> bool {
        !self.broadcast_subscribers.is_empty()
    }

    pub(crate) fn publish_metadata(&mut self, metadata: BufferMetadata) {
        self.view.insert(metadata.clone());
        self.metadata_subscribers
            .retain(|sender| sender.send(metadata.clone()).is_ok());
    }

    pub(crate) fn publish_snapshot(&mut self, snapshot: BufferSnapshot) {
        let snapshot = Arc::new(snapshot);
        self.broadcast_subscribers
            .retain(|sender| match sender.try_send(snapshot.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    trace!("Broadcast subscriber is lagging, snapshot dropped");
                    true
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("Broadcast subscriber went away");
                    false
                }
            });
    }

    pub(crate) fn forget_surface(&mut self, surface: SurfaceId) {
        self.view.remove(surface);
    }
}

impl ServerState {
    /// Copy the contents of a live buffer into a snapshot
    pub fn buffer_snapshot(&mut self, buffer: BufferId) -> Result<BufferSnapshot, BufferAccessError> {
        self.with_buffer_contents(buffer, |bytes, data| BufferSnapshot::from_shm(data, bytes))
    }

    pub(crate) fn publish_buffer(&mut self, surface: SurfaceId, buffer: BufferId) {
        let Ok(shm_buffer) = self.shm_buffer(buffer) else {
            return;
        };
        let (data, pool) = (shm_buffer.data, shm_buffer.pool);
        let Some(fd) = self.pool_fd(pool) else {
            return;
        };

        self.export.publish_metadata(BufferMetadata {
            surface,
            buffer,
            width: data.width,
            height: data.height,
            stride: data.stride,
            offset: data.offset,
            format: data.format,
            fd,
            kind: BufferKind::Shm,
        });
        trace!(%surface, %buffer, "Buffer metadata published");

        if self.export.wants_contents() {
            match self.buffer_snapshot(buffer) {
                Ok(snapshot) => self.export.publish_snapshot(snapshot),
                Err(err) => debug!(%buffer, %err, "Could not snapshot committed buffer"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, os::unix::io::OwnedFd};

    use calloop::{channel::Event as ChannelEvent, EventLoop};

    use super::*;
    use crate::{
        server::{ConnectionId, PoolId, ServerConfig},
        shm::Fourcc,
    };

    fn setup() -> (ServerState, ConnectionId, PoolId) {
        let mut server = ServerState::new(ServerConfig::default());
        let client = server.connect();
        let mut file = tempfile::tempfile().unwrap();
        let bytes: Vec<u8> = (0..64u8).collect();
        file.write_all(&bytes).unwrap();
        let pool = server.create_pool(client, OwnedFd::from(file), 64).unwrap();
        (server, client, pool)
    }

    #[test]
    fn commit_publishes_metadata_to_the_view() {
        let (mut server, client, pool) = setup();
        let view = server.export().view();
        let buffer = server.create_buffer(pool, 16, 2, 2, 8, Fourcc::Xrgb8888).unwrap();
        let surface = server.create_surface(client, 6).unwrap();

        server.attach(surface, Some(buffer), 0, 0).unwrap();
        assert!(view.get(surface).is_none());
        server.commit(surface).unwrap();

        let metadata = view.get(surface).unwrap();
        assert_eq!(metadata.buffer, buffer);
        assert_eq!((metadata.width, metadata.height, metadata.stride), (2, 2, 8));
        assert_eq!(metadata.offset, 16);
        assert_eq!(metadata.format, Fourcc::Xrgb8888);
        assert_eq!(metadata.kind, BufferKind::Shm);

        server.destroy_surface(surface);
        assert!(view.is_empty());
    }

    #[test]
    fn subscribers_receive_commits() {
        let (mut server, client, pool) = setup();
        let metadata = server.export_mut().subscribe_metadata();
        let broadcast = server.export_mut().subscribe_broadcast();
        assert!(server.export().wants_contents());

        let buffer = server.create_buffer(pool, 16, 2, 2, 8, Fourcc::Argb8888).unwrap();
        let surface = server.create_surface(client, 6).unwrap();
        server.attach(surface, Some(buffer), 0, 0).unwrap();
        server.commit(surface).unwrap();
        // no change of buffer, nothing published
        server.commit(surface).unwrap();

        let mut event_loop = EventLoop::<(Vec<BufferMetadata>, Vec<Arc<BufferSnapshot>>)>::try_new().unwrap();
        let handle = event_loop.handle();
        handle
            .insert_source(metadata, |event, _, state| {
                if let ChannelEvent::Msg(msg) = event {
                    state.0.push(msg);
                }
            })
            .unwrap();
        handle
            .insert_source(broadcast, |event, _, state| {
                if let ChannelEvent::Msg(msg) = event {
                    state.1.push(msg);
                }
            })
            .unwrap();

        let mut received = (Vec::new(), Vec::new());
        event_loop
            .dispatch(Some(std::time::Duration::ZERO), &mut received)
            .unwrap();

        assert_eq!(received.0.len(), 1);
        assert_eq!(received.0[0].surface, surface);
        assert_eq!(received.1.len(), 1);
        let snapshot = &received.1[0];
        assert_eq!(snapshot.size, 16);
        assert_eq!(snapshot.data, (16..32u8).collect::<Vec<_>>());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let (mut server, client, pool) = setup();
        drop(server.export_mut().subscribe_broadcast());

        let buffer = server.create_buffer(pool, 0, 2, 2, 8, Fourcc::Argb8888).unwrap();
        let surface = server.create_surface(client, 6).unwrap();
        server.attach(surface, Some(buffer), 0, 0).unwrap();
        server.commit(surface).unwrap();

        assert!(!server.export().wants_contents());
    }

    #[test]
    fn lagging_broadcast_subscriber_misses_frames() {
        let (mut server, client, pool) = setup();
        let broadcast = server.export_mut().subscribe_broadcast();

        let buffers = [
            server.create_buffer(pool, 0, 2, 2, 8, Fourcc::Argb8888).unwrap(),
            server.create_buffer(pool, 16, 2, 2, 8, Fourcc::Argb8888).unwrap(),
        ];
        let surface = server.create_surface(client, 6).unwrap();
        for i in 0..3 * BROADCAST_BACKLOG {
            server.attach(surface, Some(buffers[i % 2]), 0, 0).unwrap();
            server.commit(surface).unwrap();
        }
        assert!(server.export().wants_contents());

        let mut event_loop = EventLoop::<Vec<Arc<BufferSnapshot>>>::try_new().unwrap();
        event_loop
            .handle()
            .insert_source(broadcast, |event, _, received| {
                if let ChannelEvent::Msg(msg) = event {
                    received.push(msg);
                }
            })
            .unwrap();
        let mut received = Vec::new();
        event_loop
            .dispatch(Some(std::time::Duration::ZERO), &mut received)
            .unwrap();

        assert_eq!(received.len(), BROADCAST_BACKLOG);
        assert_eq!(received[0].data, (0..16u8).collect::<Vec<_>>());
    }
}
