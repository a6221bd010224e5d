use crate::{
    shm::Fourcc,
    utils::{Serial, Size},
};

use super::connection::{BufferId, CallbackId, InstanceId, ToplevelId, WindowSurfaceId};

/// A notification the core emits towards a client
///
/// Events are queued per connection in emission order and drained by the protocol frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A pixel format supported by a freshly bound shared-memory instance
    Format {
        /// The `wl_shm` instance being advertised to
        instance: InstanceId,
        /// The advertised format
        format: Fourcc,
    },
    /// The compositor no longer reads from this buffer
    BufferReleased {
        /// The released buffer
        buffer: BufferId,
    },
    /// A suggested configuration for a toplevel, to be acknowledged with the serial
    Configure {
        /// The window surface the configure sequence belongs to
        window_surface: WindowSurfaceId,
        /// The toplevel being configured
        toplevel: ToplevelId,
        /// Suggested size, `0x0` lets the client decide
        size: Size,
        /// Serial to pass back in `ack_configure`
        serial: Serial,
    },
    /// A frame callback fired after presentation
    FrameDone {
        /// The fired callback
        callback: CallbackId,
        /// Presentation timestamp in milliseconds
        time: u32,
    },
    /// Reading the buffer contents faulted, the backing storage was truncated by the client
    BufferAccessFailed {
        /// The faulty buffer
        buffer: BufferId,
    },
}
