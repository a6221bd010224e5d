//! Reexports of crates, that are part of the public api, for convenience

pub use calloop;
pub use drm_fourcc;
#[cfg(feature = "wayland_frontend")]
pub use wayland_protocols;
#[cfg(feature = "wayland_frontend")]
pub use wayland_server;
