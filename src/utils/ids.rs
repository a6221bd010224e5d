/// Generates a copyable handle type addressing an object inside one client connection.
///
/// Handles carry the connection they were created on plus an index that is never reused within
/// that connection, so a stale handle simply stops resolving once its object is gone.
macro_rules! connection_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            pub(crate) connection: $crate::server::ConnectionId,
            pub(crate) index: u32,
        }

        impl $name {
            /// The connection this object belongs to
            #[inline]
            pub fn connection(&self) -> $crate::server::ConnectionId {
                self.connection
            }

            #[inline]
            pub(crate) fn from_parts(connection: $crate::server::ConnectionId, index: u32) -> Self {
                $name { connection, index }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}@{}#{}", stringify!($name), self.connection.0, self.index)
            }
        }
    };
}

pub(crate) use connection_handle;
