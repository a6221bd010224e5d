//! Listening socket for new clients
//!
//! [`ClientListener`] is a [`calloop`] event source yielding one [`UnixStream`] per accepted
//! connection. Insert it into your event loop and hand each stream to
//! [`DisplayHandle::insert_client`](wayland_server::DisplayHandle::insert_client), along with the
//! data from [`FrontendState::new_client`](super::FrontendState::new_client).

use std::{ffi::OsStr, io, os::unix::net::UnixStream};

use calloop::{generic::Generic, EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use tracing::{debug, info};
use wayland_server::{BindError, ListeningSocket};

/// A listening socket event source
#[derive(Debug)]
pub struct ClientListener {
    socket: Generic<ListeningSocket>,
}

impl ClientListener {
    /// Bind the first free `wayland-N` socket in the runtime directory, with `N` from 1 to 32
    ///
    /// `wayland-0` is skipped, clients falling back to it would end up on another server.
    pub fn new_auto() -> Result<ClientListener, BindError> {
        let socket = ListeningSocket::bind_auto("wayland", 1..33)?;
        Ok(ClientListener::from_socket(socket))
    }

    /// Bind a socket with the given name in the runtime directory
    pub fn with_name(name: &str) -> Result<ClientListener, BindError> {
        let socket = ListeningSocket::bind(name)?;
        Ok(ClientListener::from_socket(socket))
    }

    fn from_socket(socket: ListeningSocket) -> ClientListener {
        info!(name = ?socket.socket_name(), "Listening for clients");
        ClientListener {
            socket: Generic::new(socket, Interest::READ, Mode::Level),
        }
    }

    /// Name of the socket, to be exported as `WAYLAND_DISPLAY`
    pub fn socket_name(&self) -> Option<&OsStr> {
        self.socket.get_ref().socket_name()
    }
}

impl EventSource for ClientListener {
    type Event = UnixStream;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(&mut self, readiness: Readiness, token: Token, mut callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        self.socket.process_events(readiness, token, |_, socket| {
            while let Some(stream) = socket.accept()? {
                debug!(socket = ?socket.socket_name(), "Client connected");
                callback(stream, &mut ());
            }
            Ok(PostAction::Continue)
        })
    }

    fn register(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.socket.register(poll, token_factory)
    }

    fn reregister(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.socket.reregister(poll, token_factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.socket.unregister(poll)
    }
}
