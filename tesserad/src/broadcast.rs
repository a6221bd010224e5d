//! Streams committed buffers to TCP peers
//!
//! Runs on its own thread with its own event loop, fed by a broadcast subscription of the
//! server. Every snapshot is encoded as one frame and written to every connected peer; peers
//! failing a write, or not taking a frame within [`PEER_WRITE_TIMEOUT`], are dropped. While
//! the thread is busy writing, the server keeps a bounded backlog and drops further frames.

use std::{
    io::{self, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use tessera::{
    export::{encode_snapshot, BufferSnapshot},
    reexports::calloop::{
        channel::{Channel, Event},
        generic::Generic,
        EventLoop, Interest, LoopSignal, Mode, PostAction,
    },
};
use tracing::{debug, info, warn};

/// How long a peer may take to accept one frame
pub const PEER_WRITE_TIMEOUT: Duration = Duration::from_millis(250);

struct Broadcaster {
    peers: Vec<(SocketAddr, TcpStream)>,
    signal: LoopSignal,
}

impl Broadcaster {
    fn send(&mut self, snapshot: &BufferSnapshot) {
        let frame = encode_snapshot(snapshot);
        self.peers.retain_mut(|(addr, stream)| match stream.write_all(&frame) {
            Ok(()) => true,
            Err(err) => {
                debug!(%addr, %err, "Dropping broadcast peer");
                false
            }
        });
    }
}

/// Bind `addr` and spawn the broadcasting thread
pub fn spawn(addr: SocketAddr, snapshots: Channel<Arc<BufferSnapshot>>) -> io::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    info!(addr = %listener.local_addr()?, "Broadcasting committed buffers");

    thread::Builder::new()
        .name("tesserad-broadcast".into())
        .spawn(move || {
            if let Err(err) = run(listener, snapshots) {
                warn!(%err, "Broadcaster stopped");
            }
        })
}

fn run(listener: TcpListener, snapshots: Channel<Arc<BufferSnapshot>>) -> Result<(), Box<dyn std::error::Error>> {
    let mut event_loop: EventLoop<'_, Broadcaster> = EventLoop::try_new()?;
    let handle = event_loop.handle();

    handle.insert_source(
        Generic::new(listener, Interest::READ, Mode::Level),
        |_, listener, broadcaster| {
            loop {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        if let Err(err) = stream.set_write_timeout(Some(PEER_WRITE_TIMEOUT)) {
                            warn!(%addr, %err, "Refusing broadcast peer");
                            continue;
                        }
                        debug!(%addr, "Broadcast peer connected");
                        broadcaster.peers.push((addr, stream));
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => return Err(err),
                }
            }
            Ok(PostAction::Continue)
        },
    )
    .map_err(|err| err.error)?;

    handle.insert_source(snapshots, |event, _, broadcaster| match event {
        Event::Msg(snapshot) => broadcaster.send(&snapshot),
        Event::Closed => broadcaster.signal.stop(),
    })
    .map_err(|err| err.error)?;

    let mut broadcaster = Broadcaster {
        peers: Vec::new(),
        signal: event_loop.get_signal(),
    };
    event_loop.run(None, &mut broadcaster, |_| {})?;
    Ok(())
}
