use std::{
    fs::File,
    io::Write,
    os::unix::{io::AsFd, net::UnixStream},
    sync::Arc,
};

use wayland_client::{
    protocol::{wl_buffer, wl_callback, wl_compositor, wl_registry, wl_shm as client_shm, wl_shm_pool, wl_surface},
    Connection, EventQueue, Proxy, QueueHandle, WEnum,
};
use wayland_protocols::xdg::shell::client::{xdg_popup, xdg_positioner, xdg_surface, xdg_toplevel, xdg_wm_base};
use wayland_server::{backend::ClientData, Display};

use super::{format_from_wire, format_to_wire, wl_shm, FrontendState, ServerHandler};
use crate::{
    server::{ServerConfig, ServerState, SurfaceId, ToplevelId},
    shm::Fourcc,
};

struct Compositor {
    frontend: FrontendState,
    commits: Vec<SurfaceId>,
    toplevels: Vec<ToplevelId>,
}

impl ServerHandler for Compositor {
    fn frontend_state(&mut self) -> &mut FrontendState {
        &mut self.frontend
    }

    fn commit(&mut self, surface: SurfaceId) {
        self.commits.push(surface);
    }

    fn new_toplevel(&mut self, toplevel: ToplevelId) {
        self.toplevels.push(toplevel);
    }
}

crate::delegate_frontend!(Compositor);

#[derive(Debug, Default)]
struct TestClient {
    globals: Vec<(u32, String, u32)>,
    formats: Vec<client_shm::Format>,
    configures: Vec<(i32, i32)>,
    serials: Vec<u32>,
    released: usize,
    frames: Vec<u32>,
    popup_done: bool,
}

impl wayland_client::Dispatch<wl_registry::WlRegistry, ()> for TestClient {
    fn event(
        state: &mut Self,
        _: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_registry::Event::Global {
            name,
            interface,
            version,
        } = event
        {
            state.globals.push((name, interface, version));
        }
    }
}

impl wayland_client::Dispatch<client_shm::WlShm, ()> for TestClient {
    fn event(
        state: &mut Self,
        _: &client_shm::WlShm,
        event: client_shm::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let client_shm::Event::Format {
            format: WEnum::Value(format),
        } = event
        {
            state.formats.push(format);
        }
    }
}

impl wayland_client::Dispatch<wl_buffer::WlBuffer, ()> for TestClient {
    fn event(
        state: &mut Self,
        _: &wl_buffer::WlBuffer,
        event: wl_buffer::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            state.released += 1;
        }
    }
}

impl wayland_client::Dispatch<wl_callback::WlCallback, ()> for TestClient {
    fn event(
        state: &mut Self,
        _: &wl_callback::WlCallback,
        event: wl_callback::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_callback::Event::Done { callback_data } = event {
            state.frames.push(callback_data);
        }
    }
}

impl wayland_client::Dispatch<xdg_wm_base::XdgWmBase, ()> for TestClient {
    fn event(
        _: &mut Self,
        wm_base: &xdg_wm_base::XdgWmBase,
        event: xdg_wm_base::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            wm_base.pong(serial);
        }
    }
}

impl wayland_client::Dispatch<xdg_surface::XdgSurface, ()> for TestClient {
    fn event(
        state: &mut Self,
        xdg_surface: &xdg_surface::XdgSurface,
        event: xdg_surface::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            state.serials.push(serial);
            xdg_surface.ack_configure(serial);
        }
    }
}

impl wayland_client::Dispatch<xdg_toplevel::XdgToplevel, ()> for TestClient {
    fn event(
        state: &mut Self,
        _: &xdg_toplevel::XdgToplevel,
        event: xdg_toplevel::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_toplevel::Event::Configure { width, height, .. } = event {
            state.configures.push((width, height));
        }
    }
}

impl wayland_client::Dispatch<xdg_popup::XdgPopup, ()> for TestClient {
    fn event(
        state: &mut Self,
        _: &xdg_popup::XdgPopup,
        event: xdg_popup::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_popup::Event::PopupDone = event {
            state.popup_done = true;
        }
    }
}

wayland_client::delegate_noop!(TestClient: ignore wl_compositor::WlCompositor);
wayland_client::delegate_noop!(TestClient: ignore wl_surface::WlSurface);
wayland_client::delegate_noop!(TestClient: ignore wl_shm_pool::WlShmPool);
wayland_client::delegate_noop!(TestClient: ignore xdg_positioner::XdgPositioner);

/// Client data of a client the frontend did not open a connection for
struct Stranger;

impl ClientData for Stranger {}

/// One server with a single client talking to it over a socket pair
struct Fixture {
    display: Display<Compositor>,
    state: Compositor,
    conn: Connection,
    queue: EventQueue<TestClient>,
    registry: wl_registry::WlRegistry,
    client: TestClient,
    files: Vec<File>,
}

impl Fixture {
    fn new() -> Fixture {
        Fixture::with_client_data(|frontend| Arc::new(frontend.new_client()) as Arc<dyn ClientData>)
    }

    fn with_client_data(data: impl FnOnce(&mut FrontendState) -> Arc<dyn ClientData>) -> Fixture {
        let display = Display::<Compositor>::new().unwrap();
        let server = ServerState::new(ServerConfig::default());
        let mut state = Compositor {
            frontend: FrontendState::new::<Compositor>(&display.handle(), server),
            commits: Vec::new(),
            toplevels: Vec::new(),
        };

        let (server_end, client_end) = UnixStream::pair().unwrap();
        server_end.set_nonblocking(true).unwrap();
        client_end.set_nonblocking(true).unwrap();
        display
            .handle()
            .insert_client(server_end, data(&mut state.frontend))
            .unwrap();

        let conn = Connection::from_socket(client_end).unwrap();
        let queue = conn.new_event_queue();
        let registry = conn.display().get_registry(&queue.handle(), ());

        let mut fixture = Fixture {
            display,
            state,
            conn,
            queue,
            registry,
            client: TestClient::default(),
            files: Vec::new(),
        };
        fixture.roundtrip();
        fixture
    }

    fn qh(&self) -> QueueHandle<TestClient> {
        self.queue.handle()
    }

    /// Send the client requests, let the server handle them and read its answers
    fn roundtrip(&mut self) {
        let _ = self.queue.flush();
        self.display.dispatch_clients(&mut self.state).unwrap();
        self.state.frontend.reap_disconnected();
        self.deliver();
    }

    /// Read whatever the server sent
    fn deliver(&mut self) {
        self.display.flush_clients().unwrap();
        if let Some(guard) = self.queue.prepare_read() {
            let _ = guard.read();
        }
        let _ = self.queue.dispatch_pending(&mut self.client);
    }

    fn bind<I>(&mut self) -> I
    where
        I: Proxy + 'static,
        TestClient: wayland_client::Dispatch<I, ()>,
    {
        let (name, version) = self
            .client
            .globals
            .iter()
            .find(|(_, interface, _)| interface == I::interface().name)
            .map(|(name, _, version)| (*name, *version))
            .unwrap();
        self.registry.bind::<I, _, _>(name, version, &self.qh(), ())
    }

    fn pool(&mut self, shm: &client_shm::WlShm, size: usize) -> wl_shm_pool::WlShmPool {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![0x40; size]).unwrap();
        let pool = shm.create_pool(file.as_fd(), size as i32, &self.qh(), ());
        self.files.push(file);
        pool
    }

    /// Code and interface of the error that killed the client
    fn protocol_error(&mut self) -> (u32, String) {
        // the server cleans up the killed client on its next dispatch
        self.roundtrip();
        let error = self.conn.protocol_error().unwrap();
        (error.code, error.object_interface)
    }
}

#[test]
fn one_global_per_capability() {
    let fixture = Fixture::new();
    let capabilities = fixture.state.frontend.server().registry().capabilities();
    assert_eq!(fixture.state.frontend.globals().len(), capabilities.len());
    assert_eq!(fixture.client.globals.len(), capabilities.len());
    for capability in capabilities {
        assert!(fixture
            .client
            .globals
            .iter()
            .any(|(_, interface, version)| interface == capability.name && *version <= capability.version));
    }
}

#[test]
fn queued_events_reach_the_client() {
    let mut f = Fixture::new();
    let compositor = f.bind::<wl_compositor::WlCompositor>();
    let shm = f.bind::<client_shm::WlShm>();
    let wm_base = f.bind::<xdg_wm_base::XdgWmBase>();
    f.roundtrip();
    assert_eq!(
        f.client.formats,
        vec![client_shm::Format::Argb8888, client_shm::Format::Xrgb8888]
    );

    let qh = f.qh();
    let surface = compositor.create_surface(&qh, ());
    let xdg_surface = wm_base.get_xdg_surface(&surface, &qh, ());
    let _toplevel = xdg_surface.get_toplevel(&qh, ());
    f.roundtrip();
    assert_eq!(f.state.toplevels.len(), 1);
    assert_eq!(f.client.configures, vec![(800, 600)]);
    assert_eq!(f.client.serials.len(), 1);

    let pool = f.pool(&shm, 2 * 4096);
    let first = pool.create_buffer(0, 32, 32, 128, client_shm::Format::Argb8888, &qh, ());
    let second = pool.create_buffer(4096, 32, 32, 128, client_shm::Format::Xrgb8888, &qh, ());
    surface.attach(Some(&first), 0, 0);
    surface.frame(&qh, ());
    surface.commit();
    f.roundtrip();
    assert_eq!(f.state.commits.len(), 1);
    let current = *f.state.frontend.server().surface_current(f.state.commits[0]).unwrap();
    assert_eq!((current.width, current.height), (32, 32));

    f.state.frontend.present(42);
    f.deliver();
    assert_eq!(f.client.frames, vec![42]);
    assert!(f.state.frontend.callbacks.is_empty());

    surface.attach(Some(&second), 0, 0);
    surface.commit();
    f.roundtrip();
    assert_eq!(f.client.released, 1);
    assert!(f.conn.protocol_error().is_none());
}

#[test]
fn pool_outlives_its_protocol_object() {
    let mut f = Fixture::new();
    let compositor = f.bind::<wl_compositor::WlCompositor>();
    let shm = f.bind::<client_shm::WlShm>();
    let qh = f.qh();

    let surface = compositor.create_surface(&qh, ());
    let pool = f.pool(&shm, 4096);
    let buffer = pool.create_buffer(0, 16, 16, 64, client_shm::Format::Argb8888, &qh, ());
    surface.attach(Some(&buffer), 0, 0);
    surface.commit();
    f.roundtrip();

    let server = f.state.frontend.server();
    let core_buffer = server.surface_current(f.state.commits[0]).unwrap().buffer.unwrap();
    let core_pool = server.buffer_pool(core_buffer).unwrap();

    pool.destroy();
    f.roundtrip();
    assert_eq!(f.state.frontend.server().pool_size(core_pool), Some(4096));
    assert!(f.state.frontend.server().buffer_data(core_buffer).is_some());

    buffer.destroy();
    f.roundtrip();
    assert!(f.state.frontend.server().pool_size(core_pool).is_none());
    assert!(f.state.frontend.pools.is_empty());
    assert!(f.state.frontend.buffers.is_empty());
}

#[test]
fn destroyed_surface_forgets_its_frame_callbacks() {
    let mut f = Fixture::new();
    let compositor = f.bind::<wl_compositor::WlCompositor>();
    let shm = f.bind::<client_shm::WlShm>();
    let qh = f.qh();

    let surface = compositor.create_surface(&qh, ());
    let pool = f.pool(&shm, 4096);
    let buffer = pool.create_buffer(0, 16, 16, 64, client_shm::Format::Argb8888, &qh, ());
    surface.attach(Some(&buffer), 0, 0);
    surface.frame(&qh, ());
    surface.commit();
    surface.frame(&qh, ());
    f.roundtrip();
    assert_eq!(f.state.frontend.callbacks.len(), 2);

    surface.destroy();
    f.roundtrip();
    assert!(f.state.frontend.callbacks.is_empty());

    f.state.frontend.present(16);
    f.deliver();
    assert!(f.client.frames.is_empty());
}

#[test]
fn attach_offset_on_recent_surface_is_a_protocol_error() {
    let mut f = Fixture::new();
    let compositor = f.bind::<wl_compositor::WlCompositor>();
    let surface = compositor.create_surface(&f.qh(), ());
    surface.attach(None, 3, 4);

    assert_eq!(
        f.protocol_error(),
        (wl_surface::Error::InvalidOffset as u32, "wl_surface".into())
    );
}

#[test]
fn zero_buffer_scale_is_a_protocol_error() {
    let mut f = Fixture::new();
    let compositor = f.bind::<wl_compositor::WlCompositor>();
    let surface = compositor.create_surface(&f.qh(), ());
    surface.set_buffer_scale(0);

    assert_eq!(
        f.protocol_error(),
        (wl_surface::Error::InvalidScale as u32, "wl_surface".into())
    );
}

#[test]
fn second_window_surface_is_a_role_error() {
    let mut f = Fixture::new();
    let compositor = f.bind::<wl_compositor::WlCompositor>();
    let wm_base = f.bind::<xdg_wm_base::XdgWmBase>();
    let qh = f.qh();
    let surface = compositor.create_surface(&qh, ());
    let _first = wm_base.get_xdg_surface(&surface, &qh, ());
    let _second = wm_base.get_xdg_surface(&surface, &qh, ());

    assert_eq!(
        f.protocol_error(),
        (xdg_wm_base::Error::Role as u32, "xdg_wm_base".into())
    );
}

#[test]
fn second_toplevel_is_already_constructed() {
    let mut f = Fixture::new();
    let compositor = f.bind::<wl_compositor::WlCompositor>();
    let wm_base = f.bind::<xdg_wm_base::XdgWmBase>();
    let qh = f.qh();
    let surface = compositor.create_surface(&qh, ());
    let xdg_surface = wm_base.get_xdg_surface(&surface, &qh, ());
    let _first = xdg_surface.get_toplevel(&qh, ());
    let _second = xdg_surface.get_toplevel(&qh, ());

    assert_eq!(
        f.protocol_error(),
        (xdg_surface::Error::AlreadyConstructed as u32, "xdg_surface".into())
    );
}

#[test]
fn popups_are_dismissed() {
    let mut f = Fixture::new();
    let compositor = f.bind::<wl_compositor::WlCompositor>();
    let wm_base = f.bind::<xdg_wm_base::XdgWmBase>();
    let qh = f.qh();
    let surface = compositor.create_surface(&qh, ());
    let xdg_surface = wm_base.get_xdg_surface(&surface, &qh, ());
    let positioner = wm_base.create_positioner(&qh, ());
    let _popup = xdg_surface.get_popup(None, &positioner, &qh, ());
    f.roundtrip();

    assert!(f.client.popup_done);
    assert!(f.conn.protocol_error().is_none());
}

#[test]
fn unmanaged_clients_are_refused() {
    let mut f = Fixture::with_client_data(|_| Arc::new(Stranger) as Arc<dyn ClientData>);
    assert!(!f.client.globals.is_empty());
    let _compositor = f.bind::<wl_compositor::WlCompositor>();

    assert_eq!(f.protocol_error(), (0, "wl_compositor".into()));
    assert_eq!(f.state.frontend.server().connections().count(), 0);
}

#[test]
fn disconnected_clients_are_reaped() {
    let mut f = Fixture::new();
    let shm = f.bind::<client_shm::WlShm>();
    let _pool = f.pool(&shm, 4096);
    f.roundtrip();
    assert_eq!(f.state.frontend.server().connections().count(), 1);
    assert_eq!(f.state.frontend.pools.len(), 1);

    let Fixture {
        mut display,
        mut state,
        conn,
        queue,
        ..
    } = f;
    drop((queue, conn));
    for _ in 0..2 {
        display.dispatch_clients(&mut state).unwrap();
        state.frontend.reap_disconnected();
    }

    assert_eq!(state.frontend.server().connections().count(), 0);
    assert!(state.frontend.pools.is_empty());
    assert!(state.frontend.shm_instances.is_empty());
}

#[test]
fn shm_formats_on_the_wire() {
    assert_eq!(format_to_wire(Fourcc::Argb8888), Some(wl_shm::Format::Argb8888));
    assert_eq!(format_to_wire(Fourcc::Xrgb8888), Some(wl_shm::Format::Xrgb8888));
    assert_eq!(format_to_wire(Fourcc::Abgr8888), Some(wl_shm::Format::Abgr8888));

    assert_eq!(format_from_wire(wl_shm::Format::Argb8888), Some(Fourcc::Argb8888));
    assert_eq!(format_from_wire(wl_shm::Format::Xrgb8888), Some(Fourcc::Xrgb8888));
    assert_eq!(format_from_wire(wl_shm::Format::Rgb565), Some(Fourcc::Rgb565));
}
