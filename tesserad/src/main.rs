use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use clap::Parser;
use tessera::{
    reexports::{
        calloop::{
            generic::Generic,
            timer::{TimeoutAction, Timer},
            EventLoop, Interest, Mode, PostAction,
        },
        wayland_server::Display,
    },
    server::{ServerConfig, ServerState},
    wayland::{socket::ClientListener, FrontendState},
};
use tracing::{error, info, warn};

mod broadcast;
mod cli;
mod state;

use state::Tesserad;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().init();
    }

    let cli = cli::Cli::parse();

    let mut event_loop: EventLoop<'_, Tesserad> = EventLoop::try_new()?;
    let display: Display<Tesserad> = Display::new()?;
    let display_handle = display.handle();

    let mut shm_formats = ServerConfig::default().shm_formats;
    shm_formats.extend(cli.formats.iter().copied());
    let mut server = ServerState::new(ServerConfig {
        shm_formats,
        default_window_size: cli.default_size,
    });

    let _broadcaster = match cli.broadcast {
        Some(addr) => Some(broadcast::spawn(addr, server.export_mut().subscribe_broadcast())?),
        None => None,
    };

    let frontend = FrontendState::new::<Tesserad>(&display_handle, server);
    let mut state = Tesserad {
        start_time: Instant::now(),
        display_handle,
        frontend,
    };

    let listener = match &cli.socket {
        Some(name) => ClientListener::with_name(name)?,
        None => ClientListener::new_auto()?,
    };
    let socket_name = listener.socket_name().map(|name| name.to_os_string());
    let loop_handle = event_loop.handle();

    loop_handle.insert_source(listener, |stream, _, state| {
        let client_data = state.frontend.new_client();
        if let Err(err) = state.display_handle.insert_client(stream, Arc::new(client_data)) {
            warn!(%err, "Failed to insert client");
        }
    })
    .map_err(|err| err.error)?;

    loop_handle.insert_source(
        Generic::new(display, Interest::READ, Mode::Level),
        |_, display, state| {
            // Safety: the display is never dropped while the source is registered
            unsafe {
                display.get_mut().dispatch_clients(state)?;
            }
            state.frontend.reap_disconnected();
            Ok(PostAction::Continue)
        },
    )
    .map_err(|err| err.error)?;

    let frame_interval = Duration::from_millis(cli.frame_interval.max(1));
    loop_handle.insert_source(Timer::from_duration(frame_interval), move |_, _, state| {
        let time = state.clock();
        state.frontend.present(time);
        TimeoutAction::ToDuration(frame_interval)
    })
    .map_err(|err| err.error)?;

    if let Some(name) = &socket_name {
        std::env::set_var("WAYLAND_DISPLAY", name);
        info!(socket = ?name, "Server running");
    }

    event_loop.run(None, &mut state, |state| {
        if let Err(err) = state.display_handle.flush_clients() {
            error!(%err, "Failed to flush clients");
        }
    })?;

    Ok(())
}
