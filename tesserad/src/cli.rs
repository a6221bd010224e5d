use std::net::SocketAddr;

use clap::Parser;
use tessera::{shm::Fourcc, utils::Size};

#[derive(Parser, Debug)]
#[command(author, version, about = "Headless display server core", long_about = None)]
pub struct Cli {
    /// Name of the listening socket, the first free `wayland-N` if unset
    #[arg(short, long)]
    pub socket: Option<String>,
    /// Extra shm format to advertise, as a fourcc code such as AB24
    #[arg(short, long = "format", value_parser = parse_fourcc)]
    pub formats: Vec<Fourcc>,
    /// Size suggested in the first configure of every window, as WIDTHxHEIGHT
    #[arg(long, value_parser = parse_size, default_value = "800x600")]
    pub default_size: Size,
    /// Stream committed buffers to TCP clients connecting to this address
    #[arg(long)]
    pub broadcast: Option<SocketAddr>,
    /// Milliseconds between two presentations
    #[arg(long, default_value_t = 16)]
    pub frame_interval: u64,
}

fn parse_fourcc(code: &str) -> Result<Fourcc, String> {
    let bytes: [u8; 4] = code
        .as_bytes()
        .try_into()
        .map_err(|_| format!("`{}` is not a four character code", code))?;
    Fourcc::try_from(u32::from_le_bytes(bytes)).map_err(|err| err.to_string())
}

fn parse_size(size: &str) -> Result<Size, String> {
    let (w, h) = size
        .split_once('x')
        .ok_or_else(|| format!("`{}` is not of the form WIDTHxHEIGHT", size))?;
    let w = w.parse::<i32>().map_err(|err| err.to_string())?;
    let h = h.parse::<i32>().map_err(|err| err.to_string())?;
    if w <= 0 || h <= 0 {
        return Err(format!("window size {}x{} must be positive", w, h));
    }
    Ok(Size::from((w, h)))
}
