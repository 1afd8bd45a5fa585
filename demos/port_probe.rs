//! Port Probe Example
//!
//! Opens a serial port through the dispatcher, cycles the line through its reset sequence
//! and sends a frame to one device address, printing whatever the device answers.
//!
//! Usage:
//!   cargo run --example port_probe                         # Interactive mode
//!   cargo run --example port_probe -- /dev/ttyUSB0 21      # Port and hex address
//!
//! Set RUST_LOG environment variable to control logging:
//!   RUST_LOG=debug cargo run --example port_probe

use inquire::Select;
use log::info;
use xray_scanner::dispatcher::DispatcherParams;
use xray_scanner::frame::Frame;
use xray_scanner::transport::list_ports;
use xray_scanner::{Dispatcher, Result, ScannerError};

/// Interactive serial port selection using inquire
fn select_port() -> Result<String> {
    let ports = list_ports()?;

    if ports.is_empty() {
        eprintln!("No serial ports found!");
        std::process::exit(1);
    }

    let port_names: Vec<String> = ports
        .iter()
        .map(|p| format!("{} - {:?}", p.port_name, p.port_type))
        .collect();

    let selection = Select::new("Select a serial port:", port_names)
        .prompt()
        .map_err(|e| ScannerError::InvalidParameter(format!("Selection cancelled: {}", e)))?;

    Ok(selection
        .split(" - ")
        .next()
        .unwrap_or_default()
        .to_string())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let port_name = match args.next() {
        Some(port) => port,
        None => select_port()?,
    };
    let address = match args.next() {
        Some(hex) => u8::from_str_radix(&hex, 16)
            .map_err(|e| ScannerError::InvalidParameter(format!("Bad address '{}': {}", hex, e)))?,
        None => 0x01,
    };

    let dispatcher = Dispatcher::system()?;
    dispatcher.open(&DispatcherParams {
        port_name: port_name.clone(),
        ..Default::default()
    })?;
    info!("Opened {}", port_name);

    info!("=== Line Reset ===");
    dispatcher.reset()?;
    info!("Line is in {} mode", dispatcher.mode()?);

    info!("=== Probe Address {:02x} ===", address);
    let accessor = dispatcher.accessor(address);
    let request = Frame::command(address, 0x00);
    let response = accessor.request(request.as_bytes())?;

    if response.is_empty() {
        info!("No answer from {:02x}", address);
    } else {
        let frame = Frame::from_bytes(&response);
        info!(
            "Answer: {:02x?} (valid frame: {})",
            response,
            frame.is_valid()
        );
    }

    dispatcher.close();
    Ok(())
}
