//! Physical serial line abstraction.
//!
//! The dispatcher talks to the port through [`SerialLine`] so the direction-switching logic
//! can run against the real `serialport` handle or an in-memory line in tests.

use log::{debug, info};
use serialport::{ClearBuffer, SerialPort};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use crate::constants::*;
use crate::dispatcher::DispatcherParams;
use crate::error::Result;

/// Operations the dispatcher needs from a half-duplex serial line
pub trait SerialLine: Send {
    /// Queue bytes for transmission, returning how many were accepted
    fn write(&mut self, bytes: &[u8]) -> Result<usize>;

    /// Bytes still waiting in the output queue
    fn bytes_to_write(&mut self) -> Result<u32>;

    /// Bytes available in the input queue
    fn bytes_to_read(&mut self) -> Result<u32>;

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    fn set_request_to_send(&mut self, level: bool) -> Result<()>;

    fn set_data_terminal_ready(&mut self, level: bool) -> Result<()>;

    /// Current level of the RTS line
    fn request_to_send(&mut self) -> Result<bool>;

    /// Current level of the DTR line
    fn data_terminal_ready(&mut self) -> Result<bool>;

    fn clear(&mut self, buffer: ClearBuffer) -> Result<()>;
}

/// Factory used by the dispatcher to open its line
pub type PortOpener = Arc<dyn Fn(&DispatcherParams) -> Result<Box<dyn SerialLine>> + Send + Sync>;

/// Opener for real serial ports
pub fn system_port_opener() -> PortOpener {
    Arc::new(|params: &DispatcherParams| {
        let port = HardwarePort::open(params)?;
        Ok(Box::new(port) as Box<dyn SerialLine>)
    })
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>> {
    Ok(serialport::available_ports()?)
}

/// `serialport`-backed line.
///
/// Control line levels cannot be read back from the driver, so the levels last asserted
/// successfully are cached and reported instead.
pub struct HardwarePort {
    port: Box<dyn SerialPort>,
    rts: bool,
    dtr: bool,
}

impl HardwarePort {
    /// Open the port described by `params` with 8N1 framing and no flow control
    pub fn open(params: &DispatcherParams) -> Result<Self> {
        info!(
            "Opening serial port {} at {} baud",
            params.port_name, params.baud_rate
        );
        let port = serialport::new(&params.port_name, params.baud_rate)
            .data_bits(DATA_BITS)
            .parity(PARITY)
            .stop_bits(STOP_BITS)
            .flow_control(FLOW_CONTROL)
            .timeout(Duration::from_millis(PORT_IO_TIMEOUT_MS))
            .open()?;
        Self::new(port)
    }

    /// Wrap an already opened port and drive both control lines low
    pub fn new(mut port: Box<dyn SerialPort>) -> Result<Self> {
        port.write_request_to_send(false)?;
        port.write_data_terminal_ready(false)?;
        Ok(Self {
            port,
            rts: false,
            dtr: false,
        })
    }
}

impl SerialLine for HardwarePort {
    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        self.port.write_all(bytes)?;
        Ok(bytes.len())
    }

    fn bytes_to_write(&mut self) -> Result<u32> {
        Ok(self.port.bytes_to_write()?)
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        Ok(self.port.bytes_to_read()?)
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        match self.port.read(buffer) {
            Ok(count) => Ok(count),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn set_request_to_send(&mut self, level: bool) -> Result<()> {
        self.port.write_request_to_send(level)?;
        self.rts = level;
        Ok(())
    }

    fn set_data_terminal_ready(&mut self, level: bool) -> Result<()> {
        self.port.write_data_terminal_ready(level)?;
        self.dtr = level;
        Ok(())
    }

    fn request_to_send(&mut self) -> Result<bool> {
        Ok(self.rts)
    }

    fn data_terminal_ready(&mut self) -> Result<bool> {
        Ok(self.dtr)
    }

    fn clear(&mut self, buffer: ClearBuffer) -> Result<()> {
        debug!("Clearing serial port buffer {:?}", buffer);
        Ok(self.port.clear(buffer)?)
    }
}
