//! Half-duplex serial dispatcher.
//!
//! The [`Dispatcher`] owns the single physical line shared by every device. The line
//! direction is selected by the RTS and DTR control lines (see [`LineMode`]). All port I/O
//! happens on the dispatcher's own worker thread, which polls the port, keeps the write
//! timeout, write pause and frame interval timers, and routes assembled incoming buffers to
//! the [`Accessor`] registered for the buffer's first byte.
//!
//! Accessors are used from device threads. Each blocking accessor call holds the channel-wide
//! I/O lock, so at most one transaction is on the wire at any time.

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serialport::ClearBuffer;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::constants::*;
use crate::error::{Result, ScannerError};
use crate::transport::{system_port_opener, PortOpener, SerialLine};
use crate::worker::Worker;

/// Serial link parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherParams {
    pub port_name: String,
    pub baud_rate: u32,
    /// Time allowed for queued bytes to leave the port
    pub write_timeout_ms: u16,
    /// Minimum gap between two consecutive writes
    pub write_delay_ms: u16,
    /// Quiet period after the output queue drained
    pub write_pause_ms: u8,
    /// Silence that terminates an incoming buffer
    pub frame_interval_ms: u8,
    /// Upper bound for an accessor waiting on write completion. `None` waits forever.
    pub write_completion_timeout_ms: Option<u32>,
}

impl Default for DispatcherParams {
    fn default() -> Self {
        Self {
            port_name: DEFAULT_PORT_NAME.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            write_delay_ms: DEFAULT_WRITE_DELAY_MS,
            write_pause_ms: DEFAULT_WRITE_PAUSE_MS,
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
            write_completion_timeout_ms: None,
        }
    }
}

/// Direction of the half-duplex line, encoded on RTS and DTR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineMode {
    Write,
    Read,
    Reset,
    Echo,
}

impl LineMode {
    /// `(rts, dtr)` levels of the mode
    pub fn lines(self) -> (bool, bool) {
        match self {
            LineMode::Write => (false, false),
            LineMode::Read => (true, true),
            LineMode::Reset => (false, true),
            LineMode::Echo => (true, false),
        }
    }

    pub fn from_lines(rts: bool, dtr: bool) -> Self {
        match (rts, dtr) {
            (false, false) => LineMode::Write,
            (true, true) => LineMode::Read,
            (false, true) => LineMode::Reset,
            (true, false) => LineMode::Echo,
        }
    }

    /// Delay before the new mode is confirmed
    pub fn settle_delay(self) -> Duration {
        let ms = match self {
            LineMode::Write => WRITE_MODE_SETTLE_MS,
            LineMode::Read => READ_MODE_SETTLE_MS,
            LineMode::Reset => RESET_MODE_SETTLE_MS,
            LineMode::Echo => ECHO_MODE_SETTLE_MS,
        };
        Duration::from_millis(ms)
    }
}

impl fmt::Display for LineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Receive buffer of one accessor
#[derive(Default)]
struct AccessorSlot {
    buffer: Mutex<Vec<u8>>,
    ready: Condvar,
}

impl AccessorSlot {
    fn deliver(&self, bytes: Vec<u8>) {
        let mut buffer = self.buffer.lock();
        *buffer = bytes;
        self.ready.notify_all();
    }

    fn clear(&self) {
        self.deliver(Vec::new());
    }
}

type AccessorMap = Arc<Mutex<BTreeMap<u8, Arc<AccessorSlot>>>>;

fn clear_accessor_buffers(accessors: &AccessorMap) {
    debug!("Cleaning accessors read buffer");
    for slot in accessors.lock().values() {
        slot.clear();
    }
}

/// Port state owned by the dispatcher thread
struct Link {
    port: Option<Box<dyn SerialLine>>,
    params: DispatcherParams,
    read_buffer: Vec<u8>,
    write_deadline: Option<Instant>,
    pause_deadline: Option<Instant>,
    frame_deadline: Option<Instant>,
    watcher: Option<Sender<bool>>,
    accessors: AccessorMap,
    last_error: Arc<Mutex<String>>,
}

impl Link {
    fn new(accessors: AccessorMap, last_error: Arc<Mutex<String>>) -> Self {
        Self {
            port: None,
            params: DispatcherParams::default(),
            read_buffer: Vec::new(),
            write_deadline: None,
            pause_deadline: None,
            frame_deadline: None,
            watcher: None,
            accessors,
            last_error,
        }
    }

    /// Record an error, fail the pending write and build the error value
    fn fail(&mut self, message: impl Into<String>) -> ScannerError {
        let message = message.into();
        *self.last_error.lock() = message.clone();
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.send(false);
        }
        ScannerError::Transport(message)
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialLine>> {
        match self.port.as_mut() {
            Some(port) => Ok(port),
            None => Err(ScannerError::NotOpen("Serial port".into())),
        }
    }

    fn open(&mut self, params: DispatcherParams, opener: &PortOpener) -> Result<()> {
        info!("Opening dispatcher");
        if self.port.is_some() {
            error!("Serial port is already open");
            return Err(self.fail("Serial port is already open"));
        }

        info!(
            "Serial port: {} Baud rate: {} Write delay, ms: {} Write timeout, ms: {} Frame interval, ms: {}",
            params.port_name,
            params.baud_rate,
            params.write_delay_ms,
            params.write_timeout_ms,
            params.frame_interval_ms
        );

        match opener(&params) {
            Ok(port) => {
                self.port = Some(port);
                self.params = params;
                info!("Dispatcher successfully opened");
                Ok(())
            }
            Err(e) => {
                error!("{}", e);
                Err(self.fail("Failed to open serial port"))
            }
        }
    }

    fn close(&mut self) {
        info!("Closing dispatcher");
        if self.port.is_none() {
            warn!("Dispatcher is not open yet");
            return;
        }

        self.clear();
        clear_accessor_buffers(&self.accessors);
        self.port = None;
        info!("Dispatcher successfully closed");
    }

    fn mode(&mut self) -> Result<LineMode> {
        let port = self.port()?;
        let rts = port.request_to_send()?;
        let dtr = port.data_terminal_ready()?;
        Ok(LineMode::from_lines(rts, dtr))
    }

    /// Stop timers and drop everything buffered in both directions
    fn clear(&mut self) {
        self.frame_deadline = None;
        self.write_deadline = None;
        self.pause_deadline = None;
        self.watcher = None;
        self.read_buffer.clear();
        if let Some(port) = self.port.as_mut() {
            if let Err(e) = port.clear(ClearBuffer::All) {
                warn!("Failed to clear serial port buffers: {}", e);
            }
        }
    }

    fn set_mode(&mut self, mode: LineMode) -> Result<()> {
        let current = match self.mode() {
            Ok(current) => current,
            Err(e) => {
                error!("Failed to read line mode: {}", e);
                return Err(self.fail(e.to_string()));
            }
        };
        if current == mode {
            debug!("Dispatcher already in {} mode", mode);
            return Ok(());
        }

        self.clear();

        let (rts, dtr) = mode.lines();
        let asserted = self.port().and_then(|port| {
            port.set_request_to_send(rts)?;
            port.set_data_terminal_ready(dtr)
        });
        match asserted {
            Ok(()) => {
                let delay = mode.settle_delay();
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
            Err(e) => error!("Failed to set RTS={} DTR={}: {}", rts, dtr, e),
        }

        if self.mode().ok() != Some(mode) {
            error!("Failed to set mode: {}", mode);
            return Err(self.fail("Failed to set RTS and DTR lines"));
        }
        debug!("Dispatcher switched to {} mode", mode);
        Ok(())
    }

    fn write(&mut self, bytes: Vec<u8>, watcher: Sender<bool>) -> Result<()> {
        debug!("Write to serial port: {}", hex(&bytes));

        let current = self.mode();
        if !matches!(current, Ok(LineMode::Write)) {
            error!("Current mode: {:?} Expected: {}", current.ok(), LineMode::Write);
            let _ = watcher.send(false);
            return Err(self.fail("Dispatcher is not in write mode"));
        }

        let written = self.port().and_then(|port| port.write(&bytes));
        match written {
            Ok(count) if count == bytes.len() => {}
            other => {
                error!(
                    "Bytes written: {:?} Expected: {}",
                    other.as_ref().ok(),
                    bytes.len()
                );
                if let Ok(port) = self.port() {
                    let _ = port.clear(ClearBuffer::Output);
                }
                let _ = watcher.send(false);
                return Err(self.fail("Failed to write bytes to serial port"));
            }
        }

        debug!("Bytes successfully placed to serial port buffer");
        self.watcher = Some(watcher);
        self.write_deadline =
            Some(Instant::now() + Duration::from_millis(self.params.write_timeout_ms as u64));
        Ok(())
    }

    /// Give up on the pending write after the accessor stopped waiting for it
    fn abort_write(&mut self) {
        self.write_deadline = None;
        self.pause_deadline = None;
        self.watcher = None;
        if let Some(port) = self.port.as_mut() {
            let _ = port.clear(ClearBuffer::Output);
        }
    }

    /// One tick of the dispatcher thread
    fn poll(&mut self) -> Option<Duration> {
        self.port.as_ref()?;
        if let Err(e) = self.service() {
            error!("Serial port error occurred: {}", e);
            let _ = self.fail(e.to_string());
        }
        Some(Duration::from_millis(PORT_POLL_INTERVAL_MS))
    }

    fn service(&mut self) -> Result<()> {
        let mode = self.mode()?;

        if mode == LineMode::Read {
            let available = self.port()?.bytes_to_read()? as usize;
            if available > 0 {
                let mut chunk = vec![0u8; available];
                let count = self.port()?.read(&mut chunk)?;
                if count > 0 {
                    chunk.truncate(count);
                    self.read_buffer.extend_from_slice(&chunk);
                    debug!("Read buffer content: {}", hex(&self.read_buffer));
                    self.frame_deadline = Some(
                        Instant::now() + Duration::from_millis(self.params.frame_interval_ms as u64),
                    );
                }
            }
        }

        let now = Instant::now();

        if let Some(deadline) = self.write_deadline {
            if mode == LineMode::Write && self.port()?.bytes_to_write()? == 0 {
                self.write_deadline = None;
                self.pause_deadline =
                    Some(now + Duration::from_millis(self.params.write_pause_ms as u64));
            } else if now >= deadline {
                error!("Write timeout occurred");
                self.write_deadline = None;
                self.port()?.clear(ClearBuffer::Output)?;
                let _ = self.fail("Write timeout occurred");
            }
        }

        if matches!(self.pause_deadline, Some(deadline) if now >= deadline) {
            self.pause_deadline = None;
            debug!("All bytes successfully written");
            if let Some(watcher) = self.watcher.take() {
                let _ = watcher.send(true);
            }
        }

        if matches!(self.frame_deadline, Some(deadline) if now >= deadline) {
            self.frame_deadline = None;
            self.process_read_buffer();
        }

        Ok(())
    }

    fn process_read_buffer(&mut self) {
        debug!("Processing dispatcher read buffer");
        let buffer = std::mem::take(&mut self.read_buffer);

        if buffer.len() < MIN_ROUTABLE_LENGTH {
            warn!(
                "Dispatcher read buffer size < {}. Cleaning buffer",
                MIN_ROUTABLE_LENGTH
            );
            return;
        }

        let address = buffer[0];
        debug!("First byte of read buffer: {:02x}", address);

        let slot = self.accessors.lock().get(&address).cloned();
        match slot {
            Some(slot) => slot.deliver(buffer),
            None => debug!("No accessor for address {:02x}, dropping buffer", address),
        }
    }
}

struct Inner {
    worker: Worker<Link>,
    opener: PortOpener,
    io_lock: Mutex<()>,
    accessors: AccessorMap,
    last_error: Arc<Mutex<String>>,
    params: Mutex<DispatcherParams>,
    last_write: Mutex<Option<Instant>>,
}

/// Owner of the shared half-duplex serial line
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Dispatcher using `opener` to open its port
    pub fn new(opener: PortOpener) -> Result<Self> {
        let accessors: AccessorMap = Arc::new(Mutex::new(BTreeMap::new()));
        let last_error = Arc::new(Mutex::new(String::new()));
        let link = Link::new(Arc::clone(&accessors), Arc::clone(&last_error));
        let worker = Worker::spawn_polling("dispatcher", link, Link::poll)?;

        Ok(Self {
            inner: Arc::new(Inner {
                worker,
                opener,
                io_lock: Mutex::new(()),
                accessors,
                last_error,
                params: Mutex::new(DispatcherParams::default()),
                last_write: Mutex::new(None),
            }),
        })
    }

    /// Dispatcher for real serial ports
    pub fn system() -> Result<Self> {
        Self::new(system_port_opener())
    }

    pub fn open(&self, params: &DispatcherParams) -> Result<()> {
        let _io = self.inner.io_lock.lock();
        let opener = Arc::clone(&self.inner.opener);
        let requested = params.clone();
        self.inner
            .worker
            .run(move |link| link.open(requested, &opener))
            .settle()?;
        *self.inner.params.lock() = params.clone();
        *self.inner.last_write.lock() = None;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .worker
            .run(|link| link.port.is_some())
            .result()
            .unwrap_or(false)
    }

    pub fn close(&self) {
        let _io = self.inner.io_lock.lock();
        if let Err(e) = self.inner.worker.run(Link::close).result() {
            warn!("Failed to close dispatcher: {}", e);
        }
    }

    /// Clear accessor buffers and cycle the line through echo, reset and write modes
    pub fn reset(&self) -> Result<()> {
        let _io = self.inner.io_lock.lock();
        clear_accessor_buffers(&self.inner.accessors);
        self.switch_mode(LineMode::Echo)?;
        self.switch_mode(LineMode::Reset)?;
        self.switch_mode(LineMode::Write)
    }

    pub fn set_mode(&self, mode: LineMode) -> Result<()> {
        let _io = self.inner.io_lock.lock();
        self.switch_mode(mode)
    }

    fn switch_mode(&self, mode: LineMode) -> Result<()> {
        self.inner
            .worker
            .run(move |link| link.set_mode(mode))
            .settle()
    }

    pub fn mode(&self) -> Result<LineMode> {
        self.inner.worker.run(Link::mode).settle()
    }

    /// Endpoint for `address`, created on first use
    pub fn accessor(&self, address: u8) -> Accessor {
        let slot = {
            let mut accessors = self.inner.accessors.lock();
            Arc::clone(accessors.entry(address).or_insert_with(|| {
                info!("Create new accessor for address: {:02x}", address);
                Arc::new(AccessorSlot::default())
            }))
        };
        Accessor {
            dispatcher: self.clone(),
            address,
            slot,
        }
    }

    pub fn params(&self) -> DispatcherParams {
        self.inner.params.lock().clone()
    }

    pub fn last_error(&self) -> String {
        self.inner.last_error.lock().clone()
    }

    fn set_last_error(&self, message: &str) {
        *self.inner.last_error.lock() = message.to_string();
    }

    fn transport_error(&self) -> ScannerError {
        ScannerError::Transport(self.last_error())
    }
}

/// Per-address endpoint on the shared line
#[derive(Clone)]
pub struct Accessor {
    dispatcher: Dispatcher,
    address: u8,
    slot: Arc<AccessorSlot>,
}

impl Accessor {
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let _io = self.dispatcher.inner.io_lock.lock();
        self.do_write(bytes)
    }

    /// Wait up to `timeout_ms` for a buffer addressed to this accessor. Returns an empty
    /// buffer on timeout.
    pub fn read(&self, timeout_ms: u32) -> Result<Vec<u8>> {
        let _io = self.dispatcher.inner.io_lock.lock();
        self.do_read(timeout_ms)
    }

    /// Write and read back the response without releasing the line in between
    pub fn write_and_read(&self, bytes: &[u8], timeout_ms: u32) -> Result<Vec<u8>> {
        let _io = self.dispatcher.inner.io_lock.lock();
        self.do_write(bytes)?;
        self.do_read(timeout_ms)
    }

    /// [`Accessor::write_and_read`] with the default response timeout
    pub fn request(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        self.write_and_read(bytes, DEFAULT_READ_TIMEOUT_MS)
    }

    fn assert_off_dispatcher_thread(&self) {
        assert!(
            !self.dispatcher.inner.worker.is_current(),
            "accessor I/O must not run on the dispatcher thread"
        );
    }

    fn do_write(&self, bytes: &[u8]) -> Result<()> {
        self.assert_off_dispatcher_thread();
        let inner = &self.dispatcher.inner;

        debug!("Switching dispatcher to write mode");
        self.dispatcher.switch_mode(LineMode::Write)?;

        let params = self.dispatcher.params();
        if params.write_delay_ms > 0 {
            if let Some(last) = *inner.last_write.lock() {
                let delay = Duration::from_millis(params.write_delay_ms as u64);
                let elapsed = last.elapsed();
                if elapsed < delay {
                    debug!("Sleep before write to dispatcher, ms: {}", (delay - elapsed).as_millis());
                    thread::sleep(delay - elapsed);
                }
            }
        }

        debug!("Write to dispatcher: {}", hex(bytes));
        let (watcher, completion) = mpsc::channel();
        let payload = bytes.to_vec();
        // The outcome is reported through the watcher
        let _ = inner.worker.run(move |link| link.write(payload, watcher));

        let success = match params.write_completion_timeout_ms {
            None => completion.recv().unwrap_or(false),
            Some(ms) => match completion.recv_timeout(Duration::from_millis(ms as u64)) {
                Ok(success) => success,
                Err(RecvTimeoutError::Timeout) => {
                    error!("Write completion not signalled within {} ms", ms);
                    let _ = inner.worker.run(Link::abort_write).result();
                    self.dispatcher.set_last_error("Write completion timeout");
                    false
                }
                Err(RecvTimeoutError::Disconnected) => false,
            },
        };

        *inner.last_write.lock() = Some(Instant::now());

        if success {
            Ok(())
        } else {
            Err(self.dispatcher.transport_error())
        }
    }

    fn do_read(&self, timeout_ms: u32) -> Result<Vec<u8>> {
        self.assert_off_dispatcher_thread();

        debug!("Clear accessor read buffer");
        self.slot.clear();

        debug!("Switching dispatcher to read mode");
        self.dispatcher.switch_mode(LineMode::Read)?;

        let mut buffer = self.slot.buffer.lock();
        if buffer.is_empty() {
            debug!("Accessor waiting for incoming data for {} ms", timeout_ms);
            let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
            while buffer.is_empty() {
                if self.slot.ready.wait_until(&mut buffer, deadline).timed_out() {
                    break;
                }
            }
        }

        let bytes = std::mem::take(&mut *buffer);
        debug!("Accessor read buffer content: {}", hex(&bytes));
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    #[derive(Default)]
    struct LineState {
        rts: bool,
        dtr: bool,
        reject_lines: bool,
        written: Vec<u8>,
        input: Vec<u8>,
        clears: usize,
        stall_output: bool,
    }

    struct TestLine(Arc<Mutex<LineState>>);

    impl SerialLine for TestLine {
        fn write(&mut self, bytes: &[u8]) -> Result<usize> {
            self.0.lock().written.extend_from_slice(bytes);
            Ok(bytes.len())
        }
        fn bytes_to_write(&mut self) -> Result<u32> {
            Ok(if self.0.lock().stall_output { 1 } else { 0 })
        }
        fn bytes_to_read(&mut self) -> Result<u32> {
            Ok(self.0.lock().input.len() as u32)
        }
        fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
            let mut state = self.0.lock();
            let count = buffer.len().min(state.input.len());
            buffer[..count].copy_from_slice(&state.input[..count]);
            state.input.drain(..count);
            Ok(count)
        }
        fn set_request_to_send(&mut self, level: bool) -> Result<()> {
            let mut state = self.0.lock();
            if !state.reject_lines {
                state.rts = level;
            }
            Ok(())
        }
        fn set_data_terminal_ready(&mut self, level: bool) -> Result<()> {
            let mut state = self.0.lock();
            if !state.reject_lines {
                state.dtr = level;
            }
            Ok(())
        }
        fn request_to_send(&mut self) -> Result<bool> {
            Ok(self.0.lock().rts)
        }
        fn data_terminal_ready(&mut self) -> Result<bool> {
            Ok(self.0.lock().dtr)
        }
        fn clear(&mut self, _buffer: ClearBuffer) -> Result<()> {
            self.0.lock().clears += 1;
            Ok(())
        }
    }

    fn open_dispatcher(params: DispatcherParams) -> (Dispatcher, Arc<Mutex<LineState>>) {
        let state = Arc::new(Mutex::new(LineState::default()));
        let shared = Arc::clone(&state);
        let opener: PortOpener = Arc::new(move |_: &DispatcherParams| {
            Ok(Box::new(TestLine(Arc::clone(&shared))) as Box<dyn SerialLine>)
        });
        let dispatcher = Dispatcher::new(opener).unwrap();
        dispatcher.open(&params).unwrap();
        (dispatcher, state)
    }

    fn fast_params() -> DispatcherParams {
        DispatcherParams {
            write_delay_ms: 0,
            write_pause_ms: 0,
            write_timeout_ms: 100,
            ..Default::default()
        }
    }

    #[test]
    fn mode_table_matches_lines() {
        assert_eq!(LineMode::Write.lines(), (false, false));
        assert_eq!(LineMode::Read.lines(), (true, true));
        assert_eq!(LineMode::Reset.lines(), (false, true));
        assert_eq!(LineMode::Echo.lines(), (true, false));
        for mode in [LineMode::Write, LineMode::Read, LineMode::Reset, LineMode::Echo] {
            let (rts, dtr) = mode.lines();
            assert_eq!(LineMode::from_lines(rts, dtr), mode);
        }
    }

    #[test]
    fn set_mode_then_mode_reports_it() {
        let (dispatcher, _) = open_dispatcher(fast_params());
        for mode in [LineMode::Read, LineMode::Reset, LineMode::Echo, LineMode::Write] {
            dispatcher.set_mode(mode).unwrap();
            assert_eq!(dispatcher.mode().unwrap(), mode);
        }
    }

    #[test]
    fn set_mode_to_current_mode_is_noop() {
        let (dispatcher, state) = open_dispatcher(fast_params());
        dispatcher.set_mode(LineMode::Read).unwrap();
        let clears = state.lock().clears;
        dispatcher.set_mode(LineMode::Read).unwrap();
        dispatcher.set_mode(LineMode::Read).unwrap();
        assert_eq!(state.lock().clears, clears);
    }

    #[test]
    fn unconfirmed_mode_is_an_error() {
        let (dispatcher, state) = open_dispatcher(fast_params());
        state.lock().reject_lines = true;
        let err = dispatcher.set_mode(LineMode::Read).unwrap_err();
        assert_eq!(err.to_string(), "Failed to set RTS and DTR lines");
        assert_eq!(dispatcher.last_error(), "Failed to set RTS and DTR lines");
    }

    #[test]
    fn second_open_fails() {
        let (dispatcher, _) = open_dispatcher(fast_params());
        assert!(dispatcher.is_open());
        assert!(dispatcher.open(&fast_params()).is_err());
        assert_eq!(dispatcher.last_error(), "Serial port is already open");
        dispatcher.close();
        assert!(!dispatcher.is_open());
    }

    #[test]
    fn accessor_write_reaches_the_wire() {
        let (dispatcher, state) = open_dispatcher(fast_params());
        let accessor = dispatcher.accessor(0x21);
        let frame = Frame::new(0x21, 0x01, 0, 0, 0);
        accessor.write(frame.as_bytes()).unwrap();
        assert_eq!(state.lock().written, frame.as_bytes());
        assert_eq!(dispatcher.mode().unwrap(), LineMode::Write);
    }

    #[test]
    fn stalled_output_times_out() {
        let (dispatcher, state) = open_dispatcher(fast_params());
        state.lock().stall_output = true;
        let err = dispatcher.accessor(1).write(&[1, 2, 3]).unwrap_err();
        assert_eq!(err.to_string(), "Write timeout occurred");
    }

    #[test]
    fn completion_ceiling_bounds_the_wait() {
        let params = DispatcherParams {
            write_timeout_ms: 10_000,
            write_completion_timeout_ms: Some(50),
            ..fast_params()
        };
        let (dispatcher, state) = open_dispatcher(params);
        state.lock().stall_output = true;
        let err = dispatcher.accessor(1).write(&[1]).unwrap_err();
        assert_eq!(err.to_string(), "Write completion timeout");
    }

    #[test]
    fn read_times_out_with_empty_buffer() {
        let (dispatcher, _) = open_dispatcher(fast_params());
        let started = Instant::now();
        let bytes = dispatcher.accessor(5).read(40).unwrap();
        assert!(bytes.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn short_and_unroutable_buffers_are_dropped() {
        let (dispatcher, _) = open_dispatcher(fast_params());
        let accessor = dispatcher.accessor(0x10);
        let slot = Arc::clone(&accessor.slot);
        let drained = dispatcher
            .inner
            .worker
            .run(|link| {
                link.read_buffer = vec![0x10];
                link.process_read_buffer();
                link.read_buffer = vec![0x33, 1, 2];
                link.process_read_buffer();
                link.read_buffer = vec![0x10, 9, 9];
                link.process_read_buffer();
                link.read_buffer.is_empty()
            })
            .result()
            .unwrap();
        assert!(drained);
        assert_eq!(*slot.buffer.lock(), vec![0x10, 9, 9]);
    }

    #[test]
    fn writing_outside_write_mode_fails() {
        let (dispatcher, _) = open_dispatcher(fast_params());
        dispatcher.set_mode(LineMode::Read).unwrap();
        let (tx, rx) = mpsc::channel();
        let result = dispatcher
            .inner
            .worker
            .run(move |link| link.write(vec![1, 2], tx))
            .settle();
        assert!(result.is_err());
        assert!(!rx.recv().unwrap());
        assert_eq!(dispatcher.last_error(), "Dispatcher is not in write mode");
    }
}
