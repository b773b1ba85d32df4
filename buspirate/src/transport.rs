//! Timeout-bounded byte exchange with the Bus Pirate.
//!
//! A `Transport` owns one open connection to the Bus Pirate. Writes go straight to
//! the underlying link. Reads are served by a worker thread that owns a
//! second handle to the same link and performs one read request at a time;
//! the calling thread races each request against the caller's deadline.
//!
//! When the deadline wins, the in-flight request is cancelled synchronously:
//! the caller waits for the worker to finish its current read, throws away
//! whatever it returned together with everything accumulated so far, and only
//! then reports `Error::Timeout`. Outside of a read call there is never a
//! read in flight, so bytes belonging to a later command cannot be consumed
//! by an earlier, abandoned one.
//!
//! A `Transport` is not `Sync` and supports a single caller. Commands are
//! never pipelined.

use std::io::{self, Read};
use std::mem;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::{Error, Result};

/// Upper bound on how long a cancelled read may take to come back.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 512;

/// `Link` is one open byte pipe to the Bus Pirate.
pub trait Link: Send {
    /// Sends all of `bytes`, returning once the OS has accepted them.
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Drops anything queued in either direction at the OS level.
    fn discard_buffers(&mut self) -> io::Result<()>;

    /// Returns a second handle that reads from the same pipe.
    ///
    /// Reads on the returned handle must give up with
    /// `io::ErrorKind::TimedOut` (or `WouldBlock`) after a short poll
    /// interval when nothing arrives.
    fn split_reader(&mut self) -> io::Result<Box<dyn Read + Send>>;
}

/// `Connector` knows how to (re)open a `Link` with fixed settings.
pub trait Connector: Send {
    fn connect(&mut self) -> Result<Box<dyn Link>>;

    /// Human-readable endpoint name, used in log messages.
    fn name(&self) -> &str;
}

/// `Delimiter` decides when `Transport::read_until` has seen a complete
/// response.
pub trait Delimiter {
    fn matches(&self, received: &[u8]) -> bool;
}

impl Delimiter for [u8] {
    fn matches(&self, received: &[u8]) -> bool {
        find_subslice(received, self).is_some()
    }
}

impl<const N: usize> Delimiter for [u8; N] {
    fn matches(&self, received: &[u8]) -> bool {
        find_subslice(received, self).is_some()
    }
}

pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

struct ReadReply {
    id: u64,
    result: io::Result<Vec<u8>>,
}

/// Everything that only exists while the link is open.
struct Session {
    link: Box<dyn Link>,
    requests: Option<Sender<u64>>,
    replies: Receiver<ReadReply>,
    worker: Option<JoinHandle<()>>,
    in_flight: Option<u64>,
    next_id: u64,
}

impl Session {
    /// Waits for bytes until `deadline`.
    ///
    /// `Ok(None)` means the deadline passed first; the request stays in
    /// flight and must be cancelled by the caller.
    fn poll(&mut self, deadline: Instant) -> Result<Option<Vec<u8>>> {
        let id = match self.in_flight {
            Some(id) => id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                self.requests
                    .as_ref()
                    .ok_or(Error::Closed)?
                    .send(id)
                    .map_err(|_| Error::Closed)?;
                self.in_flight = Some(id);
                id
            }
        };

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok(reply) if reply.id == id => {
                    self.in_flight = None;
                    return reply.result.map(Some).map_err(Error::Read);
                }
                // Late answer to a request that was already cancelled.
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Closed),
            }
        }
    }

    fn cancel(&mut self) {
        let Some(id) = self.in_flight.take() else {
            return;
        };
        let deadline = Instant::now() + CANCEL_GRACE;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok(reply) if reply.id == id => {
                    if let Ok(bytes) = reply.result {
                        if !bytes.is_empty() {
                            log::trace!("buspirate: discarding {} late bytes", bytes.len());
                        }
                    }
                    return;
                }
                Ok(_) => continue,
                Err(_) => {
                    log::warn!("buspirate: cancelled read {} did not return in time", id);
                    return;
                }
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Closing the request channel lets the worker fall out of its loop
        // once its current read returns.
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn read_worker(mut reader: Box<dyn Read + Send>, requests: Receiver<u64>, replies: Sender<ReadReply>) {
    let mut buf = [0u8; READ_CHUNK];
    for id in requests {
        let result = match reader.read(&mut buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial link closed",
            )),
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        };
        if replies.send(ReadReply { id, result }).is_err() {
            break;
        }
    }
}

/// `Transport` is a single connection to a named serial endpoint.
pub struct Transport {
    connector: Box<dyn Connector>,
    session: Option<Session>,
    pending: Vec<u8>,
}

impl Transport {
    /// Creates a closed transport that will use `connector` to open.
    pub fn new<C: Connector + 'static>(connector: C) -> Self {
        Self {
            connector: Box::new(connector),
            session: None,
            pending: Vec::new(),
        }
    }

    /// Creates a closed transport for the serial port at `path`.
    pub fn serial(path: &str, settings: serial::SerialSettings) -> Self {
        Self::new(serial::SerialConnector::new(path, settings))
    }

    pub fn name(&self) -> &str {
        self.connector.name()
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Opens the link. Opening an already open transport does nothing.
    pub fn open(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }

        let mut link = self.connector.connect()?;
        let reader = link.split_reader().map_err(Error::Read)?;
        let (request_tx, request_rx) = mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("buspirate-rx".into())
            .spawn(move || read_worker(reader, request_rx, reply_tx))
            .map_err(Error::Read)?;

        self.pending.clear();
        self.session = Some(Session {
            link,
            requests: Some(request_tx),
            replies: reply_rx,
            worker: Some(worker),
            in_flight: None,
            next_id: 0,
        });
        log::info!("buspirate: opened {}", self.connector.name());
        Ok(())
    }

    /// Closes the link. Closing a closed transport does nothing.
    pub fn close(&mut self) {
        if self.session.take().is_some() {
            log::info!("buspirate: closed {}", self.connector.name());
        }
        self.pending.clear();
    }

    /// Closes and reopens the link with the same settings.
    pub fn reset(&mut self) -> Result<()> {
        log::debug!("buspirate: reopening {}", self.connector.name());
        self.close();
        self.open()
    }

    /// Sends every byte of `bytes`.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let session = self.session.as_mut().ok_or(Error::Closed)?;
        session.link.send(bytes).map_err(Error::Write)?;
        log::trace!("buspirate: tx {:02X?}", bytes);
        Ok(bytes.len())
    }

    /// Waits for exactly `length` bytes.
    ///
    /// Bytes that arrived beyond `length` stay buffered for the next read.
    pub fn read_exact(&mut self, length: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        self.fill(deadline, |received| received.len() >= length)?;
        let bytes: Vec<u8> = self.pending.drain(..length).collect();
        log::trace!("buspirate: rx {:02X?}", bytes);
        Ok(bytes)
    }

    /// Waits until `delimiter` matches the bytes received so far.
    ///
    /// Returns everything received, including bytes that arrived after the
    /// match, and leaves the buffer empty.
    pub fn read_until<D: Delimiter + ?Sized>(
        &mut self,
        delimiter: &D,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        self.fill(deadline, |received| delimiter.matches(received))?;
        let bytes = mem::take(&mut self.pending);
        log::trace!("buspirate: rx {:02X?}", bytes);
        Ok(bytes)
    }

    /// Drops queued bytes in both directions and anything already received.
    pub fn flush(&mut self) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::Closed)?;
        session.link.discard_buffers().map_err(Error::Write)?;
        self.pending.clear();
        Ok(())
    }

    fn fill(&mut self, deadline: Instant, done: impl Fn(&[u8]) -> bool) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::Closed)?;
        while !done(&self.pending) {
            match session.poll(deadline) {
                Ok(Some(bytes)) => self.pending.extend_from_slice(&bytes),
                Ok(None) => {
                    session.cancel();
                    self.pending.clear();
                    return Err(Error::Timeout);
                }
                Err(e) => {
                    session.cancel();
                    self.pending.clear();
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

pub mod serial {
    //! Serial port links, via the `serialport` crate.

    use super::*;
    use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
    use std::io::Write;

    /// Line settings for the Bus Pirate's USB serial port. Framing is always 8N1
    /// without flow control.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SerialSettings {
        pub baud_rate: u32,
        /// How long a single OS-level read waits before giving up.
        pub poll_interval: Duration,
    }

    impl Default for SerialSettings {
        fn default() -> Self {
            Self {
                baud_rate: 115_200,
                poll_interval: Duration::from_millis(10),
            }
        }
    }

    /// A parsed `dev=<path>[:<baud>]` connection string.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Connection {
        pub device: String,
        pub baud: Option<u32>,
    }

    impl Connection {
        pub fn parse(s: &str) -> std::result::Result<Self, String> {
            let dev = s
                .strip_prefix("dev=")
                .ok_or_else(|| format!("Invalid connection string: {}. Use dev=...", s))?;
            if dev.is_empty() {
                return Err("Missing device path in dev= parameter".to_string());
            }
            match dev.rsplit_once(':') {
                Some((device, baud_str)) if !device.is_empty() => {
                    let baud = baud_str
                        .parse()
                        .map_err(|_| format!("Invalid baud rate: {}", baud_str))?;
                    Ok(Connection {
                        device: device.to_string(),
                        baud: Some(baud),
                    })
                }
                _ => Ok(Connection {
                    device: dev.to_string(),
                    baud: None,
                }),
            }
        }

        pub fn settings(&self) -> SerialSettings {
            let mut settings = SerialSettings::default();
            if let Some(baud) = self.baud {
                settings.baud_rate = baud;
            }
            settings
        }
    }

    pub struct SerialConnector {
        path: String,
        settings: SerialSettings,
    }

    impl SerialConnector {
        pub fn new(path: &str, settings: SerialSettings) -> Self {
            Self {
                path: path.to_string(),
                settings,
            }
        }
    }

    impl Connector for SerialConnector {
        fn connect(&mut self) -> Result<Box<dyn Link>> {
            let port = serialport::new(self.path.as_str(), self.settings.baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(self.settings.poll_interval)
                .open()
                .map_err(|source| Error::Open {
                    port: self.path.clone(),
                    source,
                })?;

            log::debug!(
                "buspirate: {} configured at {} baud",
                self.path,
                self.settings.baud_rate
            );

            Ok(Box::new(SerialLink { port }))
        }

        fn name(&self) -> &str {
            &self.path
        }
    }

    struct SerialLink {
        port: Box<dyn SerialPort>,
    }

    impl Link for SerialLink {
        fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.port.write_all(bytes)?;
            self.port.flush()
        }

        fn discard_buffers(&mut self) -> io::Result<()> {
            self.port.clear(ClearBuffer::All).map_err(io::Error::from)
        }

        fn split_reader(&mut self) -> io::Result<Box<dyn Read + Send>> {
            let reader = self.port.try_clone().map_err(io::Error::from)?;
            Ok(Box::new(reader))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse_connection() {
            let conn = Connection::parse("dev=/dev/ttyUSB0").unwrap();
            assert_eq!(conn.device, "/dev/ttyUSB0");
            assert_eq!(conn.baud, None);
            assert_eq!(conn.settings().baud_rate, 115_200);

            let conn = Connection::parse("dev=/dev/ttyUSB0:921600").unwrap();
            assert_eq!(conn.device, "/dev/ttyUSB0");
            assert_eq!(conn.settings().baud_rate, 921_600);

            assert!(Connection::parse("dev=/dev/ttyUSB0:fast").is_err());
            assert!(Connection::parse("ip=localhost:1234").is_err());
            assert!(Connection::parse("dev=").is_err());
        }

        #[test]
        fn test_open_bad_port() {
            let mut transport = Transport::serial("/dev/does-not-exist-bp", SerialSettings::default());
            match transport.open() {
                Err(Error::Open { port, .. }) => assert_eq!(port, "/dev/does-not-exist-bp"),
                other => panic!("unexpected result: {:?}", other.map(|_| ())),
            }
            assert!(!transport.is_open());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBusPirate, SimMode};

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_millis(500);

    fn loopback() -> (SimBusPirate, Transport) {
        let sim = SimBusPirate::new().in_mode(SimMode::Loopback);
        let mut transport = Transport::new(sim.clone());
        transport.open().unwrap();
        (sim, transport)
    }

    #[test]
    fn test_fixed_len_write_read() {
        let (_sim, mut t) = loopback();
        let data = [0x55, 0x33, 0x23, 0x99];
        assert_eq!(t.write(&data).unwrap(), 4);
        assert_eq!(t.read_exact(4, LONG).unwrap(), data);
    }

    #[test]
    fn test_large_write_read() {
        let (_sim, mut t) = loopback();
        let mut seed = 0x1234_5678u32;
        let data: Vec<u8> = (0..1000)
            .map(|_| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (seed >> 16) as u8
            })
            .collect();
        t.write(&data).unwrap();
        assert_eq!(t.read_exact(data.len(), LONG).unwrap(), data);
    }

    #[test]
    fn test_read_exact_keeps_surplus() {
        let (_sim, mut t) = loopback();
        t.write(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(t.read_exact(2, LONG).unwrap(), [1, 2]);
        assert_eq!(t.read_exact(3, LONG).unwrap(), [3, 4, 5]);
    }

    #[test]
    fn test_read_until_returns_trailing_bytes() {
        let (_sim, mut t) = loopback();
        t.write(b"I have no clue when this will 758ryt end").unwrap();
        let out = t.read_until(b"758ryt", LONG).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.ends_with("758ryt end"));
    }

    #[test]
    fn test_read_until_timeout() {
        let (_sim, mut t) = loopback();
        assert!(matches!(t.read_until(b"758ryt", SHORT), Err(Error::Timeout)));
    }

    #[test]
    fn test_read_exact_timeout() {
        let (_sim, mut t) = loopback();
        assert!(matches!(t.read_exact(5, SHORT), Err(Error::Timeout)));
    }

    #[test]
    fn test_partial_read_is_discarded_on_timeout() {
        let (_sim, mut t) = loopback();
        t.write(&[0xAA, 0xBB]).unwrap();
        assert!(matches!(t.read_exact(4, SHORT), Err(Error::Timeout)));

        t.write(&[1, 2, 3, 4]).unwrap();
        assert_eq!(t.read_exact(4, LONG).unwrap(), [1, 2, 3, 4]);
    }

    #[test]
    fn test_failed_read_then_write() {
        let (_sim, mut t) = loopback();
        let data = [0x55, 0x33, 0x23, 0x99];

        assert!(matches!(t.read_exact(4, SHORT), Err(Error::Timeout)));
        t.write(&data).unwrap();
        assert_eq!(t.read_exact(4, LONG).unwrap(), data);

        assert!(matches!(t.read_until(b"758ryt", SHORT), Err(Error::Timeout)));
        t.write(&data).unwrap();
        assert_eq!(t.read_exact(4, LONG).unwrap(), data);
    }

    #[test]
    fn test_flush_discards_pending_input() {
        let (_sim, mut t) = loopback();
        t.write(&[0x55, 0x33, 0x23, 0x99]).unwrap();
        t.flush().unwrap();
        assert!(matches!(t.read_exact(4, SHORT), Err(Error::Timeout)));
    }

    #[test]
    fn test_reset_reopens() {
        let (sim, mut t) = loopback();
        let data = [0x55, 0x33, 0x23, 0x99];
        t.write(&data).unwrap();
        assert_eq!(t.read_exact(4, LONG).unwrap(), data);

        t.reset().unwrap();
        assert!(t.is_open());
        t.write(&data).unwrap();
        assert_eq!(t.read_exact(4, LONG).unwrap(), data);
        assert_eq!(sim.snapshot().opens, 2);
    }

    #[test]
    fn test_open_close_repeat() {
        let (sim, mut t) = loopback();
        for _ in 0..3 {
            t.close();
            assert!(!t.is_open());
            t.open().unwrap();
            assert!(t.is_open());
        }
        assert_eq!(sim.snapshot().opens, 4);
    }

    #[test]
    fn test_closed_transport() {
        let mut t = Transport::new(SimBusPirate::new());
        assert!(matches!(t.write(&[0]), Err(Error::Closed)));
        assert!(matches!(t.read_exact(1, SHORT), Err(Error::Closed)));
        assert!(matches!(t.flush(), Err(Error::Closed)));
    }

    #[test]
    fn test_open_refused() {
        let sim = SimBusPirate::new();
        sim.refuse_open(true);
        let mut t = Transport::new(sim);
        assert!(matches!(t.open(), Err(Error::Open { .. })));
        assert!(!t.is_open());
    }

    #[test]
    fn test_delimiter_literals() {
        assert!(b"BBIO1".matches(b"xxBBIO1yy"));
        assert!(!b"BBIO1".matches(b"BBIO"));
        assert!(b"SPI"[..].matches(b"SPI1"));
        assert_eq!(find_subslice(b"abc", b""), Some(0));
    }
}
