//! Connection transports and the reader channel.
//!
//! A [`Connection`] is a split read/write byte stream plus a best-effort
//! closer. The [`TransportChannel`] owns the reader half: one thread pulls
//! chunks, runs them through the framer and hands every complete line to
//! the router in arrival order. The writer half lives inside the router.

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::framer::MessageFramer;
use crate::router::Router;

/// Where a VM is listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    /// A pre-configured serial character device (baud and line discipline
    /// are set up by the surrounding tooling).
    Serial(PathBuf),
}

impl Endpoint {
    /// Parse `tcp://host:port` or `serial:///dev/ttyUSB0`.
    pub fn parse(text: &str) -> Result<Self, BridgeError> {
        if let Some(rest) = text.strip_prefix("tcp://") {
            let addr = rest
                .parse::<SocketAddr>()
                .map_err(|_| BridgeError::InvalidEndpoint(SmolStr::new(text)))?;
            return Ok(Self::Tcp(addr));
        }
        if let Some(rest) = text.strip_prefix("serial://") {
            if rest.is_empty() {
                return Err(BridgeError::InvalidEndpoint(SmolStr::new(text)));
            }
            return Ok(Self::Serial(PathBuf::from(rest)));
        }
        Err(BridgeError::InvalidEndpoint(SmolStr::new(text)))
    }

    /// Open the underlying stream.
    pub fn connect(&self) -> io::Result<Connection> {
        match self {
            Self::Tcp(addr) => {
                let stream = TcpStream::connect(addr)?;
                let reader = stream.try_clone()?;
                let closer = stream.try_clone()?;
                Ok(Connection {
                    reader: Box::new(reader),
                    writer: Box::new(stream),
                    closer: Arc::new(move || {
                        let _ = closer.shutdown(Shutdown::Both);
                    }),
                })
            }
            Self::Serial(path) => {
                let device = OpenOptions::new().read(true).write(true).open(path)?;
                let reader = device.try_clone()?;
                Ok(Connection {
                    reader: Box::new(reader),
                    writer: Box::new(device),
                    // Closing a character device does not unblock a pending
                    // read; the reader thread exits on the next byte or on
                    // device removal.
                    closer: Arc::new(|| {}),
                })
            }
        }
    }
}

/// Best-effort shutdown hook to unblock the reader thread.
pub type Closer = Arc<dyn Fn() + Send + Sync>;

/// A split, connected byte stream.
pub struct Connection {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub closer: Closer,
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The peer closed the stream.
    Closed,
    /// The stream failed.
    Errored(SmolStr),
}

/// Owns the reader thread of one connection.
pub struct TransportChannel {
    closer: Closer,
    reader: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
}

impl TransportChannel {
    /// Spawn the reader loop: bytes → framer → router, in order. On EOF or
    /// error the router is closed (failing all outstanding requests) and
    /// `on_event` is told why.
    #[must_use]
    pub fn start(
        mut reader: Box<dyn Read + Send>,
        closer: Closer,
        router: Arc<Router>,
        on_event: Box<dyn Fn(ChannelEvent) + Send>,
    ) -> Self {
        let connected = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&connected);
        let handle = thread::spawn(move || {
            let mut framer = MessageFramer::new();
            let mut buf = [0u8; 4096];
            let event = loop {
                match reader.read(&mut buf) {
                    Ok(0) => break ChannelEvent::Closed,
                    Ok(n) => {
                        for line in framer.feed(&buf[..n]) {
                            router.on_line(&line);
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => break ChannelEvent::Errored(SmolStr::new(err.to_string())),
                }
            };
            match &event {
                ChannelEvent::Closed => debug!("connection closed by peer"),
                ChannelEvent::Errored(reason) => warn!(%reason, "connection failed"),
            }
            flag.store(false, Ordering::SeqCst);
            router.close();
            on_event(event);
        });
        Self {
            closer,
            reader: Some(handle),
            connected,
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Shut the stream down and join the reader thread. Idempotent.
    pub fn disconnect(&mut self) {
        (self.closer)();
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        (self.closer)();
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::LineMatcher;
    use std::io::Write as _;
    use std::net::TcpListener;
    use std::sync::mpsc;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:8192").unwrap(),
            Endpoint::Tcp("127.0.0.1:8192".parse().unwrap())
        );
        assert_eq!(
            Endpoint::parse("serial:///dev/ttyUSB0").unwrap(),
            Endpoint::Serial(PathBuf::from("/dev/ttyUSB0"))
        );
        assert!(matches!(
            Endpoint::parse("pigeon://loft"),
            Err(BridgeError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn reader_thread_feeds_router_and_close_fails_pending() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let vm = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"G").unwrap();
            stream.write_all(b"O!\n").unwrap();
            // Drain both command lines so dropping the stream is a clean
            // FIN rather than an RST on unread data.
            let mut buf = [0u8; 8];
            stream.read_exact(&mut buf).unwrap();
        });

        let connection = Endpoint::Tcp(addr).connect().unwrap();
        let router = Arc::new(Router::new(connection.writer));
        let handle = router.submit(b"01 \n", LineMatcher::contains("GO!")).unwrap();
        let never = router.submit(b"12 \n", LineMatcher::contains("{" )).unwrap();

        let (event_tx, event_rx) = mpsc::channel();
        let mut channel = TransportChannel::start(
            connection.reader,
            connection.closer,
            Arc::clone(&router),
            Box::new(move |event| {
                let _ = event_tx.send(event);
            }),
        );

        assert_eq!(handle.wait().unwrap(), "GO!");
        vm.join().unwrap();

        // The peer hangs up; the dangling request fails instead of hanging.
        assert_eq!(event_rx.recv().unwrap(), ChannelEvent::Closed);
        assert!(matches!(never.wait(), Err(BridgeError::Disconnected)));
        assert!(!channel.is_connected());
        channel.disconnect();
    }
}
