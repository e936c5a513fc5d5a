//! Request/response router.
//!
//! One router per connection. Callers submit commands paired with a reply
//! matcher and block on the returned handle; persistent callbacks tap
//! notification lines; everything else falls through to a catch-all
//! logger. Dispatch rules:
//! - outstanding requests are scanned in submission (FIFO) order and the
//!   first match wins the line, resolving exactly once
//! - otherwise callbacks are scanned in registration order, first match
//!   wins, handlers are side-effecting taps that never consume requests
//! - submit writes the command as part of the same operation: a failed
//!   write rejects the request instead of leaving it outstanding
//! - closing the router fails every outstanding request exactly once
//!
//! The router never times out a request on its own: some commands have no
//! guaranteed reply shape, so deadlines are the caller's to choose (see
//! [`ReplyHandle::wait_timeout`]).

use std::collections::VecDeque;
use std::io::Write;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::matcher::LineMatcher;

type Reply = Result<String, BridgeError>;
type Handler = Arc<dyn Fn(&str) + Send + Sync>;

/// Completion handle for one submitted request.
#[derive(Debug)]
pub struct ReplyHandle {
    rx: Receiver<Reply>,
}

impl ReplyHandle {
    /// Block until the matching line arrives or the connection goes away.
    pub fn wait(self) -> Result<String, BridgeError> {
        self.rx.recv().map_err(|_| BridgeError::Disconnected)?
    }

    /// Block with a deadline.
    pub fn wait_timeout(self, deadline: Duration) -> Result<String, BridgeError> {
        match self.rx.recv_timeout(deadline) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => Err(BridgeError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::Disconnected),
        }
    }

    /// Wait with an optional deadline; `None` waits forever.
    pub fn wait_opt(self, deadline: Option<Duration>) -> Result<String, BridgeError> {
        match deadline {
            Some(deadline) => self.wait_timeout(deadline),
            None => self.wait(),
        }
    }
}

struct PendingRequest {
    seq: u64,
    matcher: LineMatcher,
    tx: Sender<Reply>,
    /// When set, resolving this request arms the capture slot so the very
    /// next line bypasses matching (session-transfer payload path).
    capture: Option<Sender<Reply>>,
}

struct CallbackRegistration {
    matcher: LineMatcher,
    handler: Handler,
}

#[derive(Default)]
struct RouterState {
    next_seq: u64,
    pending: VecDeque<PendingRequest>,
    callbacks: Vec<Arc<CallbackRegistration>>,
    capture: Option<Sender<Reply>>,
    fallback: Option<Handler>,
    closed: bool,
}

/// Correlates reply lines with outstanding requests and callbacks.
pub struct Router {
    // Separate locks: a blocked write must not stall line dispatch.
    writer: Mutex<Box<dyn Write + Send>>,
    state: Mutex<RouterState>,
}

impl Router {
    #[must_use]
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
            state: Mutex::new(RouterState::default()),
        }
    }

    /// Write `payload` and register a request resolved by the first line
    /// `matcher` accepts. Write and registration are inseparable: a failed
    /// write deregisters and rejects.
    pub fn submit(
        &self,
        payload: &[u8],
        matcher: LineMatcher,
    ) -> Result<ReplyHandle, BridgeError> {
        self.submit_inner(payload, matcher, None)
            .map(|(handle, _)| handle)
    }

    /// As [`Router::submit`], additionally arming a one-line capture: once
    /// the request resolves, the next line skips all matching and resolves
    /// the second handle instead.
    pub fn submit_with_capture(
        &self,
        payload: &[u8],
        matcher: LineMatcher,
    ) -> Result<(ReplyHandle, ReplyHandle), BridgeError> {
        let (capture_tx, capture_rx) = mpsc::channel();
        let (handle, _) = self.submit_inner(payload, matcher, Some(capture_tx))?;
        Ok((handle, ReplyHandle { rx: capture_rx }))
    }

    fn submit_inner(
        &self,
        payload: &[u8],
        matcher: LineMatcher,
        capture: Option<Sender<Reply>>,
    ) -> Result<(ReplyHandle, u64), BridgeError> {
        let (tx, rx) = mpsc::channel();
        let seq = {
            let mut state = self.state.lock().map_err(|_| BridgeError::Poisoned)?;
            if state.closed {
                return Err(BridgeError::Disconnected);
            }
            state.next_seq += 1;
            let seq = state.next_seq;
            state.pending.push_back(PendingRequest {
                seq,
                matcher,
                tx,
                capture,
            });
            seq
        };
        if let Err(err) = self.write(payload) {
            if let Ok(mut state) = self.state.lock() {
                state.pending.retain(|request| request.seq != seq);
            }
            return Err(err);
        }
        Ok((ReplyHandle { rx }, seq))
    }

    /// Fire-and-forget write for commands whose replies are owned by
    /// persistent callbacks.
    pub fn send(&self, payload: &[u8]) -> Result<(), BridgeError> {
        {
            let state = self.state.lock().map_err(|_| BridgeError::Poisoned)?;
            if state.closed {
                return Err(BridgeError::Disconnected);
            }
        }
        self.write(payload)
    }

    /// Register a persistent callback tap. Callbacks are scanned in
    /// registration order; the first match wins the line.
    pub fn add_callback(
        &self,
        matcher: LineMatcher,
        handler: impl Fn(&str) + Send + Sync + 'static,
    ) {
        if let Ok(mut state) = self.state.lock() {
            state.callbacks.push(Arc::new(CallbackRegistration {
                matcher,
                handler: Arc::new(handler),
            }));
        }
    }

    /// Drop every registered callback.
    pub fn clear_callbacks(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.callbacks.clear();
        }
    }

    /// Replace the catch-all handler for lines nothing claims.
    pub fn set_fallback(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        if let Ok(mut state) = self.state.lock() {
            state.fallback = Some(Arc::new(handler));
        }
    }

    /// Dispatch one framed line. Invoked by the transport channel in exact
    /// arrival order.
    pub fn on_line(&self, line: &str) {
        enum Action {
            Resolve(Sender<Reply>),
            Tap(Arc<CallbackRegistration>),
            Fallback(Option<Handler>),
        }

        let action = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if let Some(tx) = state.capture.take() {
                Action::Resolve(tx)
            } else if let Some(index) = state
                .pending
                .iter()
                .position(|request| request.matcher.matches(line))
            {
                // Removed before resolution: the request can never complete
                // twice, and close() only sees what is still outstanding.
                match state.pending.remove(index) {
                    Some(mut request) => {
                        state.capture = request.capture.take();
                        Action::Resolve(request.tx)
                    }
                    None => Action::Fallback(None),
                }
            } else if let Some(registration) = state
                .callbacks
                .iter()
                .find(|registration| registration.matcher.matches(line))
            {
                Action::Tap(Arc::clone(registration))
            } else {
                Action::Fallback(state.fallback.clone())
            }
        };

        // Handlers run outside the state lock so they may re-enter the
        // router (submit a refresh, register callbacks).
        match action {
            Action::Resolve(tx) => {
                if tx.send(Ok(line.to_owned())).is_err() {
                    debug!(line, "reply arrived after the caller gave up");
                }
            }
            Action::Tap(registration) => (registration.handler)(line),
            Action::Fallback(Some(handler)) => handler(line),
            Action::Fallback(None) => debug!(line, "unhandled line"),
        }
    }

    /// Number of requests still outstanding.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.lock().map(|state| state.pending.len()).unwrap_or(0)
    }

    /// Fail every outstanding request, drop callbacks and reject future
    /// submissions. Safe to call more than once.
    pub fn close(&self) {
        let (pending, capture) = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.closed = true;
            state.callbacks.clear();
            state.fallback = None;
            (
                std::mem::take(&mut state.pending),
                state.capture.take(),
            )
        };
        if !pending.is_empty() {
            warn!(count = pending.len(), "failing outstanding requests on close");
        }
        for request in pending {
            let _ = request.tx.send(Err(BridgeError::Disconnected));
        }
        if let Some(tx) = capture {
            let _ = tx.send(Err(BridgeError::Disconnected));
        }
    }

    fn write(&self, payload: &[u8]) -> Result<(), BridgeError> {
        let mut writer = self.writer.lock().map_err(|_| BridgeError::Poisoned)?;
        writer.write_all(payload)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn router() -> (Router, SharedSink) {
        let sink = SharedSink::default();
        (Router::new(Box::new(sink.clone())), sink)
    }

    #[test]
    fn submit_writes_and_resolves_once() {
        let (router, sink) = router();
        let handle = router
            .submit(b"01 \n", LineMatcher::contains("GO!"))
            .unwrap();
        assert_eq!(sink.contents(), b"01 \n");

        router.on_line("GO!");
        assert_eq!(handle.wait().unwrap(), "GO!");
        assert_eq!(router.outstanding(), 0);

        // A second matching line finds nothing outstanding.
        router.on_line("GO!");
    }

    #[test]
    fn fifo_tie_break_resolves_the_oldest() {
        let (router, _sink) = router();
        let first = router.submit(b"a", LineMatcher::contains("ACK")).unwrap();
        let second = router.submit(b"b", LineMatcher::contains("ACK")).unwrap();

        router.on_line("ACK");
        assert_eq!(first.wait().unwrap(), "ACK");
        assert_eq!(router.outstanding(), 1);

        router.on_line("ACK");
        assert_eq!(second.wait().unwrap(), "ACK");
    }

    #[test]
    fn only_the_matching_request_resolves() {
        let (router, _sink) = router();
        let go = router.submit(b"a", LineMatcher::contains("GO!")).unwrap();
        let pause = router
            .submit(b"b", LineMatcher::contains("PAUSE!"))
            .unwrap();

        router.on_line("PAUSE!");
        assert_eq!(pause.wait().unwrap(), "PAUSE!");
        assert_eq!(router.outstanding(), 1);
        drop(go);
    }

    #[test]
    fn failed_write_rejects_instead_of_dangling() {
        let router = Router::new(Box::new(BrokenPipe));
        let err = router
            .submit(b"01 \n", LineMatcher::contains("GO!"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Io(_)));
        assert_eq!(router.outstanding(), 0);
    }

    #[test]
    fn callbacks_fire_in_registration_order_first_match_only() {
        let (router, _sink) = router();
        let hits: Arc<Mutex<Vec<&'static str>>> = Arc::default();

        let first = hits.clone();
        router.add_callback(LineMatcher::prefix("DUMP"), move |_| {
            first.lock().unwrap().push("first");
        });
        let second = hits.clone();
        router.add_callback(LineMatcher::contains("DUMP"), move |_| {
            second.lock().unwrap().push("second");
        });

        router.on_line("DUMP!");
        assert_eq!(*hits.lock().unwrap(), vec!["first"]);
    }

    #[test]
    fn pending_requests_shadow_callbacks() {
        let (router, _sink) = router();
        let taps: Arc<Mutex<u32>> = Arc::default();
        let counter = taps.clone();
        router.add_callback(LineMatcher::contains("GO!"), move |_| {
            *counter.lock().unwrap() += 1;
        });

        let handle = router.submit(b"01 \n", LineMatcher::contains("GO!")).unwrap();
        router.on_line("GO!");
        assert_eq!(handle.wait().unwrap(), "GO!");
        assert_eq!(*taps.lock().unwrap(), 0, "request consumed the line");

        router.on_line("GO!");
        assert_eq!(*taps.lock().unwrap(), 1, "callback sees later lines");
    }

    #[test]
    fn dump_notification_taps_without_disturbing_requests() {
        let (router, _sink) = router();
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let log = seen.clone();
        router.add_callback(LineMatcher::prefix("DUMP!"), move |line| {
            log.lock().unwrap().push(line.to_owned());
        });
        let unrelated = router.submit(b"01 \n", LineMatcher::contains("GO!")).unwrap();

        router.on_line("DUMP!");
        router.on_line("{\"pc\":5}");

        assert_eq!(*seen.lock().unwrap(), vec!["DUMP!".to_string()]);
        assert_eq!(router.outstanding(), 1, "request left outstanding");
        let state = mvdbg_protocol::parse_dump("{\"pc\":5}").unwrap();
        assert_eq!(state.pc, Some(5));
        drop(unrelated);
    }

    #[test]
    fn fallback_gets_unclaimed_lines() {
        let (router, _sink) = router();
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let log = seen.clone();
        router.set_fallback(move |line| log.lock().unwrap().push(line.to_owned()));

        router.on_line("noise");
        assert_eq!(*seen.lock().unwrap(), vec!["noise".to_string()]);
    }

    #[test]
    fn close_fails_outstanding_exactly_once() {
        let (router, _sink) = router();
        let handle = router.submit(b"a", LineMatcher::contains("never")).unwrap();
        router.close();
        router.close();
        assert!(matches!(handle.wait(), Err(BridgeError::Disconnected)));
        assert!(matches!(
            router.submit(b"b", LineMatcher::contains("x")),
            Err(BridgeError::Disconnected)
        ));
    }

    #[test]
    fn resolved_then_closed_is_not_double_completion() {
        let (router, _sink) = router();
        let handle = router.submit(b"a", LineMatcher::contains("GO!")).unwrap();
        router.on_line("GO!");
        router.close();
        // The line match already removed the request; close had nothing to
        // fail, so the reply is the line.
        assert_eq!(handle.wait().unwrap(), "GO!");
    }

    #[test]
    fn capture_diverts_exactly_the_next_line() {
        let (router, _sink) = router();
        let (marker, payload) = router
            .submit_with_capture(b"60 \n", LineMatcher::contains("DUMP!"))
            .unwrap();
        let taps: Arc<Mutex<u32>> = Arc::default();
        let counter = taps.clone();
        router.add_callback(LineMatcher::prefix("{"), move |_| {
            *counter.lock().unwrap() += 1;
        });

        router.on_line("DUMP!");
        assert_eq!(marker.wait().unwrap(), "DUMP!");

        router.on_line("{\"pc\":5}");
        assert_eq!(payload.wait().unwrap(), "{\"pc\":5}");
        assert_eq!(*taps.lock().unwrap(), 0, "captured line bypassed matching");

        router.on_line("{\"pc\":6}");
        assert_eq!(*taps.lock().unwrap(), 1, "capture was one-shot");
    }

    #[test]
    fn wait_timeout_reports_timeout() {
        let (router, _sink) = router();
        let handle = router.submit(b"a", LineMatcher::contains("never")).unwrap();
        assert!(matches!(
            handle.wait_timeout(Duration::from_millis(10)),
            Err(BridgeError::Timeout)
        ));
    }
}
