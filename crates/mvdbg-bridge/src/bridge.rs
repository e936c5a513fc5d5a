//! Debug bridge orchestration.
//!
//! One bridge per VM connection. The bridge composes the transport
//! channel, the router and the snapshot protocol into debugging verbs and
//! a small state machine: disconnected → connecting → running/paused, with
//! breakpoint hits forcing paused and disconnect terminal. Session pull
//! and push move a captured state between VM instances, rebased to the
//! target's load offset.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use smol_str::SmolStr;
use tracing::{debug, info, warn};

use mvdbg_protocol::{
    ack, breakpoint_request, chunk_messages, classify_line, dump_request,
    encode_callback_mapping, encode_state_fragments, invoke_request, monitor_proxies_request,
    parse_dump, push_event_request, update_callback_mapping_request, update_module_request,
    Command, ExecutionStateType, InterruptEvent, LineOutcome, Opcode, RuntimeState, SourceMap,
    WasmValue,
};

use crate::error::BridgeError;
use crate::matcher::LineMatcher;
use crate::router::Router;
use crate::timeline::Timeline;
use crate::transport::{ChannelEvent, Connection, TransportChannel};

/// Bridge lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Running,
    Paused,
}

/// Notifications for the embedding layer (IDE, console).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Connected,
    Running,
    Paused,
    BreakpointHit(u32),
    StepCompleted,
    NewEvent,
    /// A fresh snapshot was recorded on the timeline.
    StateRefreshed,
    /// A non-fatal fault or progress note.
    Notice(SmolStr),
    Disconnected,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Hard ceiling for one outgoing snapshot-transfer message.
    pub max_message_size: usize,
    /// Deadline applied to every reply wait; `None` waits forever. The
    /// router never times out on its own, so this is the knob that covers
    /// that gap per deployment (serial links want larger values).
    pub reply_timeout: Option<Duration>,
    /// Ask the VM to pause right after connecting.
    pub pause_on_connect: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_message_size: 256,
            reply_timeout: None,
            pause_on_connect: true,
        }
    }
}

struct BridgeShared {
    router: Arc<Router>,
    state: Mutex<BridgeState>,
    timeline: Mutex<Timeline>,
    events: Mutex<Option<Sender<BridgeEvent>>>,
}

impl BridgeShared {
    fn emit(&self, event: BridgeEvent) {
        if let Ok(guard) = self.events.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(event);
            }
        }
    }

    fn set_state(&self, new: BridgeState) {
        if let Ok(mut state) = self.state.lock() {
            *state = new;
        }
    }

    fn record(&self, state: RuntimeState) {
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.push(state);
        }
        self.emit(BridgeEvent::StateRefreshed);
    }

    /// Fire a full-dump request; the reply lands in the dump tap.
    fn request_refresh(&self) {
        let command = dump_request(&ExecutionStateType::ALL);
        if let Err(err) = self.router.send(command.into_line().as_bytes()) {
            debug!(%err, "refresh request failed");
        }
    }
}

/// High-level debugging front-end for one remote VM.
pub struct DebugBridge {
    shared: Arc<BridgeShared>,
    channel: Option<TransportChannel>,
    config: BridgeConfig,
    source_map: Option<SourceMap>,
}

impl DebugBridge {
    /// Take ownership of a connection and bring the session up. Most
    /// targets pause on connect; with `pause_on_connect` unset the VM is
    /// assumed to keep running.
    pub fn connect(
        connection: Connection,
        config: BridgeConfig,
        events: Option<Sender<BridgeEvent>>,
    ) -> Result<Self, BridgeError> {
        let router = Arc::new(Router::new(connection.writer));
        let shared = Arc::new(BridgeShared {
            router: Arc::clone(&router),
            state: Mutex::new(BridgeState::Connecting),
            timeline: Mutex::new(Timeline::new()),
            events: Mutex::new(events),
        });
        register_taps(&shared);

        let weak = Arc::downgrade(&shared);
        let channel = TransportChannel::start(
            connection.reader,
            connection.closer,
            router,
            Box::new(move |event| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if let ChannelEvent::Errored(reason) = &event {
                    shared.emit(BridgeEvent::Notice(reason.clone()));
                }
                shared.set_state(BridgeState::Disconnected);
                shared.emit(BridgeEvent::Disconnected);
            }),
        );

        let bridge = Self {
            shared,
            channel: Some(channel),
            config,
            source_map: None,
        };
        bridge.shared.emit(BridgeEvent::Connected);
        if bridge.config.pause_on_connect {
            bridge.pause()?;
        } else {
            bridge.shared.set_state(BridgeState::Running);
            bridge.shared.emit(BridgeEvent::Running);
        }
        Ok(bridge)
    }

    /// Attach the compiled source map for this session.
    pub fn set_source_map(&mut self, map: SourceMap) {
        self.source_map = Some(map);
    }

    #[must_use]
    pub fn source_map(&self) -> Option<&SourceMap> {
        self.source_map.as_ref()
    }

    #[must_use]
    pub fn state(&self) -> BridgeState {
        self.shared
            .state
            .lock()
            .map_or(BridgeState::Disconnected, |state| *state)
    }

    /// Resume execution.
    pub fn run(&self) -> Result<(), BridgeError> {
        // Running is entered before the ack so a breakpoint hit right after
        // GO! cannot be overwritten back to running.
        let previous = self.state();
        self.shared.set_state(BridgeState::Running);
        if let Err(err) = self.roundtrip(Command::bare(Opcode::Run), LineMatcher::contains(ack::RUN))
        {
            self.shared.set_state(previous);
            return Err(err);
        }
        self.shared.emit(BridgeEvent::Running);
        Ok(())
    }

    /// Suspend execution at the next instruction boundary.
    pub fn pause(&self) -> Result<(), BridgeError> {
        self.roundtrip(
            Command::bare(Opcode::Pause),
            LineMatcher::contains(ack::PAUSE),
        )?;
        self.shared.set_state(BridgeState::Paused);
        self.shared.emit(BridgeEvent::Paused);
        Ok(())
    }

    /// Stop the program.
    pub fn halt(&self) -> Result<(), BridgeError> {
        self.roundtrip(Command::bare(Opcode::Halt), LineMatcher::contains(ack::HALT))?;
        self.shared.set_state(BridgeState::Paused);
        Ok(())
    }

    /// Reset the VM to its initial state.
    pub fn reset(&self) -> Result<(), BridgeError> {
        self.roundtrip(
            Command::bare(Opcode::Reset),
            LineMatcher::contains(ack::RESET),
        )?;
        Ok(())
    }

    /// Execute one instruction, then refresh the view. The VM stays
    /// paused.
    pub fn step(&self) -> Result<RuntimeState, BridgeError> {
        if self.state() != BridgeState::Paused {
            return Err(BridgeError::InvalidState(
                "step requires a paused VM".into(),
            ));
        }
        self.roundtrip(Command::bare(Opcode::Step), LineMatcher::contains(ack::STEP))?;
        self.shared.emit(BridgeEvent::StepCompleted);
        self.dump(&ExecutionStateType::ALL)
    }

    /// Set a breakpoint at a code address.
    pub fn add_breakpoint(&self, addr: u32) -> Result<(), BridgeError> {
        self.roundtrip(
            breakpoint_request(Opcode::AddBreakpoint, addr),
            LineMatcher::contains(ack::breakpoint(addr)),
        )?;
        Ok(())
    }

    /// Remove a breakpoint at a code address.
    pub fn remove_breakpoint(&self, addr: u32) -> Result<(), BridgeError> {
        self.roundtrip(
            breakpoint_request(Opcode::RemoveBreakpoint, addr),
            LineMatcher::contains(ack::breakpoint(addr)),
        )?;
        Ok(())
    }

    /// Set a breakpoint by source line, via the session source map.
    /// Returns the chosen code address.
    pub fn add_breakpoint_at_line(&self, line: u32) -> Result<u32, BridgeError> {
        let addr = self
            .source_map
            .as_ref()
            .and_then(|map| map.address_for_line(line))
            .ok_or(BridgeError::UnmappedLine(line))?;
        self.add_breakpoint(addr)?;
        Ok(addr)
    }

    /// Request a dump of the given state categories and record the parsed
    /// snapshot on the timeline.
    pub fn dump(&self, types: &[ExecutionStateType]) -> Result<RuntimeState, BridgeError> {
        let state = self.quiet_dump(types)?;
        self.shared.record(state.clone());
        Ok(state)
    }

    /// Full refresh of the current view.
    pub fn refresh(&self) -> Result<RuntimeState, BridgeError> {
        self.dump(&ExecutionStateType::ALL)
    }

    /// Swap the loaded module for a fresh binary.
    pub fn update_module(&self, module: &[u8]) -> Result<(), BridgeError> {
        self.roundtrip(
            update_module_request(module),
            LineMatcher::contains(ack::CHANGE_MODULE),
        )?;
        self.shared.emit(BridgeEvent::Notice("module updated".into()));
        Ok(())
    }

    /// Invoke an exported function and return the result dump.
    pub fn invoke(&self, fidx: u32, args: &[WasmValue]) -> Result<RuntimeState, BridgeError> {
        let line = self.roundtrip(invoke_request(fidx, args), LineMatcher::prefix("{"))?;
        Ok(parse_dump(&line)?)
    }

    /// Ask the VM to route the given event topics through the proxy.
    pub fn monitor_proxies(&self, topics: &[&str]) -> Result<(), BridgeError> {
        self.ensure_connected()?;
        self.shared
            .router
            .send(monitor_proxies_request(topics).into_line().as_bytes())
    }

    /// Queue an external event on the VM.
    pub fn push_event(&self, event: &InterruptEvent) -> Result<(), BridgeError> {
        self.ensure_connected()?;
        self.shared
            .router
            .send(push_event_request(event).into_line().as_bytes())
    }

    /// Capture the complete execution state of this VM.
    ///
    /// The snapshot reply is two lines: a `DUMP!` marker, then the state
    /// payload, which must not pass through normal line matching (it can
    /// contain anything). The callback mapping is fetched separately and
    /// merged in.
    pub fn pull_session(&self) -> Result<RuntimeState, BridgeError> {
        self.ensure_connected()?;
        let (marker, payload) = self.shared.router.submit_with_capture(
            Command::bare(Opcode::Snapshot).into_line().as_bytes(),
            LineMatcher::contains(ack::DUMP_MARKER),
        )?;
        marker.wait_opt(self.config.reply_timeout)?;
        let line = payload.wait_opt(self.config.reply_timeout)?;
        let mut state = parse_dump(&line)?;

        let line = self.roundtrip(
            Command::bare(Opcode::DumpCallbackMapping),
            LineMatcher::prefix("{"),
        )?;
        state.copy_missing_from(&parse_dump(&line)?);

        info!(id = state.state_id(), "session pulled");
        self.shared.record(state.clone());
        Ok(state)
    }

    /// Stream a captured state into this VM, rebased to its load offset.
    pub fn push_session(&self, state: &RuntimeState) -> Result<(), BridgeError> {
        self.ensure_connected()?;
        // The target reports its own load offset in any dump reply.
        let probe = self.quiet_dump(&[ExecutionStateType::ProgramCounter])?;
        let target = match probe.start_address {
            Some(start) => state.rebased(start),
            None => state.clone(),
        };
        self.pause()?;

        let fragments = encode_state_fragments(&target)?;
        let messages = chunk_messages(
            Opcode::LoadSnapshot,
            &fragments,
            self.config.max_message_size,
        )?;
        let last = messages.len() - 1;
        for (index, message) in messages.iter().enumerate() {
            let expected = if index == last {
                ack::CHUNK_DONE
            } else {
                ack::CHUNK_OK
            };
            let handle = self
                .shared
                .router
                .submit(message.as_bytes(), LineMatcher::contains(expected))?;
            handle.wait_opt(self.config.reply_timeout)?;
        }

        if let Some(callbacks) = &target.callbacks {
            let encoded = encode_callback_mapping(callbacks);
            self.roundtrip(
                update_callback_mapping_request(&encoded),
                LineMatcher::contains(ack::CHANGE_CALLBACKS),
            )?;
        }
        if let Some(breakpoints) = &target.breakpoints {
            for addr in breakpoints {
                self.add_breakpoint(*addr)?;
            }
        }

        info!(id = target.state_id(), chunks = messages.len(), "session pushed");
        self.shared.record(target);
        self.shared
            .emit(BridgeEvent::Notice("session transferred".into()));
        Ok(())
    }

    /// Tear the session down. Terminal: every outstanding request fails,
    /// listeners get a final Disconnected event.
    pub fn disconnect(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.disconnect();
        }
        self.shared.router.close();
        self.shared.set_state(BridgeState::Disconnected);
    }

    /// The snapshot currently selected on the timeline.
    #[must_use]
    pub fn current_state(&self) -> Option<RuntimeState> {
        self.shared
            .timeline
            .lock()
            .ok()
            .and_then(|timeline| timeline.current().cloned())
    }

    /// Re-select the previous snapshot (backward in time).
    pub fn select_earlier(&self) -> Option<RuntimeState> {
        self.shared
            .timeline
            .lock()
            .ok()
            .and_then(|mut timeline| timeline.back().cloned())
    }

    /// Re-select the next snapshot (forward again).
    pub fn select_later(&self) -> Option<RuntimeState> {
        self.shared
            .timeline
            .lock()
            .ok()
            .and_then(|mut timeline| timeline.forward().cloned())
    }

    #[must_use]
    pub fn history_len(&self) -> usize {
        self.shared
            .timeline
            .lock()
            .map(|timeline| timeline.len())
            .unwrap_or(0)
    }

    fn quiet_dump(&self, types: &[ExecutionStateType]) -> Result<RuntimeState, BridgeError> {
        let line = self.roundtrip(dump_request(types), LineMatcher::prefix("{"))?;
        Ok(parse_dump(&line)?)
    }

    fn roundtrip(&self, command: Command, matcher: LineMatcher) -> Result<String, BridgeError> {
        self.ensure_connected()?;
        let handle = self
            .shared
            .router
            .submit(command.into_line().as_bytes(), matcher)?;
        handle.wait_opt(self.config.reply_timeout)
    }

    fn ensure_connected(&self) -> Result<(), BridgeError> {
        if self.state() == BridgeState::Disconnected {
            return Err(BridgeError::NotConnected);
        }
        Ok(())
    }
}

impl Drop for DebugBridge {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Persistent notification taps, registered once per session.
fn register_taps(shared: &Arc<BridgeShared>) {
    // Dump replies not claimed by an explicit request (VM-initiated
    // refreshes) still land on the timeline.
    let tap = tap_handler(shared, |shared, outcome| {
        if let LineOutcome::Snapshot(state) = outcome {
            shared.record(*state);
        }
    });
    shared.router.add_callback(LineMatcher::prefix("{"), tap);

    // Breakpoint hits force paused and trigger a refresh.
    let tap = tap_handler(shared, |shared, outcome| {
        if let LineOutcome::BreakpointHit(addr) = outcome {
            shared.set_state(BridgeState::Paused);
            shared.emit(BridgeEvent::Paused);
            shared.emit(BridgeEvent::BreakpointHit(addr));
            shared.request_refresh();
        }
    });
    shared
        .router
        .add_callback(LineMatcher::prefix(ack::BREAKPOINT_HIT_PREFIX), tap);

    // Steps the VM completed on its own (not via our step verb).
    let tap = tap_handler(shared, |shared, outcome| {
        if matches!(outcome, LineOutcome::StepCompleted) {
            shared.emit(BridgeEvent::StepCompleted);
            shared.request_refresh();
        }
    });
    shared
        .router
        .add_callback(LineMatcher::contains(ack::STEP), tap);

    // New external events: notify and fetch the queue.
    let tap = tap_handler(shared, |shared, outcome| {
        if matches!(outcome, LineOutcome::NewEvent) {
            shared.emit(BridgeEvent::NewEvent);
            let command = Command::bare(Opcode::DumpEvents);
            if let Err(err) = shared.router.send(command.into_line().as_bytes()) {
                debug!(%err, "event dump request failed");
            }
        }
    });
    shared
        .router
        .add_callback(LineMatcher::contains(ack::NEW_EVENT), tap);
}

/// Wrap a tap body with classification, weak upgrade and malformed-line
/// reporting.
fn tap_handler(
    shared: &Arc<BridgeShared>,
    body: fn(&BridgeShared, LineOutcome),
) -> impl Fn(&str) + Send + Sync + 'static {
    let weak: Weak<BridgeShared> = Arc::downgrade(shared);
    move |line| {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        match classify_line(line) {
            LineOutcome::Malformed(reason) => {
                warn!(%reason, line, "rejected malformed line");
                shared.emit(BridgeEvent::Notice(reason));
            }
            outcome => body(&shared, outcome),
        }
    }
}
