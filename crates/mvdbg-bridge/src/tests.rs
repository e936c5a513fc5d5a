//! End-to-end bridge tests against a scripted VM on a loopback socket.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mvdbg_protocol::{ExecutionStateType, RuntimeState};

use crate::{BridgeConfig, BridgeEvent, BridgeState, DebugBridge, Endpoint};

const DEADLINE: Duration = Duration::from_secs(5);

/// One accepted connection serving canned replies. The script maps a
/// received command line to the raw bytes to write back; unscripted
/// commands are ignored.
struct ScriptedVm {
    addr: std::net::SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl ScriptedVm {
    fn start(script: fn(&str) -> Option<Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let thread = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut pending = String::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                while let Some(pos) = pending.find('\n') {
                    let command = pending[..pos].trim_end().to_owned();
                    pending.drain(..=pos);
                    if let Some(reply) = script(&command) {
                        if stream.write_all(&reply).is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Self {
            addr,
            thread: Some(thread),
        }
    }

    fn connect(
        &self,
        config: BridgeConfig,
    ) -> (DebugBridge, Receiver<BridgeEvent>) {
        let connection = Endpoint::Tcp(self.addr).connect().unwrap();
        let (tx, rx) = mpsc::channel();
        let bridge = DebugBridge::connect(connection, config, Some(tx)).unwrap();
        (bridge, rx)
    }
}

impl Drop for ScriptedVm {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn config() -> BridgeConfig {
    BridgeConfig {
        reply_timeout: Some(DEADLINE),
        ..BridgeConfig::default()
    }
}

fn wait_for(rx: &Receiver<BridgeEvent>, wanted: &BridgeEvent) {
    loop {
        let event = rx.recv_timeout(DEADLINE).expect("event stream ended");
        if event == *wanted {
            return;
        }
    }
}

#[test]
fn run_ack_survives_split_delivery() {
    // The ack arrives in two writes with the line break in the second.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let vm = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 256];
        let _ = stream.read(&mut buf).unwrap();
        stream.write_all(b"PAUSE!\n").unwrap();
        let _ = stream.read(&mut buf).unwrap();
        stream.write_all(b"G").unwrap();
        thread::sleep(Duration::from_millis(20));
        stream.write_all(b"O!\n").unwrap();
        // Keep the connection open until the client hangs up.
        let _ = stream.read(&mut buf);
    });

    let connection = Endpoint::Tcp(addr).connect().unwrap();
    let (tx, _rx) = mpsc::channel();
    let bridge = DebugBridge::connect(connection, config(), Some(tx)).unwrap();
    bridge.run().unwrap();
    assert_eq!(bridge.state(), BridgeState::Running);
    drop(bridge);
    vm.join().unwrap();
}

#[test]
fn run_transitions_to_running() {
    let vm = ScriptedVm::start(|command| match command {
        "03" => Some(b"PAUSE!\n".to_vec()),
        "01" => Some(b"GO!\n".to_vec()),
        _ => None,
    });
    let (bridge, rx) = vm.connect(config());
    wait_for(&rx, &BridgeEvent::Paused);

    bridge.run().unwrap();
    assert_eq!(bridge.state(), BridgeState::Running);
    wait_for(&rx, &BridgeEvent::Running);
}

#[test]
fn step_acks_then_records_a_fresh_dump() {
    let vm = ScriptedVm::start(|command| match command {
        "03" => Some(b"PAUSE!\n".to_vec()),
        "04" => Some(b"STEP!\n".to_vec()),
        cmd if cmd.starts_with("12") => {
            Some(b"{\"pc\":66,\"start\":1024,\"breakpoints\":[]}\n".to_vec())
        }
        _ => None,
    });
    let (bridge, rx) = vm.connect(config());
    wait_for(&rx, &BridgeEvent::Paused);

    let state = bridge.step().unwrap();
    assert_eq!(state.pc, Some(66));
    assert_eq!(bridge.current_state().unwrap().pc, Some(66));
    wait_for(&rx, &BridgeEvent::StepCompleted);
    wait_for(&rx, &BridgeEvent::StateRefreshed);
}

#[test]
fn breakpoint_roundtrip_and_hit_notification() {
    let vm = ScriptedVm::start(|command| match command {
        "03" => Some(b"PAUSE!\n".to_vec()),
        "01" => Some(b"GO!\nAT 0x63!\n".to_vec()),
        "06163" => Some(b"BP 0x63!\n".to_vec()),
        cmd if cmd.starts_with("12") => Some(b"{\"pc\":99}\n".to_vec()),
        _ => None,
    });
    let (bridge, rx) = vm.connect(config());
    wait_for(&rx, &BridgeEvent::Paused);

    bridge.add_breakpoint(0x63).unwrap();
    bridge.run().unwrap();

    // The VM reports the hit; the bridge pauses and refreshes on its own.
    wait_for(&rx, &BridgeEvent::BreakpointHit(0x63));
    wait_for(&rx, &BridgeEvent::StateRefreshed);
    assert_eq!(bridge.state(), BridgeState::Paused);
    assert_eq!(bridge.current_state().unwrap().pc, Some(99));
}

#[test]
fn pull_session_captures_payload_and_merges_callbacks() {
    // The snapshot payload line would also match the dump tap; the capture
    // slot must claim it first. The callback mapping arrives separately and
    // fills only the fields the snapshot left missing.
    let vm = ScriptedVm::start(|command| match command {
        "03" => Some(b"PAUSE!\n".to_vec()),
        "60" => Some(b"DUMP!\n{\"pc\":5,\"start\":1024}\n".to_vec()),
        "74" => Some(b"{\"callbacks\":[{\"topic\":\"irq0\",\"targets\":[2,3]}]}\n".to_vec()),
        _ => None,
    });
    let (bridge, rx) = vm.connect(config());
    wait_for(&rx, &BridgeEvent::Paused);

    let state = bridge.pull_session().unwrap();
    assert_eq!(state.pc, Some(5));
    assert_eq!(state.start_address, Some(1024));
    let callbacks = state.callbacks.as_ref().unwrap();
    assert_eq!(callbacks.targets("irq0"), &[2, 3]);
    assert!(state.callstack.is_none(), "missing sections stay missing");
}

#[test]
fn push_session_streams_chunks_and_rebases() {
    let vm = ScriptedVm::start(|command| match command {
        "03" => Some(b"PAUSE!\n".to_vec()),
        // The probe dump carries the target's own load offset.
        cmd if cmd.starts_with("12") => Some(b"{\"pc\":0,\"start\":4096}\n".to_vec()),
        cmd if cmd.starts_with("62") && cmd.ends_with("00") => Some(b"OK!\n".to_vec()),
        cmd if cmd.starts_with("62") && cmd.ends_with("01") => Some(b"LOADED!\n".to_vec()),
        cmd if cmd.starts_with("06") => Some(b"BP 0x1010!\n".to_vec()),
        _ => None,
    });
    let (bridge, rx) = vm.connect(config());
    wait_for(&rx, &BridgeEvent::Paused);

    let captured = RuntimeState {
        pc: Some(1024 + 0x20),
        start_address: Some(1024),
        breakpoints: Some([1024 + 0x10].into()),
        ..RuntimeState::default()
    };

    bridge.push_session(&captured).unwrap();

    // The recorded state is the rebased one: offsets moved from the source
    // VM's load address to the target's.
    let pushed = bridge.current_state().unwrap();
    assert_eq!(pushed.start_address, Some(4096));
    assert_eq!(pushed.pc, Some(4096 + 0x20));
    assert!(pushed.breakpoints.unwrap().contains(&(4096 + 0x10)));
}

#[test]
fn unsolicited_dump_lands_on_the_timeline() {
    let vm = ScriptedVm::start(|command| match command {
        "03" => Some(b"PAUSE!\n{\"pc\":7}\n".to_vec()),
        _ => None,
    });
    let (bridge, rx) = vm.connect(config());
    wait_for(&rx, &BridgeEvent::StateRefreshed);
    assert_eq!(bridge.current_state().unwrap().pc, Some(7));
}

#[test]
fn disconnect_fails_outstanding_and_reports_once() {
    let vm = ScriptedVm::start(|command| match command {
        "03" => Some(b"PAUSE!\n".to_vec()),
        _ => None,
    });
    let (mut bridge, rx) = vm.connect(config());
    wait_for(&rx, &BridgeEvent::Paused);

    bridge.disconnect();
    wait_for(&rx, &BridgeEvent::Disconnected);
    assert_eq!(bridge.state(), BridgeState::Disconnected);
    assert!(matches!(
        bridge.dump(&ExecutionStateType::ALL),
        Err(crate::BridgeError::NotConnected)
    ));
}
