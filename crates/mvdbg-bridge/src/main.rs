use std::io::{self, BufRead, Write};
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use mvdbg_bridge::{BridgeConfig, BridgeEvent, DebugBridge, Endpoint};
use mvdbg_protocol::SourceMap;

/// Interactive console for debugging a remote WebAssembly VM.
#[derive(Debug, Parser)]
#[command(name = "mvdbg", version, about)]
struct Cli {
    /// VM endpoint, e.g. tcp://192.168.0.20:8192 or serial:///dev/ttyUSB0.
    endpoint: String,

    /// Source map produced by the compiler, for line breakpoints.
    #[arg(long)]
    source_map: Option<std::path::PathBuf>,

    /// Ceiling for one outgoing snapshot-transfer message, in characters.
    #[arg(long, default_value_t = 256)]
    max_message_size: usize,

    /// Reply deadline in milliseconds; omit to wait forever.
    #[arg(long)]
    timeout_ms: Option<u64>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("mvdbg error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = Endpoint::parse(&cli.endpoint)?;
    let connection = endpoint.connect()?;
    info!(endpoint = %cli.endpoint, "connected");

    let config = BridgeConfig {
        max_message_size: cli.max_message_size,
        reply_timeout: cli.timeout_ms.map(Duration::from_millis),
        ..BridgeConfig::default()
    };
    let (event_tx, event_rx) = mpsc::channel();
    let mut bridge = DebugBridge::connect(connection, config, Some(event_tx))?;
    if let Some(path) = &cli.source_map {
        let text = std::fs::read_to_string(path)?;
        bridge.set_source_map(SourceMap::from_json(&text)?);
    }

    // Events are printed from their own thread so breakpoint hits show up
    // while the console waits for input.
    let printer = std::thread::spawn(move || {
        for event in event_rx {
            match event {
                BridgeEvent::BreakpointHit(addr) => println!("* breakpoint hit at 0x{addr:x}"),
                BridgeEvent::StateRefreshed => {}
                BridgeEvent::Disconnected => {
                    println!("* disconnected");
                    break;
                }
                other => println!("* {other:?}"),
            }
        }
    });

    console_loop(&bridge)?;
    bridge.disconnect();
    drop(bridge);
    let _ = printer.join();
    Ok(())
}

fn console_loop(bridge: &DebugBridge) -> Result<(), Box<dyn std::error::Error>> {
    let stdin = io::stdin();
    loop {
        print!("mvdbg> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(());
        }
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or("");
        let arg = parts.next();
        let outcome = match verb {
            "" => continue,
            "quit" | "q" => return Ok(()),
            "run" | "r" => bridge.run(),
            "pause" | "p" => bridge.pause(),
            "step" | "s" => bridge.step().map(|state| print_state(&state)),
            "halt" => bridge.halt(),
            "reset" => bridge.reset(),
            "bp" => match parse_addr(arg) {
                Some(addr) => bridge.add_breakpoint(addr),
                None => {
                    eprintln!("usage: bp <hex-addr>");
                    continue;
                }
            },
            "unbp" => match parse_addr(arg) {
                Some(addr) => bridge.remove_breakpoint(addr),
                None => {
                    eprintln!("usage: unbp <hex-addr>");
                    continue;
                }
            },
            "bpl" => match arg.and_then(|text| text.parse().ok()) {
                Some(line) => bridge
                    .add_breakpoint_at_line(line)
                    .map(|addr| println!("breakpoint at 0x{addr:x}")),
                None => {
                    eprintln!("usage: bpl <line>");
                    continue;
                }
            },
            "dump" | "d" => bridge.refresh().map(|state| print_state(&state)),
            "pull" => bridge.pull_session().map(|state| {
                println!("pulled session {:08x}", state.state_id());
            }),
            "push" => match bridge.current_state() {
                Some(state) => bridge.push_session(&state),
                None => {
                    eprintln!("no captured state to push");
                    continue;
                }
            },
            "back" => {
                match bridge.select_earlier() {
                    Some(state) => print_state(&state),
                    None => println!("(empty timeline)"),
                }
                continue;
            }
            "fwd" => {
                match bridge.select_later() {
                    Some(state) => print_state(&state),
                    None => println!("(empty timeline)"),
                }
                continue;
            }
            other => {
                eprintln!("unknown command '{other}'");
                continue;
            }
        };
        if let Err(err) = outcome {
            eprintln!("error: {err}");
        }
    }
}

fn parse_addr(arg: Option<&str>) -> Option<u32> {
    let text = arg?;
    let text = text.strip_prefix("0x").unwrap_or(text);
    u32::from_str_radix(text, 16).ok()
}

fn print_state(state: &mvdbg_protocol::RuntimeState) {
    println!(
        "pc=0x{:x} frames={} breakpoints={}",
        state.pc(),
        state.logical_callstack().len(),
        state
            .breakpoints
            .as_ref()
            .map_or(0, std::collections::BTreeSet::len),
    );
}
