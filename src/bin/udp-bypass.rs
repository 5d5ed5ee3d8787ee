//! udp-bypass: raw-socket UDP/QUIC decoy dataplane
//!
//! Creates a point-to-point tunnel interface, reads the UDP packets the
//! host firewall routes into it, injects short-TTL decoy QUIC Initials,
//! and forwards the originals through a DSCP-marked raw socket.
//!
//! The firewall directs traffic here with a route-to rule on the tunnel
//! interface and passes DSCP `0x04` packets straight out — that mark is
//! how this process's own sends escape re-capture.
//!
//! ```bash
//! sudo udp-bypass --fake-quic quic_initial.bin --fake-ttl 3 --repeats 6
//! ```
//!
//! Prints exactly one `UTUN:<ifname>` line on stdout once the interface
//! is up, for the parent process to wire the firewall against.

use std::io::Write;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use dpi_bypass::config::{load_fake_payload, DEFAULT_FAKE_REPEATS, DEFAULT_FAKE_TTL};
use dpi_bypass::emitter::{DecoyEmitter, EmitterConfig};
use dpi_bypass::pidfile::{self, DEFAULT_PID_FILE};
use dpi_bypass::tun::TunDevice;

/// Local address of the point-to-point interface
const TUN_LOCAL: Ipv4Addr = Ipv4Addr::new(10, 66, 0, 1);

/// Peer address of the point-to-point interface
const TUN_PEER: Ipv4Addr = Ipv4Addr::new(10, 66, 0, 2);

/// First tunnel unit number to try by default
const DEFAULT_UTUN_START: u32 = 20;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

/// Command-line arguments
struct Args {
    fake_quic: Option<PathBuf>,
    fake_ttl: u8,
    repeats: u32,
    utun_start: u32,
    verbose: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut fake_quic = None;
        let mut fake_ttl = DEFAULT_FAKE_TTL;
        let mut repeats = DEFAULT_FAKE_REPEATS;
        let mut utun_start = DEFAULT_UTUN_START;
        let mut verbose = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--fake-quic" => match args.next() {
                    Some(path) => fake_quic = Some(PathBuf::from(path)),
                    None => missing_value("--fake-quic"),
                },
                "--fake-ttl" => {
                    fake_ttl = parse_int_arg(args.next(), 1, 255, "fake-ttl") as u8;
                }
                "--repeats" => {
                    repeats = parse_int_arg(args.next(), 1, 100, "repeats") as u32;
                }
                "--utun-start" => {
                    utun_start = parse_int_arg(args.next(), 0, 255, "utun-start") as u32;
                }
                "--verbose" => verbose = true,
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            fake_quic,
            fake_ttl,
            repeats,
            utun_start,
            verbose,
        }
    }
}

fn missing_value(flag: &str) -> ! {
    eprintln!("Missing value for {flag}");
    std::process::exit(1);
}

fn parse_int_arg(value: Option<String>, min: i64, max: i64, name: &str) -> i64 {
    let Some(value) = value else {
        missing_value(name);
    };
    match value.parse::<i64>() {
        Ok(n) if (min..=max).contains(&n) => n,
        _ => {
            eprintln!("Invalid {name}: '{value}' (must be {min}..{max})");
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r"udp-bypass v{}

UDP/QUIC DPI bypass via tunnel interface + raw socket.

USAGE:
    udp-bypass [OPTIONS]

OPTIONS:
    --fake-quic <FILE>   Fake QUIC Initial payload (.bin)
    --fake-ttl <N>       TTL for fake packets [default: {DEFAULT_FAKE_TTL}, range: 1-255]
    --repeats <N>        Fake packet repeats [default: {DEFAULT_FAKE_REPEATS}, range: 1-100]
    --utun-start <N>     First tunnel unit number to try [default: {DEFAULT_UTUN_START}, range: 0-255]
    --verbose            Per-packet diagnostics on stderr
    -h, --help           Print help

Prints UTUN:<ifname> on stdout once the interface is up. Requires root.",
        dpi_bypass::VERSION
    );
}

fn install_signal_handlers() {
    // Safety: installing async-signal-safe handlers that only store a flag
    unsafe {
        let handler: extern "C" fn(libc::c_int) = handle_signal;
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());

        // The parent may close our stdout pipe; dying on write is wrong
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn dataplane(args: &Args) -> anyhow::Result<()> {
    let fake_payload = match &args.fake_quic {
        Some(path) => load_fake_payload(path)?,
        None => Vec::new(),
    };
    if args.verbose && !fake_payload.is_empty() {
        eprintln!(
            "udp-bypass:Loaded fake QUIC payload: {} bytes",
            fake_payload.len()
        );
    }

    let mut tun = TunDevice::create(args.utun_start)?;
    tun.configure(TUN_LOCAL, TUN_PEER)
        .with_context(|| format!("configuring {}", tun.name()))?;

    // The parent reads this line back to wire the firewall
    println!("UTUN:{}", tun.name());
    std::io::stdout().flush().ok();

    if args.verbose {
        eprintln!(
            "udp-bypass: Created interface {} ({TUN_LOCAL}/{TUN_PEER})",
            tun.name()
        );
    }

    let mut emitter = DecoyEmitter::new(EmitterConfig {
        fake_payload,
        fake_ttl: args.fake_ttl,
        fake_repeats: args.repeats,
        verbose: args.verbose,
    })?;

    eprintln!(
        "udp-bypass:Running on {}, fake_ttl={}, repeats={}",
        tun.name(),
        args.fake_ttl,
        args.repeats
    );

    emitter.run(&mut tun, &RUNNING)?;
    Ok(())
}

fn run(args: &Args) -> i32 {
    // Safety: geteuid has no failure mode
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("Error: udp-bypass must run as root");
        return 1;
    }

    match pidfile::acquire(DEFAULT_PID_FILE) {
        Ok(None) => {}
        Ok(Some(pid)) => {
            eprintln!("Another udp-bypass is running (PID {pid})");
            return 1;
        }
        Err(e) => {
            eprintln!("Cannot write pid file {DEFAULT_PID_FILE}: {e}");
            return 1;
        }
    }

    install_signal_handlers();

    let code = match dataplane(args) {
        Ok(()) => {
            eprintln!("udp-bypass:Shutting down");
            0
        }
        Err(e) => {
            eprintln!("udp-bypass: {e:#}");
            1
        }
    };

    pidfile::release(DEFAULT_PID_FILE);
    code
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);
    std::process::exit(run(&args));
}
