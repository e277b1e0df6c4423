use anyhow::{anyhow, Context, Result};
use austream::audio::{self, CpalCapture, CpalSink};
use austream::pairing::Pairing;
use austream::receiver::{probe, ReceiverConfig, ReceiverSession};
use austream::sender::{SenderConfig, SenderSession};
use clap::{Parser, Subcommand};
use env_logger::Env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
/// Stream system audio to receivers on the local network, in sync.
///
/// The sender shows a six-digit PIN and a pairing string; receivers use
/// either to authenticate. Audio is end-to-end encrypted with a key derived
/// from the PIN.
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Capture local audio and serve it to authenticated receivers
    Send(SendArgs),
    /// Connect to a sender and play its stream
    Receive(ReceiveArgs),
    /// Check whether a sender is alive at an address
    Probe(ProbeArgs),
    /// List audio hosts and devices
    List,
}

#[derive(Parser, Debug)]
struct SendArgs {
    /// UDP port for control and audio; clock sync uses the next port up
    #[arg(long, default_value_t = austream::DEFAULT_AUDIO_PORT)]
    port: u16,

    /// Six-digit session PIN; generated when omitted
    #[arg(long)]
    pin: Option<String>,

    /// Pre-roll advertised to receivers, in milliseconds
    #[arg(long = "buffer-ms", default_value_t = austream::DEFAULT_BUFFER_MS)]
    buffer_ms: u32,

    /// Peak sample level at or below which frames count as silence
    #[arg(long = "silence-threshold", default_value_t = austream::DEFAULT_SILENCE_THRESHOLD)]
    silence_threshold: i16,

    /// Capture device name; the default input device when omitted
    #[arg(long)]
    device: Option<String>,
}

#[derive(Parser, Debug)]
struct ReceiveArgs {
    /// Pairing string (austream://…) or the sender's host:port
    target: String,

    /// Six-digit session PIN; required unless the pairing string carries one
    #[arg(long)]
    pin: Option<String>,

    /// Playback volume, 0.0 to 1.0
    #[arg(long, default_value_t = 1.0)]
    volume: f32,

    /// Output device name; the default output device when omitted
    #[arg(long)]
    device: Option<String>,
}

#[derive(Parser, Debug)]
struct ProbeArgs {
    /// The sender's host:port or IP address
    target: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Send(args) => run_send(args).await,
        Commands::Receive(args) => run_receive(args).await,
        Commands::Probe(args) => run_probe(args).await,
        Commands::List => audio::list_devices(),
    }
}

async fn run_send(args: SendArgs) -> Result<()> {
    let capture = CpalCapture::open(args.device.clone())?;
    let config = SenderConfig {
        bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port: args.port,
        pin: args.pin,
        buffer_ms: args.buffer_ms,
        silence_threshold: args.silence_threshold,
    };

    let session = SenderSession::start(config, Box::new(capture)).await?;
    println!("PIN: {}", session.pin());
    println!("Pairing: {}", session.pairing());
    println!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    println!();
    session.stop().await;
    Ok(())
}

async fn run_receive(args: ReceiveArgs) -> Result<()> {
    let (server, pin) = resolve_target(&args.target, args.pin)?;
    let sink = CpalSink::open(args.device.clone(), args.volume)?;

    let session = ReceiverSession::connect(ReceiverConfig { server, pin }, Arc::new(sink)).await?;
    println!(
        "Connected to {} (pre-roll {} ms); press Ctrl-C to stop",
        server,
        session.buffer_ms()
    );

    tokio::signal::ctrl_c().await?;
    println!();

    let stats = session.stats();
    let clock = session.clock();
    println!(
        "received={} lost={} decrypt_errors={} clock_offset={}us rtt={}us",
        stats.packets_received,
        stats.packets_lost,
        stats.decryption_errors,
        clock.offset_ns / 1_000,
        clock.rtt_ns / 1_000,
    );

    session.stop().await;
    Ok(())
}

async fn run_probe(args: ProbeArgs) -> Result<()> {
    let addr = parse_addr(&args.target)?;
    let host = probe(addr).await?;
    println!("\"{}\" is alive at {}", host, addr);
    Ok(())
}

fn resolve_target(target: &str, pin: Option<String>) -> Result<(SocketAddr, String)> {
    if target.starts_with("austream://") {
        let pairing: Pairing = target.parse()?;
        let pin = pin
            .or(pairing.pin)
            .ok_or_else(|| anyhow!("the pairing string has no PIN; pass --pin"))?;
        Ok((SocketAddr::new(IpAddr::V4(pairing.host), pairing.port), pin))
    } else {
        let addr = parse_addr(target)?;
        let pin = pin.ok_or_else(|| anyhow!("--pin is required"))?;
        Ok((addr, pin))
    }
}

fn parse_addr(target: &str) -> Result<SocketAddr> {
    if let Ok(addr) = target.parse() {
        return Ok(addr);
    }
    let ip: IpAddr = target
        .parse()
        .context("target must be a pairing string, host:port, or IP address")?;
    Ok(SocketAddr::new(ip, austream::DEFAULT_AUDIO_PORT))
}
