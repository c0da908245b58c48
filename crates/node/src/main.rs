mod config;
mod node;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use config::NodeConfig;
use node::Node;

#[derive(Parser)]
#[command(name = "mx-node")]
#[command(about = "Mx transport node")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = mx::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, help = "Peer to open a session with")]
    connect: Option<SocketAddr>,

    #[arg(short, long, help = "Text payload sent to the peer once connected")]
    send: Option<String>,

    #[arg(long, help = "Send the payload on the reliable channel")]
    reliable: bool,

    #[arg(short, long, help = "Group new sessions are placed in")]
    group: Option<String>,

    #[arg(long, help = "Echo every received payload back to its sender")]
    echo: bool,

    #[arg(long, help = "Stop after this many ticks")]
    ticks: Option<u64>,

    #[arg(short, long, default_value_t = 30)]
    tick_rate: u32,

    #[arg(long, help = "Check whether a node is listening at this address and exit")]
    probe: Option<SocketAddr>,

    #[arg(long, default_value_t = 1000, help = "Probe timeout in ms")]
    probe_timeout: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Some(addr) = args.probe {
        match mx::probe(addr, Duration::from_millis(args.probe_timeout))? {
            Some(rtt) => log::info!("{} answered in {:.1} ms", addr, rtt.as_secs_f64() * 1000.0),
            None => log::warn!("{} did not answer", addr),
        }
        return Ok(());
    }

    let config = NodeConfig {
        tick_rate: args.tick_rate,
        max_ticks: args.ticks,
        echo: args.echo,
        group: args.group,
        ..Default::default()
    };

    let bind_addr = format!("{}:{}", args.bind, args.port);
    let mut node = Node::new(&bind_addr, config)?;
    log::info!("Node started on {}", node.local_addr());

    if let Some(peer) = args.connect {
        let session = node.connect(peer)?;
        if let Some(text) = &args.send {
            node.send(session, text.as_bytes(), args.reliable)?;
        }
    } else if args.send.is_some() {
        log::warn!("--send needs --connect, nothing to send to");
    }

    node.run()?;
    log::info!("Node shutting down");

    Ok(())
}
