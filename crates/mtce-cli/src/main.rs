//! Operator CLI for `hbs-agent`/`pmond` (see spec §6 ambient stack).
//!
//! Talks directly to each daemon's loopback control socket — no HTTP layer,
//! just the same small JSON-over-UDP request/reply shape the daemons
//! already use for their own internal messaging (`mtce_common::event`,
//! `pmond`'s command inbox).

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::time::timeout;

#[derive(Parser, Debug)]
#[command(name = "mtce-cli", about = "Maintenance stack operator CLI")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, default_value_t = mtce_common::DEFAULT_HBS_CLI_QUERY_PORT)]
    hbs_port: u16,

    #[arg(long, default_value_t = mtce_common::DEFAULT_PMON_CMD_PORT)]
    pmon_port: u16,

    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Heartbeat agent status summary
    Status,
    /// Per-peer heartbeat state
    Hosts,
    /// Active alarms
    Alarms,
    /// Process monitor snapshot
    Processes,
    /// Start a monitored process
    Start { process: String },
    /// Stop a monitored process
    Stop { process: String },
    /// Restart a monitored process
    Restart { process: String },
}

async fn request(port: u16, body: &Value, timeout_ms: u64) -> anyhow::Result<Value> {
    let sock = UdpSocket::bind("127.0.0.1:0").await?;
    let dest: SocketAddr = ([127, 0, 0, 1], port).into();
    sock.send_to(&serde_json::to_vec(body)?, dest).await?;

    let mut buf = [0u8; 8192];
    let n = timeout(Duration::from_millis(timeout_ms), sock.recv(&mut buf)).await??;
    Ok(serde_json::from_slice(&buf[..n])?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Status => {
            let resp = request(args.hbs_port, &serde_json::json!({"query": "status"}), args.timeout_ms).await?;
            println!("hbs-agent status");
            println!("══════════════════════════════");
            println!("  Hostname:     {}", resp["hostname"]);
            println!("  Peers:        {}", resp["peer_count"]);
            println!("  Failed:       {}", resp["failed_count"]);
        }
        Commands::Hosts => {
            let resp = request(args.hbs_port, &serde_json::json!({"query": "hosts"}), args.timeout_ms).await?;
            println!("Hosts");
            println!("══════════════════════════════");
            if let Some(peers) = resp.as_array() {
                if peers.is_empty() {
                    println!("  No peers monitored");
                }
                for p in peers {
                    println!(
                        "  {} mgmnt={} clstr={} mnfa={}",
                        p["hostname"],
                        p["mgmnt_state"],
                        p.get("clstr_state").unwrap_or(&Value::Null),
                        p["mnfa_active"],
                    );
                }
            }
        }
        Commands::Alarms => {
            let resp = request(args.hbs_port, &serde_json::json!({"query": "alarms"}), args.timeout_ms).await?;
            println!("Alarms");
            println!("══════════════════════════════");
            if let Some(alarms) = resp.as_array() {
                if alarms.is_empty() {
                    println!("  No active alarms");
                }
                for a in alarms {
                    println!(
                        "  [{}] {} {} — {}",
                        a["severity"], a["host"], a["entity_instance"], a["reason_text"]
                    );
                }
            }
        }
        Commands::Processes => {
            let resp = request(args.pmon_port, &serde_json::json!({"action": "status"}), args.timeout_ms).await?;
            println!("Processes");
            println!("══════════════════════════════");
            if let Some(procs) = resp.as_array() {
                if procs.is_empty() {
                    println!("  No processes registered");
                }
                for p in procs {
                    println!(
                        "  {} pid={} restarts={} failed={} stopped={}",
                        p["process"],
                        p.get("pid").unwrap_or(&Value::Null),
                        p["restarts_cnt"],
                        p["failed"],
                        p["stopped"],
                    );
                }
            }
        }
        Commands::Start { process } => {
            send_pmon_command(args.pmon_port, "start", &process).await?;
            println!("start requested for {process}");
        }
        Commands::Stop { process } => {
            send_pmon_command(args.pmon_port, "stop", &process).await?;
            println!("stop requested for {process}");
        }
        Commands::Restart { process } => {
            send_pmon_command(args.pmon_port, "restart", &process).await?;
            println!("restart requested for {process}");
        }
    }

    Ok(())
}

async fn send_pmon_command(port: u16, action: &str, process: &str) -> anyhow::Result<()> {
    let sock = UdpSocket::bind("127.0.0.1:0").await?;
    let body = serde_json::json!({"action": action, "process": process});
    sock.send_to(&serde_json::to_vec(&body)?, ("127.0.0.1", port)).await?;
    Ok(())
}
