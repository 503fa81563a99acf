use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use teleswitch::{Switch, Telex, derive_identity, local_ip};

#[derive(Parser, Debug)]
#[command(name = "teleswitch")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for telexes and print each one as it arrives
    Listen {
        #[arg(short, long, default_value = "42424")]
        port: u16,

        /// Identity override; derived from the local address when omitted
        #[arg(short, long)]
        identity: Option<String>,
    },

    /// Send one telex and exit
    Send {
        /// Destination switch address
        #[arg(short, long)]
        to: SocketAddr,

        /// JSON object to send
        json: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Listen { port, identity } => listen(port, identity).await,
        Command::Send { to, json } => send(to, &json).await,
    }
}

async fn listen(port: u16, identity: Option<String>) -> Result<()> {
    let ip = local_ip();
    let identity =
        identity.unwrap_or_else(|| derive_identity(&SocketAddr::new(ip, port)));

    let switch = Switch::new(identity);
    switch
        .start_listening(port)
        .await
        .context("failed to start listening")?;
    info!(
        "Switch {}:{}/{}",
        ip,
        switch.listening_port().await,
        switch.identity()
    );

    let mut telexes = switch.subscribe().await;

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            received = telexes.recv() => {
                match received {
                    Some(received) => println!("{} {}", received.from, received.telex),
                    None => break,
                }
            }
        }
    }

    switch.shutdown().await;
    Ok(())
}

async fn send(to: SocketAddr, json: &str) -> Result<()> {
    let telex = Telex::outbound(json, to).context("payload is not a JSON object")?;

    let switch = Switch::new("");
    switch
        .send_telex(&telex)
        .await
        .context("failed to send telex")?;

    info!(%to, "telex sent");
    Ok(())
}
