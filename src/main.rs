use anyhow::{anyhow, Context, Result};
use holepunch::{logging, Config, DialRequest, HolePunchDialer, RendezvousServer, ServerConfig};
use std::{env, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};
use tracing::{info, Level};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map_or("holepunch", String::as_str);

    if args.len() < 2 {
        print_usage(program);
        std::process::exit(1);
    }

    logging::setup_logging(Level::INFO).map_err(|e| anyhow!("Logging setup failed: {}", e))?;

    let runtime = tokio::runtime::Runtime::new()?;

    match args[1].as_str() {
        "server" => {
            if args.len() < 3 {
                eprintln!("Usage: {} server <port>", program);
                std::process::exit(1);
            }
            let port: u16 = args[2].parse().context("Invalid port")?;
            runtime.block_on(run_server(port))?
        }
        "dial" => {
            if args.len() < 5 {
                eprintln!("Usage: {} dial <my_id> <peer_id> <config.json>", program);
                std::process::exit(1);
            }
            runtime.block_on(run_peer(&args[2], &args[3], &args[4]))?
        }
        "peer_A" | "peer_B" => {
            if args.len() < 3 {
                eprintln!("Usage: {} {} <config.json>", program, args[1]);
                std::process::exit(1);
            }
            let me = args[1].as_str();
            let peer = if me == "peer_A" { "peer_B" } else { "peer_A" };
            runtime.block_on(run_peer(me, peer, &args[2]))?
        }
        _ => {
            eprintln!("Error: Invalid mode '{}'", args[1]);
            eprintln!();
            print_usage(program);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_usage(program_name: &str) {
    eprintln!("holepunch - direct TCP between two NATed hosts via a rendezvous server");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("  {} server <port>                        # Run the rendezvous server", program_name);
    eprintln!("  {} dial <my_id> <peer_id> <config.json> # Connect to a peer and chat", program_name);
    eprintln!("  {} peer_A <config.json>                 # Shorthand for dial peer_A peer_B", program_name);
    eprintln!("  {} peer_B <config.json>                 # Shorthand for dial peer_B peer_A", program_name);
    eprintln!();
    eprintln!("CONFIG FILE:");
    eprintln!("  {{ \"public_server_address\": \"rendezvous.example.com:9000\" }}");
    eprintln!();
    eprintln!("  Optional: handshake_timeout_secs, punch_timeout_secs,");
    eprintln!("            retry_interval_ms, max_attempts");
    eprintln!();
    eprintln!("Set RUST_LOG=debug to see every punch attempt.");
}

async fn run_server(port: u16) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind to port {}", port))?;

    let server = Arc::new(RendezvousServer::new(ServerConfig::default()));

    tokio::select! {
        res = server.serve(listener) => res.context("Rendezvous server stopped")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    Ok(())
}

async fn run_peer(my_id: &str, peer_id: &str, config_path: &str) -> Result<()> {
    if my_id == peer_id {
        return Err(anyhow!("Cannot connect to yourself: my_id and peer_id are both '{}'", my_id));
    }

    let config = Config::load(config_path)?;

    let mut dialer = HolePunchDialer::new(config.dial_config());
    let stream = dialer
        .dial(&config.public_server_address, DialRequest::new(my_id, peer_id))
        .await
        .context("Hole punching failed")?;

    println!("Connected directly to {}. Type a message and press Enter; Ctrl+C to exit.", peer_id);

    chat_loop(stream, peer_id).await
}

/// Pipe stdin lines to the peer and print whatever the peer sends
async fn chat_loop(stream: TcpStream, peer_id: &str) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut buf = vec![0u8; 1024];

    loop {
        tokio::select! {
            line = stdin.next_line() => match line? {
                Some(text) => {
                    writer.write_all(format!("{}\n", text).as_bytes()).await?;
                }
                None => break,
            },
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    println!("Connection closed by peer.");
                    break;
                }
                print!("{}> {}", peer_id, String::from_utf8_lossy(&buf[..n]));
                std::io::Write::flush(&mut std::io::stdout())?;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}
