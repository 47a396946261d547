//! Parley chat server
//!
//! Multi-room text chat over TCP with a newline-delimited command
//! protocol.
//!
//! Usage:
//!   cargo run -- server                    # Run on the default port
//!   cargo run -- server --port 7878        # Run on a specific port

use parley::{ChatConfig, ChatServer};
use std::env;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "server" => {
            run_server(&args).await?;
        }
        "help" | "--help" | "-h" => {
            print_usage();
        }
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage();
            return Ok(());
        }
    }

    Ok(())
}

fn print_usage() {
    println!("Parley - Multi-Room TCP Chat Server");
    println!();
    println!("USAGE:");
    println!("    cargo run -- server [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    server              Start the chat server");
    println!("    help                Show this help message");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>       Port to listen on (default: 7878)");
    println!("    --max-conn <NUM>    Maximum connections (default: 1000)");
    println!();
    println!("PROTOCOL:");
    println!("    One newline-terminated frame per command:");
    println!("    \\insert{{name}}      Claim a display name");
    println!("    \\create{{room}}      Create a room");
    println!("    \\join{{room}}        Join a room");
    println!("    \\leave              Leave the current room");
    println!("    \\rooms              List rooms");
    println!("    \\online{{room}}      List room members");
    println!("    \\quit               Disconnect");
    println!("    Any other text is broadcast to the current room.");
    println!();
    println!("EXAMPLES:");
    println!("    cargo run -- server");
    println!("    cargo run -- server --port 5000");
    println!("    RUST_LOG=debug cargo run -- server");
}

fn parse_port(args: &[String]) -> u16 {
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            if let Ok(port) = args[i + 1].parse() {
                return port;
            }
        }
    }
    7878 // default port
}

fn parse_max_connections(args: &[String]) -> usize {
    for i in 0..args.len() {
        if args[i] == "--max-conn" && i + 1 < args.len() {
            if let Ok(max) = args[i + 1].parse() {
                return max;
            }
        }
    }
    1000 // default
}

async fn run_server(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let port = parse_port(args);
    let max_connections = parse_max_connections(args);

    let config = ChatConfig {
        bind_addr: format!("0.0.0.0:{}", port).parse()?,
        max_connections,
        ..Default::default()
    };

    info!("Configuration:");
    info!("  - Bind address: {}", config.bind_addr);
    info!("  - Max connections: {}", config.max_connections);
    info!("  - Idle timeout: {}s", config.idle_timeout_secs);

    let mut server = ChatServer::new(config);
    server.bind().await?;

    // Ctrl-C triggers the shutdown sequence; the accept loop then
    // stops and run() returns
    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            handle.shutdown().await;
        }
    });

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
