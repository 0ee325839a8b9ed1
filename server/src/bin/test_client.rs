use clap::{Parser, ValueEnum};
use shared::{tags, Envelope, LineFramer};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Transport {
    Tcp,
    Udp,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Scripted client for poking at a running server")]
struct Args {
    /// Transport to connect over
    #[arg(short = 't', long, value_enum, default_value = "tcp")]
    transport: Transport,

    /// Server address; defaults to 127.0.0.1:8080 for TCP and :8081 for UDP
    #[arg(short = 's', long)]
    server: Option<SocketAddr>,

    /// Account name to log in with
    #[arg(short = 'u', long, default_value = "tester")]
    username: String,

    /// Number of move/chat rounds to send
    #[arg(short = 'r', long, default_value = "5")]
    rounds: u32,
}

/// Envelopes the client sends, in order.
fn script(args: &Args) -> Vec<Envelope> {
    let mut script = vec![
        Envelope::new("ping"),
        Envelope::new("login")
            .with("username", args.username.as_str())
            .with("password", "secret"),
        Envelope::new("select_character").with("name", format!("{}'s hero", args.username)),
    ];

    for round in 0..args.rounds {
        let angle = round as f64 / 5.0;
        script.push(
            Envelope::new("move")
                .with("x", 400.0 + 100.0 * angle.sin())
                .with("y", 300.0 + 100.0 * angle.cos()),
        );
        script.push(Envelope::new("chat").with("text", format!("round {round}")));
        script.push(Envelope::new("heartbeat"));
    }

    script
}

fn print_envelope(envelope: &Envelope) {
    if envelope.tag() == tags::WORLD_STATE {
        let players = envelope
            .get("players")
            .and_then(|p| p.as_array())
            .map_or(0, Vec::len);
        println!("  <- world_state: {} players", players);
    } else {
        println!("  <- {}", envelope);
    }
}

async fn run_tcp(addr: SocketAddr, script: Vec<Envelope>) -> Result<(), Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(addr).await?;
    println!("Connected to {} over TCP", addr);

    let mut framer = LineFramer::new();
    let mut buf = [0u8; 4096];

    for mut envelope in script {
        envelope.stamp();
        println!("  -> {}", envelope);
        stream.write_all(envelope.to_line().as_bytes()).await?;

        // Give the server a tick or two to answer before the next message.
        while let Ok(read) = timeout(Duration::from_millis(200), stream.read(&mut buf)).await {
            let len = read?;
            if len == 0 {
                println!("Server closed the connection");
                return Ok(());
            }
            framer.push(&buf[..len]);
            while let Some(line) = framer.next_line() {
                let parsed = match line {
                    Ok(line) => Envelope::parse(&line).map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                match parsed {
                    Ok(envelope) => print_envelope(&envelope),
                    Err(e) => println!("  <- unreadable: {}", e),
                }
            }
        }
    }

    println!("Sending disconnect");
    stream
        .write_all(Envelope::new("disconnect").to_line().as_bytes())
        .await?;
    Ok(())
}

async fn run_udp(addr: SocketAddr, script: Vec<Envelope>) -> Result<(), Box<dyn std::error::Error>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    let mut buf = [0u8; 2048];

    for mut envelope in script {
        envelope.stamp();
        println!("  -> {}", envelope);
        socket.send_to(envelope.to_string().as_bytes(), addr).await?;

        while let Ok(received) = timeout(Duration::from_millis(200), socket.recv_from(&mut buf)).await {
            let (len, _) = received?;
            match Envelope::from_slice(&buf[..len]) {
                Ok(envelope) => print_envelope(&envelope),
                Err(e) => println!("  <- unreadable: {}", e),
            }
        }
        sleep(Duration::from_millis(50)).await;
    }

    println!("Sending disconnect");
    socket
        .send_to(Envelope::new("disconnect").to_string().as_bytes(), addr)
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let script = script(&args);

    match args.transport {
        Transport::Tcp => {
            let addr = args.server.unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080)));
            run_tcp(addr, script).await?;
        }
        Transport::Udp => {
            let addr = args.server.unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8081)));
            run_udp(addr, script).await?;
        }
    }

    println!("Test client finished");
    Ok(())
}
