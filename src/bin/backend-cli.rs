use clap::{Parser, Subcommand};
use serde_json::Value;
use std::time::Duration;

use backend_core::net::TcpClient;

#[derive(Parser)]
#[command(name = "backend-cli")]
#[command(about = "Management CLI for backend-core", long_about = None)]
struct Cli {
    /// TCP server address.
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    tcp: String,

    /// Admin API base URL.
    #[arg(short, long, default_value = "http://127.0.0.1:8081")]
    url: String,

    /// Request timeout in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send PING over TCP
    Ping,
    /// Send ECHO over TCP
    Echo { text: String },
    /// Send an EVENT frame over TCP (JSON or plain text payload)
    Event { payload: String },
    /// Show system status
    Status,
    /// List circuit breakers
    Breakers,
    /// Show the most recent persisted events
    Events {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Queue a background HTTP delivery with retries
    Deliver {
        url: String,
        /// JSON body
        #[arg(short, long)]
        body: Option<String>,
        /// Logical service name used as circuit breaker key
        #[arg(short, long)]
        service: Option<String>,
        /// Job ids that must finish first
        #[arg(short, long)]
        after: Vec<String>,
    },
    /// List delivery jobs, or show one
    Jobs { id: Option<String> },
    /// Cancel and remove a delivery job
    CancelJob { id: String },
    /// List connected TCP clients
    Peers,
    /// Push a message to a connected TCP client
    Push { peer: String, message: String },
    /// Trigger a scheduled task immediately
    RunTask { name: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let timeout = Duration::from_millis(cli.timeout_ms);
    let client = reqwest::Client::builder().timeout(timeout).build()?;

    match cli.command {
        Commands::Ping => tcp_request(&cli.tcp, timeout, "PING", b"").await?,
        Commands::Echo { text } => tcp_request(&cli.tcp, timeout, "ECHO", text.as_bytes()).await?,
        Commands::Event { payload } => tcp_request(&cli.tcp, timeout, "EVENT", payload.as_bytes()).await?,
        Commands::Status => {
            let res = client.get(format!("{}/admin/status", cli.url)).send().await?;
            print_response(res).await?;
        }
        Commands::Breakers => {
            let res = client.get(format!("{}/admin/breakers", cli.url)).send().await?;
            print_response(res).await?;
        }
        Commands::Events { limit } => {
            let res = client
                .get(format!("{}/admin/events", cli.url))
                .query(&[("limit", limit)])
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Deliver { url, body, service, after } => {
            let body: Option<Value> = body.as_deref().map(serde_json::from_str).transpose()?;
            let res = client
                .post(format!("{}/admin/http-retry", cli.url))
                .json(&serde_json::json!({ "url": url, "body": body, "service": service, "after": after }))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Jobs { id } => {
            let path = match id {
                Some(id) => format!("{}/admin/http-retry/{}", cli.url, id),
                None => format!("{}/admin/http-retry", cli.url),
            };
            let res = client.get(path).send().await?;
            print_response(res).await?;
        }
        Commands::CancelJob { id } => {
            let res = client
                .delete(format!("{}/admin/http-retry/{}", cli.url, id))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Peers => {
            let res = client.get(format!("{}/admin/peers", cli.url)).send().await?;
            print_response(res).await?;
        }
        Commands::Push { peer, message } => {
            let res = client
                .post(format!("{}/admin/peers/send", cli.url))
                .json(&serde_json::json!({ "peer": peer, "message": message }))
                .send()
                .await?;
            if res.status().is_success() {
                println!("Message queued for {}", peer);
            } else {
                print_response(res).await?;
            }
        }
        Commands::RunTask { name } => {
            let res = client
                .post(format!("{}/admin/tasks/{}/run", cli.url, name))
                .send()
                .await?;
            let status = res.status();
            if status.is_success() {
                println!("Task '{}' triggered", name);
            } else {
                eprintln!("Error: Admin API returned status {}", status);
                print_response(res).await?;
            }
        }
    }

    Ok(())
}

async fn tcp_request(addr: &str, timeout: Duration, command: &str, payload: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = TcpClient::connect(addr, timeout).await?;
    let response = client.request(command, payload).await?;
    if response.is_ok() {
        println!("{}", response.text());
    } else {
        eprintln!("Error ({}): {}", response.status.as_str(), response.text());
    }
    client.close().await;
    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if !text.is_empty() {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    match serde_json::from_str::<Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", text),
    }
    Ok(())
}
