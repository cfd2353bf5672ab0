use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use mapring::config::Config;
use mapring::consts::RING_NAME;
use mapring::directory::Directory;
use mapring::directory::MemDirectory;
use mapring::directory::RemoteDirectory;
use mapring::error::Error;
use mapring::mapreduce::task::JobId;
use mapring::mapreduce::JobOptions;
use mapring::node::Node;
use mapring::rpc::server;
use mapring::rpc::Envelope;
use mapring::rpc::Request;
use mapring::rpc::Response;
use mapring::rpc::RpcClient;
use mapring::rpc::TcpClient;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about, version)]
struct Cli {
    /// Log filter, e.g. `info` or `mapring=debug`.
    #[arg(long, default_value = "info", env = "MAPRING_LOG")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a ring node.
    Server(ServerArgs),
    /// Start the standalone name directory.
    Directory(DirectoryArgs),
    /// Submit a job through an ephemeral node and wait for its results.
    Submit(SubmitArgs),
    /// Ask a node for the status of a job it coordinates.
    Status(StatusArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Address to listen on.
    #[arg(long, short = 'l', default_value = "127.0.0.1:4500", env = "MAPRING_LISTEN")]
    listen: SocketAddr,

    /// Address of the name directory.
    #[arg(long, short = 'd', env = "MAPRING_DIRECTORY")]
    directory: SocketAddr,

    /// Optional explicit bootstrap peer; the directory anchor is used
    /// otherwise.
    #[arg(long, short = 'b')]
    bootstrap: Option<SocketAddr>,
}

#[derive(Args, Debug)]
struct DirectoryArgs {
    #[arg(long, short = 'l', default_value = "127.0.0.1:4400", env = "MAPRING_DIRECTORY")]
    listen: SocketAddr,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Address of the name directory.
    #[arg(long, short = 'd', env = "MAPRING_DIRECTORY")]
    directory: SocketAddr,

    /// Listen address of the ephemeral coordinator node.
    #[arg(long, default_value = "127.0.0.1:0")]
    listen: SocketAddr,

    /// Kernel to run, resolved against the worker registries.
    #[arg(long, short = 'k', default_value = "wc")]
    kernel: String,

    /// Input file; one item per line.
    input: PathBuf,

    /// Per-job memory cap in bytes.
    #[arg(long)]
    memory_cap: Option<u64>,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// The coordinator node to ask.
    #[arg(long, short = 'n')]
    node: SocketAddr,

    /// Job id as printed by submit.
    job: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log))
        .init();

    match cli.command {
        Command::Server(args) => run_server(args).await,
        Command::Directory(args) => run_directory(args).await,
        Command::Submit(args) => run_submit(args).await,
        Command::Status(args) => run_status(args).await,
    }
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let config = Config::from_env();
    let client: Arc<dyn RpcClient> = Arc::new(TcpClient::new(config.request_timeout()));
    let directory = Arc::new(RemoteDirectory::new(args.directory, config.request_timeout()));

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    let addr = listener.local_addr()?;

    let node = Node::new(addr, client, directory, config)?;
    tracing::info!("node {} listening on {}", node.me(), addr);

    node.bootstrap().await?;
    if let Some(peer) = args.bootstrap {
        node.join(peer).await?;
    }
    node.clone().spawn_maintenance();

    server::serve(listener, node).await?;
    Ok(())
}

async fn run_directory(args: DirectoryArgs) -> anyhow::Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    tracing::info!("directory listening on {}", args.listen);
    mapring::directory::serve_directory(listener, Arc::new(MemDirectory::new())).await?;
    Ok(())
}

async fn run_submit(args: SubmitArgs) -> anyhow::Result<()> {
    let config = Config::from_env();
    let client: Arc<dyn RpcClient> = Arc::new(TcpClient::new(config.request_timeout()));
    let directory = Arc::new(RemoteDirectory::new(args.directory, config.request_timeout()));

    // the ring must already exist somewhere
    let anchor = match directory.lookup(RING_NAME).await {
        Ok(anchor) => anchor,
        Err(_) => {
            eprintln!("no ring member reachable through {}", args.directory);
            std::process::exit(2);
        }
    };

    let listener = TcpListener::bind(args.listen).await?;
    let addr = listener.local_addr()?;
    let stabilize_period = config.stabilize_period();
    let memory_cap = args.memory_cap.or(config.memory_cap);
    let options = JobOptions {
        items_per_chunk: config.items_per_chunk,
        task_timeout_ms: config.max_task_timeout_ms,
        max_attempts: config.max_task_attempts,
        memory_cap,
    };

    let node = Node::new(addr, client, directory, config)?;
    tokio::spawn(server::serve(listener, node.clone()));

    if node.join(anchor).await.is_err() {
        eprintln!("no ring member reachable at {anchor}");
        std::process::exit(2);
    }
    node.bootstrap().await?;
    node.clone().spawn_maintenance();
    // let a couple of stabilization rounds integrate us before dispatching
    tokio::time::sleep(2 * stabilize_period).await;

    let raw = std::fs::read_to_string(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let input: Vec<(Bytes, Bytes)> = raw
        .lines()
        .enumerate()
        .map(|(i, line)| {
            (
                Bytes::from(i.to_string()),
                Bytes::copy_from_slice(line.as_bytes()),
            )
        })
        .collect();

    let job = node.submit(input, &args.kernel, options)?;
    println!("job {job}");

    match node.await_results(job).await {
        Ok(results) => {
            let mut lines: Vec<String> = results
                .iter()
                .map(|(k, v)| format!("{}\t{}", printable(k), printable(v)))
                .collect();
            lines.sort();
            for line in lines {
                println!("{line}");
            }
            Ok(())
        }
        Err(Error::JobFailed(reason)) => {
            eprintln!("job failed: {reason}");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_status(args: StatusArgs) -> anyhow::Result<()> {
    let config = Config::from_env();
    let client = TcpClient::new(config.request_timeout());
    let job: JobId = args.job.parse().context("parsing job id")?;

    let me = mapring::NodeRef::new("127.0.0.1:0".parse().unwrap());
    let response = client
        .call(args.node, Envelope {
            from: me,
            request: Request::TaskStatus { job },
        })
        .await;

    match response {
        Ok(Response::JobStatus(Some(status))) => {
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Ok(Response::JobStatus(None)) => {
            eprintln!("job {job} unknown at {}", args.node);
            std::process::exit(1);
        }
        Ok(other) => anyhow::bail!("unexpected response: {other:?}"),
        Err(e) => {
            eprintln!("cannot reach {}: {e}", args.node);
            std::process::exit(2);
        }
    }
}

/// Render a value for the terminal: 8-byte values as integers (the word
/// count convention), utf-8 as text, anything else as hex.
fn printable(raw: &Bytes) -> String {
    if raw.len() == 8 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        return u64::from_be_bytes(buf).to_string();
    }
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => raw.iter().map(|b| format!("{b:02x}")).collect(),
    }
}
