use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use sc_engine::persist::load_metadata;
use sc_engine::{ChannelSink, EngineConfig, MemoryNetwork, SecretChatEngine, SinkEvent};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

#[derive(Parser)]
#[command(name = "sc-cli")]
#[command(about = "Secret chat engine demo and tooling", long_about = None)]
struct Cli {
    /// Engine configuration file (JSON). Defaults are used when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run two engines over the in-memory network and print what happens
    Demo {
        /// Number of messages alice sends before rekeying
        #[arg(short, long, default_value = "5")]
        messages: u64,

        /// Self-destruct timer for the demo messages, in seconds
        #[arg(long)]
        ttl: Option<u32>,

        /// Skip the manual rekey
        #[arg(long)]
        no_rekey: bool,

        /// Write session metadata here when done
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Open a chat and print both sides' key fingerprints
    Fingerprint,

    /// Print the effective configuration, or write it to a file
    Config {
        /// Destination file
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// List sessions from a saved metadata file
    Sessions {
        path: PathBuf,
    },
}

struct DemoPeer {
    engine: SecretChatEngine,
    events: UnboundedReceiver<SinkEvent>,
}

fn start_peer(net: &MemoryNetwork, id: &str, config: EngineConfig) -> Result<DemoPeer> {
    let (transport, inbound) = net.endpoint(id);
    let (sink, events) = ChannelSink::new();
    let engine = SecretChatEngine::new(config, Arc::new(transport), Arc::new(sink))?;
    engine.spawn_inbound_pump(inbound);
    Ok(DemoPeer { engine, events })
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(p) => EngineConfig::load(p)
            .with_context(|| format!("loading config from {}", p.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn describe(who: &str, event: &SinkEvent) -> String {
    match event {
        SinkEvent::Decrypted { seq, plaintext, .. } => {
            format!("{who}: #{seq} {:?}", String::from_utf8_lossy(plaintext))
        }
        SinkEvent::Discarded { seq, reason, .. } => format!("{who}: #{seq} discarded ({reason})"),
        SinkEvent::Expired(id) => format!("{who}: #{} ({:?}) self-destructed", id.seq, id.direction),
        SinkEvent::SessionTerminated { session_id } => format!("{who}: session {session_id} closed"),
    }
}

async fn next_event(who: &str, peer: &mut DemoPeer) -> Result<SinkEvent> {
    let event = tokio::time::timeout(Duration::from_secs(10), peer.events.recv())
        .await
        .map_err(|_| anyhow!("{who}: no event within 10s"))?
        .ok_or_else(|| anyhow!("{who}: event channel closed"))?;
    println!("{}", describe(who, &event));
    Ok(event)
}

async fn wait_for_generation(engines: [&SecretChatEngine; 2], session_id: &str, generation: u32) -> Result<()> {
    for _ in 0..500 {
        let done = engines.iter().all(|e| {
            e.snapshot(session_id)
                .map(|s| s.key_generation >= generation)
                .unwrap_or(false)
        });
        if done {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(anyhow!("rekey did not complete"))
}

async fn run_demo(
    config: EngineConfig,
    messages: u64,
    ttl: Option<u32>,
    rekey: bool,
    save: Option<PathBuf>,
) -> Result<()> {
    let net = MemoryNetwork::new();
    let mut alice = start_peer(&net, "alice", config.clone())?;
    let mut bob = start_peer(&net, "bob", config)?;

    let session = alice.engine.handshake("bob").await?;
    let sid = session.session_id.clone();
    println!("session {sid} established, key {}", session.key_id);

    for i in 1..=messages {
        alice
            .engine
            .send(&sid, format!("hello #{i}").as_bytes(), ttl)
            .await?;
        next_event("bob", &mut bob).await?;
    }

    if rekey {
        alice.engine.request_rekey(&sid).await?;
        wait_for_generation([&alice.engine, &bob.engine], &sid, 1).await?;
        let fp = alice
            .engine
            .fingerprint(&sid)
            .ok_or_else(|| anyhow!("session vanished"))?;
        println!("rekeyed: generation {}, key {}", fp.key_generation, fp.key_id);
        alice.engine.send(&sid, b"under the new key", ttl).await?;
        next_event("bob", &mut bob).await?;
    }

    bob.engine.send(&sid, b"got them all", None).await?;
    next_event("alice", &mut alice).await?;

    if let Some(ttl) = ttl.filter(|t| *t > 0) {
        // Bob reads everything so his copies start burning too.
        let last = bob
            .engine
            .snapshot(&sid)
            .map(|s| s.incoming_seq)
            .unwrap_or(0);
        for seq in 1..=last {
            bob.engine.mark_read(&sid, seq).await?;
        }
        println!("waiting {ttl}s for self-destruct");
        tokio::time::sleep(Duration::from_secs(u64::from(ttl) + 2)).await;
        while let Ok(event) = alice.events.try_recv() {
            println!("{}", describe("alice", &event));
        }
        while let Ok(event) = bob.events.try_recv() {
            println!("{}", describe("bob", &event));
        }
    }

    if let Some(path) = save {
        alice.engine.save_metadata(&path)?;
        println!("metadata written to {}", path.display());
    }

    alice.engine.terminate(&sid).await?;
    next_event("bob", &mut bob).await?;

    alice.engine.shutdown();
    bob.engine.shutdown();
    Ok(())
}

async fn run_fingerprint(config: EngineConfig) -> Result<()> {
    let net = MemoryNetwork::new();
    let alice = start_peer(&net, "alice", config.clone())?;
    let bob = start_peer(&net, "bob", config)?;

    let sid = alice.engine.handshake("bob").await?.session_id;
    let a = alice
        .engine
        .fingerprint(&sid)
        .ok_or_else(|| anyhow!("alice has no session"))?;
    let b = bob
        .engine
        .fingerprint(&sid)
        .ok_or_else(|| anyhow!("bob has no session"))?;

    println!("alice: {}", serde_json::to_string_pretty(&a)?);
    println!("bob:   {}", serde_json::to_string_pretty(&b)?);
    println!("match: {}", a == b);

    alice.engine.shutdown();
    bob.engine.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sc_engine=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    config.validate()?;

    match cli.command {
        Commands::Demo {
            messages,
            ttl,
            no_rekey,
            save,
        } => {
            info!(messages, ?ttl, "starting demo");
            run_demo(config, messages, ttl, !no_rekey, save).await?;
        }

        Commands::Fingerprint => run_fingerprint(config).await?,

        Commands::Config { out } => match out {
            Some(path) => {
                config.save(&path)?;
                println!("config written to {}", path.display());
            }
            None => println!("{}", serde_json::to_string_pretty(&config)?),
        },

        Commands::Sessions { path } => {
            let sessions = load_metadata(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&sessions)?);
        }
    }

    Ok(())
}
