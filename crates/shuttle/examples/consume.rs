//! Example: print matching events from Jetstream or the firehose
//!
//! Usage:
//!   cargo run --example consume
//!   cargo run --example consume -- --variant firehose --collection 'app.bsky.feed.*'
//!   cargo run --example consume -- --config shuttle.json --cursor-file ./cursor
//!
//! Set `SHUTTLE_LOG=shuttle=debug` for connection logs.

use std::path::PathBuf;

use clap::Parser;
use miette::IntoDiagnostic;
use shuttle::{
    Config, Consumer, CursorConfig, Dispatcher, Event, EventKind, EventPayload, FnSignal,
    StreamVariant,
};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(author, version, about = "Print events from an atproto event stream")]
struct Args {
    /// JSON configuration file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stream variant: jetstream (a) or firehose (b)
    #[arg(short, long)]
    variant: Option<StreamVariant>,

    /// Jetstream URL, e.g. wss://jetstream1.us-east.fire.hose.cam
    #[arg(long)]
    jetstream_url: Option<Url>,

    /// Firehose relay host, e.g. bsky.network
    #[arg(long)]
    firehose_host: Option<String>,

    /// Collection pattern to print; repeatable, `*` wildcards allowed
    #[arg(short, long = "collection")]
    collections: Vec<String>,

    /// Starting cursor; 0 starts from the live tip
    #[arg(short, long)]
    cursor: Option<i64>,

    /// Persist the cursor in this file
    #[arg(long)]
    cursor_file: Option<PathBuf>,
}

fn load_config(args: &Args) -> miette::Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).into_diagnostic()?;
            serde_json::from_str(&text).into_diagnostic()?
        }
        None => Config::default(),
    };
    if let Some(variant) = args.variant {
        config.variant = variant;
    }
    if let Some(url) = &args.jetstream_url {
        config.jetstream_url = url.clone();
    }
    if let Some(host) = &args.firehose_host {
        config.firehose_host = host.into();
    }
    if let Some(path) = &args.cursor_file {
        config.cursor = CursorConfig::file(path);
    }
    Ok(config)
}

fn print_event(event: &Event) {
    match &event.payload {
        EventPayload::Commit(commit) => {
            println!(
                "Commit | did={} cursor={} op={} path={} cid={:?}",
                event.author_id,
                event.time_us,
                commit.operation,
                commit.path(),
                commit.cid
            );
        }
        EventPayload::Identity(identity) => {
            println!(
                "Identity | did={} cursor={} handle={:?}",
                event.author_id, event.time_us, identity.handle
            );
        }
        EventPayload::Account(account) => {
            println!(
                "Account | did={} cursor={} active={} status={:?}",
                event.author_id, event.time_us, account.active, account.status
            );
        }
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_env_filter(EnvFilter::from_env("SHUTTLE_LOG"))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let mut printer = FnSignal::new("printer", EventKind::ALL, |event| {
        print_event(event);
        Ok(())
    });
    if !args.collections.is_empty() {
        printer = printer.collections(args.collections.iter().map(String::as_str));
    }
    let mut dispatcher = Dispatcher::new();
    dispatcher.register(printer)?;

    let mut consumer = Consumer::from_config(config, dispatcher)?;
    let stop = consumer.stop_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        println!("\nShutting down...");
        stop.stop();
    });

    println!("Streaming events (Ctrl-C to stop)...\n");
    consumer.run(args.cursor).await?;
    Ok(())
}
