//! Application orchestrator: wires sources, storage and the relay together
//! and serves the stdin command channel.

use std::sync::Arc;

use filerelay_http_source::HttpSource;
use filerelay_transfer::{
    CompositeSource, DirectorySink, FileSource, Notifier, NotifyError, Relay, Sink,
    SourceDescriptor, StaticSinkProvider, StatusUpdate, TransferEngine, TransferRequest,
};
use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;

use crate::config::{Config, expand_home};

/// Notifier that writes status updates to the log.
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify<'a>(&'a self, update: &'a StatusUpdate) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            tracing::info!(target_message = %update.target, "{}", update.text);
            Ok(())
        })
    }
}

/// A parsed line of the command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    /// `get <session> <url|path> [name]`
    Get(TransferRequest),
    /// `cancel <session>`
    Cancel(String),
    Status,
    Quit,
}

impl Command {
    /// Parses one input line. Blank lines yield `Ok(None)`.
    fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let command = match verb {
            "get" => {
                let session = words.next().ok_or("usage: get <session> <url|path> [name]")?;
                let source = words.next().ok_or("usage: get <session> <url|path> [name]")?;
                let name: Vec<&str> = words.collect();

                let descriptor = if source.starts_with("http://") || source.starts_with("https://") {
                    SourceDescriptor::Url(source.to_string())
                } else {
                    SourceDescriptor::Handle(source.to_string())
                };
                let mut request = TransferRequest::new(session, descriptor);
                if !name.is_empty() {
                    request = request.with_name(name.join(" "));
                }
                Command::Get(request)
            }
            "cancel" => Command::Cancel(words.next().ok_or("usage: cancel <session>")?.to_string()),
            "status" => Command::Status,
            "quit" | "exit" => Command::Quit,
            other => return Err(format!("unknown command: {other}")),
        };
        Ok(Some(command))
    }
}

/// Builds the relay described by `config`.
fn build_relay(config: &Config) -> anyhow::Result<Relay> {
    let transfer = config.transfer.to_transfer_config();

    let http = HttpSource::new(&config.http.to_source_config())?;
    let files = FileSource::new(
        config.storage.attachments_dir.as_deref().map(expand_home),
        transfer.chunk_size,
    );
    let source = CompositeSource::new(Arc::new(http), Arc::new(files));

    let mut sink = DirectorySink::new(expand_home(&config.storage.output_dir))
        .with_conflict_policy(config.storage.on_conflict);
    if let Some(base) = &config.storage.public_base_url {
        sink = sink.with_public_base_url(base.clone());
    }
    let sink: Arc<dyn Sink> = Arc::new(sink);

    let engine = TransferEngine::new(Arc::new(source), Arc::new(ConsoleNotifier), transfer);
    Ok(Relay::new(engine, Arc::new(StaticSinkProvider::new(sink))))
}

/// Runs the agent until `quit`, end of input or Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let relay = build_relay(&config)?;
    let mut transfers = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    tracing::info!("agent ready; commands: get <session> <url|path> [name], cancel <session>, status, quit");

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, shutting down");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            tracing::info!("input closed, shutting down");
            break;
        };

        match Command::parse(&line) {
            Ok(None) => {}
            Ok(Some(Command::Get(request))) => match relay.submit(request) {
                Ok(handle) => {
                    transfers.spawn(async move {
                        match handle.await {
                            Ok(result) => println!("[{}] {}", result.session, result.summary()),
                            Err(e) => tracing::error!("transfer task failed: {e}"),
                        }
                    });
                }
                Err(e) => println!("{e}"),
            },
            Ok(Some(Command::Cancel(session))) => {
                if !relay.cancel(&session) {
                    println!("no active transfer for {session}");
                }
            }
            Ok(Some(Command::Status)) => {
                println!("{}", serde_json::to_string_pretty(&relay.active())?);
            }
            Ok(Some(Command::Quit)) => break,
            Err(e) => println!("{e}"),
        }
    }

    // -- Graceful shutdown --
    let active = relay.active();
    if !active.is_empty() {
        tracing::info!(count = active.len(), "cancelling active transfers");
        for snapshot in &active {
            relay.cancel(&snapshot.session);
        }
    }
    while transfers.join_next().await.is_some() {}

    Ok(())
}
