// harvester: read pcap/pcapng captures, emit a HAR 1.2 document on stdout.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use capnet_core::{Assembler, CaptureReader, PcapError};
use clap::{Arg, Command};
use tokio::sync::mpsc;
use tracing::info;

use harvester::conversation::ConversationStore;
use harvester::{dispatch, har};

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error("{path}: {source}")]
    Capture {
        path: PathBuf,
        #[source]
        source: PcapError,
    },
    #[error("decoder task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[tokio::main]
async fn main() {
    // All diagnostics go to stderr; stdout carries the HAR JSON.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = Command::new("harvester")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Extracts the HTTP conversations from packet captures into a HAR document")
        .arg(
            Arg::new("capture")
                .help("pcap/pcapng capture files, processed sequentially into one HAR")
                .value_name("capture-file")
                .value_parser(clap::value_parser!(PathBuf))
                .num_args(1..)
                .required(true),
        )
        .get_matches();

    let files: Vec<PathBuf> = matches
        .get_many::<PathBuf>("capture")
        .expect("clap enforces at least one file")
        .cloned()
        .collect();

    let har = match run(&files).await {
        Ok(har) => har,
        Err(e) => {
            eprintln!("FATAL: {e}");
            process::exit(1);
        }
    };

    let stdout = std::io::stdout().lock();
    if let Err(e) = serde_json::to_writer_pretty(stdout, &har) {
        eprintln!("FATAL: writing HAR: {e}");
        process::exit(1);
    }
    println!();
}

async fn run(files: &[PathBuf]) -> Result<har_model::Har, RunError> {
    let (announce_tx, announce_rx) = mpsc::channel(64);
    let store = Arc::new(ConversationStore::new());
    let dispatcher = tokio::spawn(dispatch::run(announce_rx, Arc::clone(&store)));

    let mut assembler = Assembler::new(announce_tx);
    for path in files {
        let mut capture = CaptureReader::open(path).map_err(|source| RunError::Capture {
            path: path.clone(),
            source,
        })?;
        let mut packets = 0usize;
        loop {
            match capture.next_packet() {
                Ok(Some(pkt)) => {
                    packets += 1;
                    assembler.feed(&pkt).await;
                }
                Ok(None) => break,
                Err(source) => {
                    return Err(RunError::Capture {
                        path: path.clone(),
                        source,
                    });
                }
            }
        }
        info!(capture = %path.display(), packets, "capture processed");
    }
    assembler.flush().await;
    drop(assembler);

    let flows = dispatcher.await?;
    let conversations = store.take_conversations();
    info!(flows, conversations = conversations.len(), "building HAR");
    Ok(har::build(conversations))
}
