// fcgi-dump: pretty-print the HTTP exchanges embedded in raw FastCGI
// stream files.  Mostly a debugging aid for captures where the FastCGI
// payload has already been carved out of the TCP stream.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use capnet_core::FlowKey;
use clap::{Arg, Command};

use harvester::conversation::ConversationStore;
use harvester::fcgi;
use harvester::{BufSource, SavePointReader, TimeCaptureReader};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = Command::new("fcgi-dump")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Dumps the HTTP exchanges carried by raw FastCGI stream files")
        .arg(
            Arg::new("file")
                .help("Files containing raw FastCGI records")
                .value_name("file")
                .value_parser(clap::value_parser!(PathBuf))
                .num_args(1..)
                .required(true),
        )
        .get_matches();

    let files: Vec<PathBuf> = matches
        .get_many::<PathBuf>("file")
        .expect("clap enforces at least one file")
        .cloned()
        .collect();

    let mut failed = false;
    for path in &files {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                eprintln!("{}: {e}", path.display());
                failed = true;
                continue;
            }
        };
        if let Err(e) = dump(path, data).await {
            eprintln!("{}: {e}", path.display());
            failed = true;
        }
    }
    if failed {
        process::exit(1);
    }
}

async fn dump(path: &PathBuf, data: Vec<u8>) -> Result<(), String> {
    // The demultiplexer wants a flow identity; a carved file has none.
    let unspecified = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    let flow = FlowKey::new(unspecified, 0, unspecified, 0);

    let store = Arc::new(ConversationStore::new());
    let mut source = SavePointReader::new(TimeCaptureReader::new(BufSource::new(data)));
    let outcome = fcgi::decode(&mut source, &flow, &store).await;

    for conv in store.take_conversations() {
        if let Some(req) = &conv.request {
            println!("{} {} {}", req.method, req.target, req.proto);
            if let Some(host) = &req.host {
                println!("Host: {host}");
            }
            for h in &req.headers {
                println!("{}: {}", h.name, h.value);
            }
            println!("[{} request body bytes]", conv.request_body.len());
        } else {
            println!("[no request seen in {}]", path.display());
        }
        if let Some(resp) = &conv.response {
            println!("-> {} {} {}", resp.proto, resp.status, resp.reason);
            for h in &resp.headers {
                println!("   {}: {}", h.name, h.value);
            }
            println!("   [{} response body bytes]", conv.response_body.len());
        }
        for err in &conv.errors {
            println!("!! stderr: {err}");
        }
        println!();
    }
    outcome.map_err(|e| e.to_string())
}
