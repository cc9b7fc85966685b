// harvester: offline HTTP conversation extraction from packet captures.
//
// The pipeline, per capture file:
//
//   pcap -> TCP reassembly (capnet-core) -> per-direction byte stream
//        -> TimeCaptureReader -> SavePointReader -> speculative decoders
//        -> (HTTP request | HTTP response | FastCGI records)
//        -> ConversationStore -> HAR builder -> JSON on stdout
//
// Flows decode concurrently, one task each; FastCGI spawns a child task per
// embedded message.  Everything joins before the HAR is built.

pub mod conversation;
pub mod decoder;
pub mod dispatch;
pub mod fcgi;
pub mod har;
pub mod http;
pub mod pipe;
pub mod savepoint;
pub mod stream;

pub use conversation::{Conversation, ConversationStore};
pub use decoder::{decode_stream, run_flow};
pub use savepoint::SavePointReader;
pub use stream::{BufSource, FlowReader, TimeCaptureReader};
