// capnet-core: offline capture ingestion.
//
// Takes pcap/pcapng files apart into raw packets, decodes the link/IP/TCP
// layering, and reassembles each directed TCP flow into an ordered byte
// stream with wire timestamps.  Consumers receive one segment channel per
// flow; the channel closing is the only end-of-stream signal.

pub mod assembly;
pub mod decode;
pub mod flow;
pub mod pcap;

pub use assembly::{Assembler, NewFlow, Segment};
pub use decode::{TcpPacket, decode_packet};
pub use flow::{FlowKey, Pair};
pub use pcap::{CaptureReader, LinkType, PcapError, RawPacket};
