//! Distributed mode: one master relays the global target to workers over
//! newline-delimited JSON frames and merges their heartbeat stats.

pub mod api;
pub mod master;
pub mod protocol;
pub mod transport;
pub mod worker;

pub use api::{router, ApiState};
pub use master::{split_by_weight, LivenessReport, MasterNode, WorkerStatus, WorkerView};
pub use protocol::{decode, encode, Message, WorkerState, PROTOCOL_VERSION};
pub use transport::{FrameReader, FrameWriter};
pub use worker::WorkerNode;
