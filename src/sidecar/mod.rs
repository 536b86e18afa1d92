//! Sidecar plumbing: everything needed to get from "no analysis process" to
//! "a byte stream to a running analysis process", and back.
//!
//! # Architecture
//!
//! - `port`: picks the local port the sidecar will listen on
//! - `process`: spawns the sidecar in its own process group and kills the group
//! - `connect`: retries a TCP connection until a deadline
//! - `bridge`: carries bytes between the protocol layer and the socket
//!
//! None of these own any state beyond the handles they return; the session
//! coordinator sequences them.

pub mod bridge;
pub mod connect;
pub mod port;
pub mod process;

pub use bridge::{Bridge, BridgeHandle, CloseReason};
pub use connect::{ConnectOutcome, ConnectPolicy, Connection, connect};
pub use port::{AllocatedPort, PortAllocator};
pub use process::{
    ProcessExit, SpawnSpec, SupervisedProcess, TerminatePolicy, TreeSignal, kill_process_tree,
    spawn,
};
