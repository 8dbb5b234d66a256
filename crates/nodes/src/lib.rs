//! Node Registry & Invoke Router (spec §3, §4.G).

pub mod registry;
pub mod router;

pub use registry::{ConnectedNode, NodeInfo, NodeRegistry, NodeSink, Platform};
pub use router::{InvokeResult, InvokeRouter, NodeEvent};
