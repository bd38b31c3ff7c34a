// ABOUTME: Cluster transport: pooled fan-out sender, heartbeat broadcaster, admission gate
//
// Three pieces share one problem: multiplexing a bounded, reusable resource
// across concurrent callers while tolerating failure of individual peers.
//
// Key components:
// - pool: generic bounded pool with RAII loans and an idle reaper
// - sender: fan-out over a pooled MultiPointSend, failure aggregation, retry policy
// - tcp_sender / receiver / frame: the concrete TCP resource and its listener
// - heartbeat / announcement: multicast load announcements with lazy socket recovery
// - membership: proxy-side listener turning announcements into live peers
// - gate: semaphore-backed admission control
// - catalog / config / metrics / error / peer: shared plumbing

pub mod announcement;
pub mod catalog;
pub mod config;
pub mod error;
pub mod frame;
pub mod gate;
pub mod heartbeat;
pub mod membership;
pub mod metrics;
pub mod peer;
pub mod pool;
pub mod receiver;
pub mod sender;
pub mod tcp_sender;

// Re-exports for convenient access
pub use announcement::Announcement;
pub use catalog::{Component, MessageCatalog};
pub use config::{BlockingMode, GateConfig, HeartbeatConfig, PoolConfig, SenderConfig};
pub use error::{FailureKind, FailureReport, FaultCause, FaultRecord};
pub use gate::{AdmissionDenied, AdmissionGate, DenialReason, GateError, GatePermit};
pub use heartbeat::{
    DatagramTransport, HeartbeatBroadcaster, HeartbeatError, HeartbeatService, HeartbeatState, LoadSource,
    MulticastOpener, TransportOpener,
};
pub use membership::{HeartbeatListener, ListenerError, Membership};
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use peer::{Peer, PeerId};
pub use pool::{
    PoolError, PoolStatus, Pooled, PooledResource, ReapSummary, ResourceFactory, ResourceId, ResourcePool, Wait,
};
pub use receiver::{FrameReceiver, ReceivedFrame};
pub use sender::{FanoutSender, MultiPointSend, NoRetry, RetryPolicy, RetryTransient};
pub use tcp_sender::{TcpMultiSender, TcpSenderFactory};
