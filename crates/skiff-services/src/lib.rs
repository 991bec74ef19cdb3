//! skiff-services — the async half of the stack: reliability, channel
//! multiplexing, handshake, resume persistence, and the transfer orchestrator
//! that ties them together.

pub mod channel;
pub mod command;
pub mod events;
pub mod handshake;
pub mod negotiate;
pub mod orchestrator;
pub mod registry;
pub mod reliability;
pub mod resume;
pub mod session;
pub mod transport;

pub use channel::{spawn_channel, ChannelConfig, ChannelHandle, ChannelInbound, CloseReason};
pub use command::{dispatch, Command, CommandResponse};
pub use events::{event_channel, EventSink, EventStreams, LifecycleEvent, ProgressEvent, TransferStatus};
pub use handshake::{perform_handshake, HandshakeConfig, HandshakeError};
pub use negotiate::{negotiate_chunk_size, TransportProfile};
pub use orchestrator::{BlobSender, OrchestratorConfig, TransferError, TransferOrchestrator};
pub use registry::{TransferRegistry, TransferSnapshot};
pub use reliability::ReliabilityConfig;
pub use resume::{Direction, ResumeState, ResumeStore};
pub use session::{establish, run_session, serve_connection, Session, SessionConfig, SessionError, SessionSupervisor};
pub use transport::{Connector, ReconnectPolicy, TcpConnector};
