pub mod buffer;
pub mod engine;
pub mod session;
pub mod sink;

// Re-export commonly used types for convenience
pub use buffer::{BackpressureBuffer, BufferConfig, BufferError, BufferStats, FlowSignal};
pub use engine::{EngineError, EngineEvent, EngineFactory, SpeechEngine, Transcript};
pub use session::{BackoffPolicy, ResilientSession, SessionError, SessionState};
pub use sink::{AudioSink, ChannelSink, SinkError};
