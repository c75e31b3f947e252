pub mod engine;
pub mod http;
pub mod loopback;

pub use engine::{EngineError, MediaEngine, MediaHandle};
pub use http::{HttpEngineConfig, HttpMediaEngine};
pub use loopback::{LoopbackEngine, LoopbackOp};
