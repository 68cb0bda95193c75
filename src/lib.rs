// src/lib.rs
pub mod cli;
pub mod config;
pub mod message;
pub mod native;
pub mod pipeline;
mod processor;
pub mod template;

pub use config::{ConfigError, ProcessorConfig};
pub use message::{Batch, Message, MessageError, MessageRecord};
pub use pipeline::{DispatchError, ExecutionMode, STATUS_CODE_KEY};
pub use processor::{HttpProcessor, RequestStage};

// Re-export for use by embedders and tests
pub use bytes::Bytes;
pub use tokio_util::sync::CancellationToken;
pub use tracing;
