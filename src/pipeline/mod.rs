// src/pipeline/mod.rs
pub mod dispatcher;
pub mod invoker;
pub mod mapper;
pub mod retry;
pub mod transport;

pub use dispatcher::{BatchDispatcher, DispatchError, ExecutionMode, MessageStage};
pub use invoker::{FailureReason, RequestFailure, RequestInvoker, RequestOutcome, RequestTemplate};
pub use mapper::{HeaderFilter, ResponseMapper, STATUS_CODE_KEY};
pub use retry::{BackoffStrategy, RetryPolicy, StatusMatcher};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError};
