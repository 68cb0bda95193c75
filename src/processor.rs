//! The assembled stage: one HTTP request per message of a batch.

use crate::config::{ConfigError, ProcessorConfig};
use crate::message::{Batch, Message};
use crate::pipeline::dispatcher::{BatchDispatcher, DispatchError, ExecutionMode, MessageStage};
use crate::pipeline::invoker::{RequestInvoker, RequestOutcome};
use crate::pipeline::mapper::ResponseMapper;
use crate::pipeline::transport::{ReqwestTransport, Transport};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Invoke then map, for a single message.
pub struct RequestStage<T> {
    invoker: RequestInvoker<T>,
    mapper: ResponseMapper,
}

impl<T: Transport> RequestStage<T> {
    pub fn new(invoker: RequestInvoker<T>, mapper: ResponseMapper) -> Self {
        Self { invoker, mapper }
    }
}

#[async_trait::async_trait]
impl<T: Transport> MessageStage for RequestStage<T> {
    async fn process(&self, message: Message) -> Message {
        let outcome = self.invoker.invoke(&message).await;
        if let RequestOutcome::Failure(failure) = &outcome {
            warn!(
                status = ?failure.status,
                attempts = failure.attempts,
                reason = ?failure.reason,
                "request failed"
            );
        }
        self.mapper.apply(message, outcome)
    }
}

/// Performs one outbound request per message, isolating failures to the
/// message they belong to.
pub struct HttpProcessor<T = ReqwestTransport> {
    dispatcher: BatchDispatcher<RequestStage<T>>,
}

impl HttpProcessor<ReqwestTransport> {
    /// Validate `config` and build a processor backed by `reqwest`.
    pub fn new(config: &ProcessorConfig) -> Result<Self, ConfigError> {
        let transport = ReqwestTransport::new(config.timeout()?).map_err(ConfigError::Client)?;
        Self::with_transport(config, transport)
    }
}

impl<T: Transport + 'static> HttpProcessor<T> {
    /// Validate `config` and build a processor over a caller-supplied transport.
    pub fn with_transport(config: &ProcessorConfig, transport: T) -> Result<Self, ConfigError> {
        config.timeout()?;
        let template = config.request_template()?;
        let policy = config.retry_policy()?;
        let mapper = config.response_mapper()?;

        let invoker = RequestInvoker::new(transport, template, policy)
            .with_successful_on(config.successful_on.clone());
        let stage = Arc::new(RequestStage::new(invoker, mapper));

        Ok(Self {
            dispatcher: BatchDispatcher::new(stage, config.execution_mode()),
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        self.dispatcher.mode()
    }

    /// Process a batch. The output always has the input's length and order;
    /// failed elements carry an error marker.
    #[tracing::instrument(
        name = "http_batch",
        skip_all,
        fields(batch_size = batch.len(), mode = %self.dispatcher.mode())
    )]
    pub async fn process_batch(&self, batch: Batch) -> Batch {
        let output = self.dispatcher.dispatch(batch).await;
        log_summary(&output);
        output
    }

    /// Process a batch, abandoning it when `cancel` fires.
    #[tracing::instrument(
        name = "http_batch",
        skip_all,
        fields(batch_size = batch.len(), mode = %self.dispatcher.mode())
    )]
    pub async fn process_batch_with_cancel(
        &self,
        batch: Batch,
        cancel: &CancellationToken,
    ) -> Result<Batch, DispatchError> {
        let output = self.dispatcher.dispatch_with_cancel(batch, cancel).await?;
        log_summary(&output);
        Ok(output)
    }
}

fn log_summary(output: &Batch) {
    let failed = output.iter().filter(|m| m.has_error()).count();
    info!(processed = output.len(), failed, "batch processed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageError;
    use crate::pipeline::invoker::tests::{ok, FakeTransport};
    use crate::pipeline::mapper::STATUS_CODE_KEY;
    use crate::pipeline::transport::TransportError;

    fn config() -> ProcessorConfig {
        let mut config = ProcessorConfig::new("http://example.test/post");
        config.retry_period_ms = 1;
        config
    }

    #[tokio::test]
    async fn construction_errors_surface_before_dispatch() {
        let mut config = config();
        config.url = r#"http://example.test/${! nope() }"#.to_string();
        let transport = FakeTransport::new(vec![ok(200, "")]);

        let result = HttpProcessor::with_transport(&config, transport);
        assert!(matches!(result, Err(ConfigError::Template { .. })));
    }

    #[tokio::test]
    async fn mixed_outcomes_keep_cardinality() {
        let transport = FakeTransport::new(vec![
            ok(201, "first"),
            ok(404, ""),
            Err(TransportError::Timeout),
        ]);
        let processor = HttpProcessor::with_transport(&config(), transport).unwrap();

        let input = vec![
            Message::new("a").with_meta("foo", "bar"),
            Message::new("b").with_meta("foo", "bar"),
            Message::new("c"),
        ];
        let out = processor.process_batch(input).await;

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].payload().as_ref(), b"first");
        assert_eq!(out[0].meta(STATUS_CODE_KEY), Some("201"));
        assert_eq!(out[0].meta("foo"), Some("bar"));

        assert_eq!(out[1].payload().as_ref(), b"b");
        assert_eq!(out[1].meta(STATUS_CODE_KEY), Some("404"));
        assert_eq!(out[1].meta("foo"), Some("bar"));
        assert_eq!(out[1].error(), Some(&MessageError::UnexpectedStatus { code: 404 }));

        assert_eq!(out[2].payload().as_ref(), b"c");
        assert_eq!(out[2].meta(STATUS_CODE_KEY), None);
        assert!(matches!(out[2].error(), Some(MessageError::Transport { .. })));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_batch() {
        let transport = FakeTransport::new(vec![ok(200, "")]);
        let processor = HttpProcessor::with_transport(&config(), transport).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = processor
            .process_batch_with_cancel(vec![Message::new("a")], &cancel)
            .await;
        assert_eq!(result, Err(DispatchError::Cancelled));
    }

    #[test]
    fn reqwest_processor_builds_from_defaults() {
        let processor = HttpProcessor::new(&config()).unwrap();
        assert_eq!(processor.mode(), ExecutionMode::Serial);
    }
}
