use facecheck_core::model::ModelStatus;
use facecheck_core::{CancelToken, Image, ModelError, Pipeline, PipelineError, PipelineOutcome};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("pipeline did not finish within {0:?}")]
    Timeout(Duration),
    #[error("model unavailable: {0}")]
    ModelLoad(#[source] ModelError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from command handlers to the engine thread.
enum EngineRequest {
    Process {
        image: Image,
        cancel: CancelToken,
        reply: oneshot::Sender<Result<PipelineOutcome, PipelineError>>,
    },
    Status {
        reply: oneshot::Sender<Vec<ModelStatus>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Run the pipeline on `image`.
    ///
    /// On timeout the run is cancelled at its next stage boundary and
    /// [`EngineError::Timeout`] is returned without waiting for it.
    pub async fn process(
        &self,
        image: Image,
        timeout: Duration,
    ) -> Result<PipelineOutcome, EngineError> {
        let cancel = CancelToken::new();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Process {
                image,
                cancel: cancel.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(reply) => Ok(reply.map_err(|_| EngineError::ChannelClosed)??),
            Err(_) => {
                cancel.cancel();
                tracing::warn!(?timeout, "pipeline timed out");
                Err(EngineError::Timeout(timeout))
            }
        }
    }

    /// Load state of every model.
    pub async fn status(&self) -> Result<Vec<ModelStatus>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// What to do when a model cannot be loaded at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Fail `spawn_engine`; no request is ever served.
    Required,
    /// Log and keep serving, leaving the failure visible in status.
    Report,
}

/// Spawn the engine on a dedicated OS thread that owns `pipeline`.
///
/// Every model is loaded before the thread starts (fail-fast under
/// [`LoadPolicy::Required`]).
pub fn spawn_engine(
    mut pipeline: Pipeline,
    policy: LoadPolicy,
) -> Result<EngineHandle, EngineError> {
    match pipeline.warm_up() {
        Ok(()) => tracing::info!("models loaded"),
        Err(e) if policy == LoadPolicy::Required => return Err(EngineError::ModelLoad(e)),
        Err(e) => tracing::warn!(error = %e, "model warm-up failed"),
    }

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facecheck-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Process {
                        image,
                        cancel,
                        reply,
                    } => {
                        let result = image
                            .view()
                            .map_err(PipelineError::from)
                            .and_then(|view| pipeline.run(&view, &cancel));
                        if reply.send(result).is_err() {
                            tracing::debug!("caller went away before the result was ready");
                        }
                    }
                    EngineRequest::Status { reply } => {
                        let _ = reply.send(pipeline.status());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}
