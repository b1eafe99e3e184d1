use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use image::RgbImage;
use livescan_core::{EnsemblePipeline, ModelAvailability, Prediction};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),
}

/// Messages sent from connection handlers to the engine thread.
enum EngineRequest {
    Predict {
        image: RgbImage,
        reply: oneshot::Sender<Option<Prediction>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    availability: ModelAvailability,
}

impl EngineHandle {
    /// Which models the engine was started with.
    pub fn availability(&self) -> ModelAvailability {
        self.availability
    }

    /// Classify a frame on the engine thread.
    ///
    /// Returns `None` when the ensemble cannot produce a result, when the
    /// engine is gone, or when `timeout` elapses first (queueing included).
    pub async fn predict(&self, image: RgbImage, timeout: Duration) -> Option<Prediction> {
        match self.request(image, timeout).await {
            Ok(prediction) => prediction,
            Err(e) => {
                tracing::warn!(error = %e, "predict request dropped");
                None
            }
        }
    }

    async fn request(
        &self,
        image: RgbImage,
        timeout: Duration,
    ) -> Result<Option<Prediction>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let round_trip = async {
            self.tx
                .send(EngineRequest::Predict {
                    image,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            reply_rx.await.map_err(|_| EngineError::ChannelClosed)
        };

        tokio::time::timeout(timeout, round_trip)
            .await
            .map_err(|_| EngineError::Timeout(timeout))?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the pipeline, so inference is serialized: at most one
/// frame is in flight and the rest wait in a queue of `queue_depth`.
pub fn spawn_engine(
    pipeline: EnsemblePipeline,
    queue_depth: usize,
) -> Result<EngineHandle, EngineError> {
    let availability = pipeline.availability();
    let (tx, rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));

    std::thread::Builder::new()
        .name("livescan-engine".into())
        .spawn(move || run_engine(pipeline, rx))
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, availability })
}

fn run_engine(mut pipeline: EnsemblePipeline, mut rx: mpsc::Receiver<EngineRequest>) {
    tracing::info!("engine thread started");
    while let Some(req) = rx.blocking_recv() {
        match req {
            EngineRequest::Predict { image, reply } => {
                // Caller already gave up (timeout or disconnect).
                if reply.is_closed() {
                    tracing::debug!("skipping abandoned predict request");
                    continue;
                }
                let started = std::time::Instant::now();
                // A panic in a model backend drops the frame, not the engine.
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| pipeline.predict(&image)));
                let result = outcome.unwrap_or_else(|payload| {
                    tracing::error!(
                        panic = panic_message(payload.as_ref()),
                        "inference panicked; frame dropped"
                    );
                    None
                });
                tracing::debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    produced = result.is_some(),
                    "predict handled"
                );
                let _ = reply.send(result);
            }
        }
    }
    tracing::info!("engine thread exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}
