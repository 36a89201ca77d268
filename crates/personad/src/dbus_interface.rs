use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;
use zbus::interface;

use crate::engine::{Engine, EngineError};

pub const BUS_NAME: &str = "org.persona.Analyzer1";
pub const OBJECT_PATH: &str = "/org/persona/Analyzer1";

/// D-Bus interface for the persona analysis daemon.
///
/// Bus name: org.persona.Analyzer1
/// Object path: /org/persona/Analyzer1
pub struct AnalyzerService {
    engine: Arc<Engine>,
}

impl AnalyzerService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

/// Client mistakes surface as InvalidArgs, everything else as Failed. Both
/// carry the JSON error report as the message.
fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    let body = err.report().to_json();
    if err.is_client_error() {
        tracing::info!(error = %err, "request rejected");
        zbus::fdo::Error::InvalidArgs(body)
    } else {
        tracing::error!(error = %err, "request failed");
        zbus::fdo::Error::Failed(body)
    }
}

fn to_json<T: serde::Serialize>(report: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(report).map_err(|e| zbus::fdo::Error::Failed(format!("serialize report: {e}")))
}

#[interface(name = "org.persona.Analyzer1")]
impl AnalyzerService {
    /// Analyze a batch of encoded images and return the fused decision as JSON.
    async fn analyze_frames(&self, frames: Vec<Vec<u8>>) -> zbus::fdo::Result<String> {
        let span = tracing::info_span!("analyze_frames", request = %Uuid::new_v4());
        async {
            tracing::info!(frames = frames.len(), "analyze_frames requested");
            let report = self.engine.analyze_frames(frames).await.map_err(to_fdo)?;
            to_json(&report)
        }
        .instrument(span)
        .await
    }

    /// Analyze one encoded image and return the single-image report as JSON.
    async fn analyze_single(&self, frame: Vec<u8>) -> zbus::fdo::Result<String> {
        let span = tracing::info_span!("analyze_single", request = %Uuid::new_v4());
        async {
            tracing::info!(bytes = frame.len(), "analyze_single requested");
            let report = self.engine.analyze_single(frame).await.map_err(to_fdo)?;
            to_json(&report)
        }
        .instrument(span)
        .await
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.engine.status().to_string())
    }
}
