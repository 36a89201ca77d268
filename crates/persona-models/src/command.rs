//! Backend that shells out to an external classifier.
//!
//! The frame is written to a scratch PNG whose path is appended as the last
//! argument. The program prints one JSON object on stdout:
//!
//! ```json
//! {"scores": {"man": 0.97, "woman": 0.03}, "face_confidence": 0.99, "age": 31}
//! ```
//!
//! `"face": false` or exit status 2 means no face was found. Any other
//! non-zero exit or unparseable output is a backend error.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use persona_core::backend::{DetectFailure, Detection, DetectorBackend};
use persona_core::frame::Frame;
use persona_core::scratch::ScratchFile;
use persona_core::types::Auxiliary;

/// Exit status a command uses to report that no face was present.
pub const NO_FACE_EXIT_CODE: i32 = 2;
const STDERR_EXCERPT: usize = 200;

#[derive(Debug, Deserialize)]
struct CommandOutput {
    #[serde(default = "face_present")]
    face: bool,
    #[serde(default)]
    scores: BTreeMap<String, f32>,
    face_confidence: Option<f32>,
    age: Option<f32>,
}

fn face_present() -> bool {
    true
}

pub struct CommandBackend {
    id: String,
    program: PathBuf,
    args: Vec<String>,
}

impl CommandBackend {
    pub fn new(id: impl Into<String>, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self { id: id.into(), program: program.into(), args }
    }
}

#[async_trait]
impl DetectorBackend for CommandBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn analyze(&self, frame: &Frame) -> Result<Detection, DetectFailure> {
        // PNG encoding and file IO run on the blocking pool. The scratch file
        // lives until the end of this future, cancelled or not.
        let owned = frame.clone();
        let scratch = tokio::task::spawn_blocking(move || ScratchFile::write(&owned))
            .await
            .map_err(|e| DetectFailure::Backend(format!("scratch task failed: {e}")))?
            .map_err(|e| DetectFailure::Backend(e.to_string()))?;

        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(scratch.path())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DetectFailure::Backend(format!("{}: {e}", self.program.display())))?;

        match output.status.code() {
            Some(0) => {}
            Some(NO_FACE_EXIT_CODE) => return Err(DetectFailure::NoFaceDetected),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
                return Err(DetectFailure::Backend(format!(
                    "{} exited with {}: {excerpt}",
                    self.program.display(),
                    output.status
                )));
            }
        }

        parse_output(&output.stdout)
    }
}

fn parse_output(stdout: &[u8]) -> Result<Detection, DetectFailure> {
    let parsed: CommandOutput = serde_json::from_slice(stdout)
        .map_err(|e| DetectFailure::Backend(format!("invalid command output: {e}")))?;

    if !parsed.face {
        return Err(DetectFailure::NoFaceDetected);
    }
    if parsed.scores.is_empty() {
        return Err(DetectFailure::Backend("command output has no scores".into()));
    }

    Ok(Detection {
        scores: parsed.scores,
        face_confidence: parsed.face_confidence,
        auxiliary: Auxiliary { age: parsed.age },
    })
}
