//! Runs the external transcoder that turns an uploaded video into an MP3.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TranscoderConfig;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("transcoder exited with {status}")]
    Failed { status: String, diagnostics: String },
    #[error("transcoder timed out after {0:?}")]
    TimedOut(Duration),
    #[error("transcode cancelled")]
    Cancelled,
    #[error("waiting on transcoder: {0}")]
    Io(#[from] std::io::Error),
}

impl TranscodeError {
    /// Whatever the tool printed before failing, if anything.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::Failed { diagnostics, .. } if !diagnostics.trim().is_empty() => {
                Some(diagnostics.as_str())
            }
            _ => None,
        }
    }
}

/// Thin wrapper around an ffmpeg-compatible program.
#[derive(Clone, Debug)]
pub struct Transcoder {
    program: PathBuf,
    timeout: Duration,
}

impl Transcoder {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(cfg: &TranscoderConfig) -> Self {
        Self::new(cfg.program.clone(), cfg.timeout)
    }

    /// Argument list passed to the program; video is dropped and audio is
    /// encoded with LAME at VBR quality 2.
    pub fn args(input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".into(),
            "-i".into(),
            input.to_string_lossy().into_owned(),
            "-vn".into(),
            "-acodec".into(),
            "libmp3lame".into(),
            "-q:a".into(),
            "2".into(),
            output.to_string_lossy().into_owned(),
        ]
    }

    /// Convert `input` into `output`, waiting at most the configured timeout.
    /// Dropping the returned future, a timeout, or `cancel` firing all kill
    /// the child process.
    pub async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError> {
        let child = Command::new(&self.program)
            .args(Self::args(input, output))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;
        debug!(input = %input.display(), output = %output.display(), "transcoder started");

        let out = tokio::select! {
            res = tokio::time::timeout(self.timeout, child.wait_with_output()) => match res {
                Ok(out) => out?,
                Err(_) => return Err(TranscodeError::TimedOut(self.timeout)),
            },
            _ = cancel.cancelled() => return Err(TranscodeError::Cancelled),
        };

        if out.status.success() {
            return Ok(());
        }
        let mut diagnostics = String::from_utf8_lossy(&out.stdout).into_owned();
        diagnostics.push_str(&String::from_utf8_lossy(&out.stderr));
        Err(TranscodeError::Failed {
            status: out.status.to_string(),
            diagnostics,
        })
    }
}
