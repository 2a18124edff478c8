use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// 单帧处理失败（裁剪、缩放、编码），跳过该帧即可
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Empty frame: {width}x{height}")]
    EmptyFrame { width: u32, height: u32 },
    #[error("Frame buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferMismatch { expected: usize, actual: usize },
    #[error("Image encode error: {0}")]
    Encode(#[from] image::ImageError),
}

/// 解码器在读取过程中失败，中止该视频源
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Decoder failure: {0}")]
    Decoder(String),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Source unavailable: {path:?}: {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Frame processing error: {0}")]
    FrameProcessing(#[from] ProcessingError),
    #[error("Write failed for {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Source timed out after {0:?}")]
    TimedOut(Duration),
    #[error("Extraction job panicked: {0}")]
    JobPanicked(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractError {
    pub fn unavailable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        ExtractError::SourceUnavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// 是否只影响单帧（其余错误都会中止整个视频源）
    pub fn is_frame_level(&self) -> bool {
        matches!(self, ExtractError::FrameProcessing(_))
    }
}
