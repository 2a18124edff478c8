//! 视频 → 训练图片
//!
//! 流程：
//! 1. 采样 - 以固定步长生成时间点，先算出总数
//! 2. 并发抽帧 - 每个标签一个任务，帧就绪后交给编码线程池
//! 3. 归一化 - 居中裁正方形、缩放、JPEG 写盘
//! 4. 进度聚合 - 单锁计数，按批次通知

pub mod error;
pub mod extractor;
pub mod frame;
pub mod processor;
pub mod progress;
pub mod sampler;
pub mod source;

pub use error::{DecodeError, ExtractError, ProcessingError};
pub use extractor::{
    ExtractionOptions, ExtractionReport, ExtractionState, LabelSetExtractor, LabeledSource,
    SourceReport,
};
pub use frame::{Frame, RawFrame};
pub use processor::{CropRect, FrameProcessor};
pub use progress::{
    CancelToken, ExtractionProgress, LogProgress, ProgressCounter, ProgressSink,
    DEFAULT_PROGRESS_STEPS,
};
pub use sampler::FrameSampler;
pub use source::{
    FrameDelivery, ImageSequenceOpener, ImageSequenceVideo, MemoryVideo, VideoAsset, VideoOpener,
};
