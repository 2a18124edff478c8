//! 视频源抽象：平台解码器按时间点交付帧

use super::error::{DecodeError, ExtractError};
use super::frame::Frame;
use log::{debug, warn};
use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 解码器对单个请求时间点的交付结果
#[derive(Debug)]
pub struct FrameDelivery {
    pub requested: Duration,
    /// `Ok(None)` 表示该时间点没有可用图像（跳过），`Err` 表示解码器本身失败
    pub frame: Result<Option<Frame>, DecodeError>,
}

pub trait VideoAsset: Send {
    /// 时长（秒），未知或损坏时可以为 0 或负数
    fn duration_secs(&self) -> f64;

    fn frame_at(&mut self, timestamp: Duration) -> Result<Option<Frame>, DecodeError>;

    /// 按顺序请求 `times`，每帧就绪后回调；回调返回 `Break` 时停止发起新的请求
    fn generate_frames(
        &mut self,
        times: &[Duration],
        on_frame: &mut dyn FnMut(FrameDelivery) -> ControlFlow<()>,
    ) {
        for &requested in times {
            let frame = self.frame_at(requested);
            if on_frame(FrameDelivery { requested, frame }).is_break() {
                break;
            }
        }
    }
}

pub trait VideoOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn VideoAsset>, ExtractError>;
}

impl<F> VideoOpener for F
where
    F: Fn(&Path) -> Result<Box<dyn VideoAsset>, ExtractError> + Send + Sync,
{
    fn open(&self, path: &Path) -> Result<Box<dyn VideoAsset>, ExtractError> {
        self(path)
    }
}

/// 已解码、保存在内存中的视频（例如由原生层逐帧推送）
#[derive(Debug, Clone, Default)]
pub struct MemoryVideo {
    frames: Vec<Frame>,
    duration_secs: f64,
}

impl MemoryVideo {
    pub fn new(duration_secs: f64) -> Self {
        Self {
            frames: Vec::new(),
            duration_secs,
        }
    }

    /// 帧按时间戳保持有序
    pub fn push(&mut self, frame: Frame) {
        let idx = self
            .frames
            .partition_point(|f| f.timestamp <= frame.timestamp);
        self.frames.insert(idx, frame);
    }

    pub fn with_frames(duration_secs: f64, frames: impl IntoIterator<Item = Frame>) -> Self {
        let mut video = Self::new(duration_secs);
        for frame in frames {
            video.push(frame);
        }
        video
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl VideoAsset for MemoryVideo {
    fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    /// 取时间戳 ≤ `timestamp` 的最后一帧
    fn frame_at(&mut self, timestamp: Duration) -> Result<Option<Frame>, DecodeError> {
        let idx = self.frames.partition_point(|f| f.timestamp <= timestamp);
        Ok(idx.checked_sub(1).map(|i| {
            let mut frame = self.frames[i].clone();
            frame.timestamp = timestamp;
            frame
        }))
    }
}

/// 逐帧导出的图片目录（文件名排序即帧顺序），固定帧率
#[derive(Debug, Clone)]
pub struct ImageSequenceVideo {
    files: Vec<PathBuf>,
    fps: f64,
}

impl ImageSequenceVideo {
    pub fn open(dir: &Path, fps: f64) -> Result<Self, ExtractError> {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(ExtractError::unavailable(dir, format!("invalid frame rate {}", fps)));
        }
        let entries = fs::read_dir(dir).map_err(|e| ExtractError::unavailable(dir, e))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| ExtractError::unavailable(dir, e))?.path();
            if path.is_file() && is_image_file(&path) {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(ExtractError::unavailable(dir, "no frames in directory"));
        }
        files.sort();

        debug!("🎞️ Image sequence {:?}: {} frames at {} fps", dir, files.len(), fps);
        Ok(Self { files, fps })
    }

    pub fn frame_count(&self) -> usize {
        self.files.len()
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg" | "bmp"))
        .unwrap_or(false)
}

impl VideoAsset for ImageSequenceVideo {
    fn duration_secs(&self) -> f64 {
        self.files.len() as f64 / self.fps
    }

    fn frame_at(&mut self, timestamp: Duration) -> Result<Option<Frame>, DecodeError> {
        let index = (timestamp.as_secs_f64() * self.fps).floor() as usize;
        let Some(path) = self.files.get(index) else {
            return Ok(None);
        };

        match image::open(path) {
            Ok(img) => Ok(Some(Frame::from_image(img.into_rgba8(), timestamp, index as u64))),
            Err(image::ImageError::IoError(e)) => Err(DecodeError::Io(e)),
            Err(e) => {
                warn!("⚠️ Skipping undecodable frame {:?}: {}", path, e);
                Ok(None)
            }
        }
    }
}

/// 以目录形式打开图片序列的 opener
#[derive(Debug, Clone, Copy)]
pub struct ImageSequenceOpener {
    pub fps: f64,
}

impl VideoOpener for ImageSequenceOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn VideoAsset>, ExtractError> {
        Ok(Box::new(ImageSequenceVideo::open(path, self.fps)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn frame_at_ms(ms: u64, fill: u8) -> Frame {
        Frame::new(2, 2, vec![fill; 16], Duration::from_millis(ms), ms)
    }

    #[test]
    fn test_memory_video_picks_preceding_frame() {
        let mut video =
            MemoryVideo::with_frames(1.0, vec![frame_at_ms(500, 2), frame_at_ms(0, 1)]);

        let f = video.frame_at(Duration::from_millis(499)).unwrap().unwrap();
        assert_eq!(f.data[0], 1);
        assert_eq!(f.timestamp, Duration::from_millis(499));

        let f = video.frame_at(Duration::from_millis(700)).unwrap().unwrap();
        assert_eq!(f.data[0], 2);
    }

    #[test]
    fn test_memory_video_before_first_frame_is_none() {
        let mut video = MemoryVideo::with_frames(1.0, vec![frame_at_ms(100, 1)]);
        assert!(video.frame_at(Duration::from_millis(50)).unwrap().is_none());
    }

    #[test]
    fn test_generate_frames_stops_on_break() {
        let mut video = MemoryVideo::with_frames(1.0, vec![frame_at_ms(0, 1)]);
        let times: Vec<_> = (0..10).map(|i| Duration::from_millis(i * 20)).collect();

        let mut seen = Vec::new();
        video.generate_frames(&times, &mut |delivery| {
            seen.push(delivery.requested);
            if seen.len() == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(seen, times[..3].to_vec());
    }

    #[test]
    fn test_image_sequence_video() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5u8 {
            let img = RgbaImage::from_pixel(4, 3, Rgba([i * 10, 0, 0, 255]));
            img.save(dir.path().join(format!("{:04}.png", i))).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut video = ImageSequenceVideo::open(dir.path(), 10.0).unwrap();
        assert_eq!(video.frame_count(), 5);
        assert!((video.duration_secs() - 0.5).abs() < 1e-9);

        let frame = video.frame_at(Duration::from_millis(250)).unwrap().unwrap();
        assert_eq!(frame.frame_number, 2);
        assert_eq!(frame.data[0], 20);
        assert!(video.frame_at(Duration::from_secs(3)).unwrap().is_none());
    }

    #[test]
    fn test_image_sequence_missing_dir_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let result = ImageSequenceOpener { fps: 30.0 }.open(&dir.path().join("nope"));
        assert!(matches!(result, Err(ExtractError::SourceUnavailable { .. })));
    }
}
