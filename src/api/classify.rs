//! 实时分类：模型编译缓存 + 相机帧归一化 + 结果排序

use crate::core::video::{Frame, FrameProcessor, ProcessingError, RawFrame};
use image::{imageops, RgbaImage};
use log::{debug, info};
use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Frame processing error: {0}")]
    Processing(#[from] ProcessingError),
    #[error("Model not compiled")]
    NotReady,
    #[error("Classifier backend error: {0}")]
    Backend(String),
}

/// 设备端推理引擎由外部提供
pub trait Classifier: Send + Sync {
    /// 编译模型，返回编译产物路径（文件或目录）
    fn compile(&self, model_file: &Path) -> Result<PathBuf, ClassifyError>;

    fn load(&mut self, compiled: &Path) -> Result<(), ClassifyError>;

    /// 返回 `(标签, 置信度 0..=1)`，顺序不限
    fn classify(&self, image: &RgbaImage) -> Result<Vec<(String, f32)>, ClassifyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Up,
    /// 传感器画面需顺时针旋转 90°
    Right,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompilationResult {
    pub compilation_time: Duration,
    pub compilation_skipped: bool,
    pub compiled_model: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    /// 百分比
    pub confidence: f32,
    pub elapsed: Duration,
}

pub struct LiveClassifier<C: Classifier> {
    classifier: C,
    processor: FrameProcessor,
    orientation: Orientation,
    ready: Option<CompilationResult>,
}

impl<C: Classifier> LiveClassifier<C> {
    pub fn new(classifier: C, processor: FrameProcessor) -> Self {
        Self {
            classifier,
            processor,
            orientation: Orientation::Up,
            ready: None,
        }
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn compilation(&self) -> Option<&CompilationResult> {
        self.ready.as_ref()
    }

    /// `<model>.mlmodelc` 已存在时跳过编译
    pub fn compile(&mut self, model_file: &Path) -> Result<&CompilationResult, ClassifyError> {
        let cache = model_file.with_extension("mlmodelc");

        let result = if cache.exists() {
            debug!("Reusing compiled model {:?}", cache);
            CompilationResult {
                compilation_time: Duration::ZERO,
                compilation_skipped: true,
                compiled_model: cache,
            }
        } else {
            let started = Instant::now();
            let compiled = self.classifier.compile(model_file)?;
            let compilation_time = started.elapsed();
            if compiled != cache {
                copy_recursively(&compiled, &cache)?;
            }
            info!("🔧 Model compiled in {:?}", compilation_time);
            CompilationResult {
                compilation_time,
                compilation_skipped: false,
                compiled_model: compiled,
            }
        };

        self.classifier.load(&result.compiled_model)?;
        Ok(self.ready.insert(result))
    }

    pub fn classify_frame(&self, frame: &Frame) -> Result<Vec<Prediction>, ClassifyError> {
        if self.ready.is_none() {
            return Err(ClassifyError::NotReady);
        }
        let image = frame.to_image()?;
        let image = match self.orientation {
            Orientation::Up => image,
            Orientation::Right => imageops::rotate90(&image),
        };
        let input = self.processor.normalize_image(&image)?;

        let started = Instant::now();
        let scores = self.classifier.classify(&input)?;
        let elapsed = started.elapsed();

        let mut predictions: Vec<Prediction> = scores
            .into_iter()
            .map(|(label, confidence)| Prediction {
                label,
                confidence: confidence * 100.0,
                elapsed,
            })
            .collect();
        predictions.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
        });
        Ok(predictions)
    }

    /// 相机回调的 YUV 帧
    pub fn classify_raw(&self, raw: &RawFrame) -> Result<Vec<Prediction>, ClassifyError> {
        let frame = raw.to_rgba()?;
        self.classify_frame(&frame)
    }
}

fn copy_recursively(from: &Path, to: &Path) -> io::Result<()> {
    if from.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_recursively(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        fs::copy(from, to)?;
    }
    Ok(())
}
