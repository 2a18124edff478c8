//! 训练流程编排：清理目录 → 抽帧 → 外部训练器 → 汇总

use crate::core::config::{AppPaths, ConfigError, PipelineConfig, TrainingParameters};
use crate::core::inventory::TrainingDataInventory;
use crate::core::video::{
    CancelToken, ExtractError, ExtractionReport, ExtractionState, LabelSetExtractor, LogProgress,
    ProgressSink, VideoOpener,
};
use log::{error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractError),
    #[error("Recordings missing for labels: {0:?}")]
    MissingRecordings(Vec<String>),
    #[error("No training images for label '{0}'")]
    EmptyLabel(String),
    #[error("Trainer failed: {0}")]
    Trainer(String),
    #[error("Training cancelled")]
    Cancelled,
}

/// 外部训练器的产出
#[derive(Debug, Clone, PartialEq)]
pub struct TrainerOutput {
    /// 百分比
    pub training_accuracy: f64,
    /// 百分比
    pub validation_accuracy: f64,
    pub model_file: PathBuf,
}

impl TrainerOutput {
    /// 由分类错误率换算准确率：`(1 - error) * 100`
    pub fn from_classification_error(
        training_error: f64,
        validation_error: f64,
        model_file: PathBuf,
    ) -> Self {
        Self {
            training_accuracy: (1.0 - training_error) * 100.0,
            validation_accuracy: (1.0 - validation_error) * 100.0,
            model_file,
        }
    }
}

/// 迁移学习训练器（特征提取 + 分类器拟合）由外部提供
///
/// `training_data` 下每个子目录名即标签，目录内为该标签的图片。
/// 实现应在 `cancel` 被触发时尽快返回 `TrainingError::Cancelled`。
pub trait Trainer: Send + Sync {
    fn train(
        &self,
        training_data: &Path,
        model_file: &Path,
        parameters: &TrainingParameters,
        cancel: &CancelToken,
    ) -> Result<TrainerOutput, TrainingError>;
}

#[derive(Debug)]
pub struct TrainingReport {
    pub extraction: ExtractionReport,
    pub extraction_elapsed: Duration,
    pub training_elapsed: Duration,
    pub model_file: PathBuf,
    pub model_size_bytes: u64,
    pub training_accuracy: f64,
    pub validation_accuracy: f64,
}

#[derive(Debug)]
pub enum TrainingOutcome {
    Finished(TrainingReport),
    Cancelled,
}

pub struct TrainingOrchestrator {
    inventory: TrainingDataInventory,
    extractor: LabelSetExtractor,
    trainer: Arc<dyn Trainer>,
    parameters: TrainingParameters,
    progress: Arc<dyn ProgressSink>,
}

impl TrainingOrchestrator {
    pub fn new(
        config: &PipelineConfig,
        opener: Arc<dyn VideoOpener>,
        trainer: Arc<dyn Trainer>,
    ) -> Result<Self, TrainingError> {
        crate::init_logging();
        config.validate()?;
        let extractor = LabelSetExtractor::with_options(opener, config.extraction_options())?;
        Ok(Self {
            inventory: TrainingDataInventory::new(AppPaths::new(config)),
            extractor,
            trainer,
            parameters: config.training.clone(),
            progress: Arc::new(LogProgress),
        })
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn inventory(&self) -> &TrainingDataInventory {
        &self.inventory
    }

    pub fn extraction_state(&self) -> ExtractionState {
        self.extractor.state()
    }

    /// 阻塞执行完整流程；`cancel` 可在任意线程触发
    pub fn run(&mut self, cancel: &CancelToken) -> Result<TrainingOutcome, TrainingError> {
        let missing = self.inventory.missing_labels();
        if !missing.is_empty() {
            return Err(TrainingError::MissingRecordings(missing));
        }

        let paths = self.inventory.paths().clone();
        self.inventory.prepare_output()?;
        if cancel.is_cancelled() {
            return Ok(TrainingOutcome::Cancelled);
        }

        info!("🎬 Extracting training images for {} labels", paths.labels().len());
        let extraction_started = Instant::now();
        self.extractor.start_with_token(
            paths.labeled_sources(),
            Arc::clone(&self.progress),
            cancel.clone(),
        )?;
        let Some(extraction) = self.extractor.wait() else {
            return Ok(TrainingOutcome::Cancelled);
        };
        let extraction_elapsed = extraction_started.elapsed();

        if extraction.state == ExtractionState::Cancelled {
            info!("🛑 Training cancelled during extraction");
            return Ok(TrainingOutcome::Cancelled);
        }
        for failed in extraction.failed_sources() {
            warn!(
                "⚠️ Training with reduced data for '{}' ({} of {} images)",
                failed.label, failed.written, failed.planned
            );
        }
        for label in paths.labels() {
            if self.inventory.image_count(label)? == 0 {
                error!("❌ No images extracted for '{}'", label);
                return Err(TrainingError::EmptyLabel(label.clone()));
            }
        }

        info!("🧠 Training classifier from {:?}", paths.training_data_dir);
        let training_started = Instant::now();
        let output = match self.trainer.train(
            &paths.training_data_dir,
            &paths.model_file,
            &self.parameters,
            cancel,
        ) {
            Ok(output) => output,
            Err(TrainingError::Cancelled) => {
                info!("🛑 Training cancelled");
                return Ok(TrainingOutcome::Cancelled);
            }
            Err(e) => {
                error!("❌ Training failed: {}", e);
                return Err(e);
            }
        };
        if cancel.is_cancelled() {
            return Ok(TrainingOutcome::Cancelled);
        }
        let training_elapsed = training_started.elapsed();

        let model_size_bytes = fs::metadata(&output.model_file)?.len();
        info!(
            "✅ Model written to {:?} ({} bytes), training {:.1}%, validation {:.1}%",
            output.model_file, model_size_bytes, output.training_accuracy, output.validation_accuracy
        );

        Ok(TrainingOutcome::Finished(TrainingReport {
            extraction,
            extraction_elapsed,
            training_elapsed,
            model_file: output.model_file,
            model_size_bytes,
            training_accuracy: output.training_accuracy,
            validation_accuracy: output.validation_accuracy,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::video::{ExtractionProgress, Frame, MemoryVideo, VideoAsset};
    use std::sync::mpsc;
    use std::sync::Mutex;

    fn config(root: &Path) -> PipelineConfig {
        PipelineConfig {
            root_dir: root.to_path_buf(),
            labels: vec!["cat".to_string(), "dog".to_string()],
            target_size: 16,
            encode_threads: Some(2),
            ..Default::default()
        }
    }

    fn capture_all(config: &PipelineConfig) {
        let paths = AppPaths::new(config);
        fs::create_dir_all(&paths.video_dir).unwrap();
        for label in &config.labels {
            fs::write(paths.movie_file(label), b"recorded").unwrap();
        }
    }

    /// 每个视频 0.2 秒、只有一帧，采样得到 10 张图片
    fn memory_opener(broken: Option<&'static str>) -> Arc<dyn VideoOpener> {
        Arc::new(move |path: &Path| -> Result<Box<dyn VideoAsset>, ExtractError> {
            if broken.is_some_and(|name| path.ends_with(format!("{}.mov", name))) {
                return Err(ExtractError::unavailable(path, "corrupt container"));
            }
            let frame = Frame::new(24, 20, vec![120u8; 24 * 20 * 4], Duration::ZERO, 0);
            Ok(Box::new(MemoryVideo::with_frames(0.2, vec![frame])))
        })
    }

    #[derive(Default)]
    struct FakeTrainer {
        seen_labels: Mutex<Vec<String>>,
    }

    impl Trainer for FakeTrainer {
        fn train(
            &self,
            training_data: &Path,
            model_file: &Path,
            parameters: &TrainingParameters,
            _cancel: &CancelToken,
        ) -> Result<TrainerOutput, TrainingError> {
            assert_eq!(parameters.max_iterations, 50);
            let mut labels: Vec<String> = fs::read_dir(training_data)?
                .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
                .collect::<Result<_, _>>()?;
            labels.sort();
            *self.seen_labels.lock().unwrap() = labels;

            fs::write(model_file, vec![0u8; 1234])?;
            Ok(TrainerOutput::from_classification_error(
                0.05,
                0.25,
                model_file.to_path_buf(),
            ))
        }
    }

    struct CancellingTrainer;

    impl Trainer for CancellingTrainer {
        fn train(
            &self,
            _training_data: &Path,
            _model_file: &Path,
            _parameters: &TrainingParameters,
            cancel: &CancelToken,
        ) -> Result<TrainerOutput, TrainingError> {
            cancel.cancel();
            Err(TrainingError::Cancelled)
        }
    }

    #[test]
    fn test_full_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        capture_all(&config);
        let trainer = Arc::new(FakeTrainer::default());
        let (tx, rx) = mpsc::channel::<ExtractionProgress>();

        let mut orchestrator =
            TrainingOrchestrator::new(&config, memory_opener(None), trainer.clone())
                .unwrap()
                .with_progress(Arc::new(tx));
        let outcome = orchestrator.run(&CancelToken::new()).unwrap();

        let TrainingOutcome::Finished(report) = outcome else {
            panic!("expected finished training");
        };
        assert_eq!(report.extraction.total_count, 20);
        assert!(report.extraction.is_fully_completed());
        assert_eq!(report.model_size_bytes, 1234);
        assert!((report.training_accuracy - 95.0).abs() < 1e-9);
        assert!((report.validation_accuracy - 75.0).abs() < 1e-9);
        assert_eq!(*trainer.seen_labels.lock().unwrap(), vec!["cat", "dog"]);
        assert_eq!(orchestrator.inventory().image_count("dog").unwrap(), 10);

        let last = rx.try_iter().last().unwrap();
        assert_eq!((last.completed_count, last.total_count, last.finished), (20, 20, true));
    }

    #[test]
    fn test_rerun_replaces_previous_images() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        capture_all(&config);
        let mut orchestrator = TrainingOrchestrator::new(
            &config,
            memory_opener(None),
            Arc::new(FakeTrainer::default()),
        )
        .unwrap();

        orchestrator.run(&CancelToken::new()).unwrap();
        orchestrator.run(&CancelToken::new()).unwrap();
        assert_eq!(orchestrator.inventory().image_count("cat").unwrap(), 10);
    }

    #[test]
    fn test_missing_recordings_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut orchestrator = TrainingOrchestrator::new(
            &config,
            memory_opener(None),
            Arc::new(FakeTrainer::default()),
        )
        .unwrap();

        match orchestrator.run(&CancelToken::new()) {
            Err(TrainingError::MissingRecordings(labels)) => assert_eq!(labels, vec!["cat", "dog"]),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_unreadable_video_leaves_label_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        capture_all(&config);
        let mut orchestrator = TrainingOrchestrator::new(
            &config,
            memory_opener(Some("dog")),
            Arc::new(FakeTrainer::default()),
        )
        .unwrap();

        match orchestrator.run(&CancelToken::new()) {
            Err(TrainingError::EmptyLabel(label)) => assert_eq!(label, "dog"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_cancel_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        capture_all(&config);
        let mut orchestrator = TrainingOrchestrator::new(
            &config,
            memory_opener(None),
            Arc::new(FakeTrainer::default()),
        )
        .unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(orchestrator.run(&cancel), Ok(TrainingOutcome::Cancelled)));
    }

    #[test]
    fn test_cancel_during_training() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        capture_all(&config);
        let mut orchestrator =
            TrainingOrchestrator::new(&config, memory_opener(None), Arc::new(CancellingTrainer))
                .unwrap();

        let cancel = CancelToken::new();
        assert!(matches!(orchestrator.run(&cancel), Ok(TrainingOutcome::Cancelled)));
        assert!(cancel.is_cancelled());
        assert_eq!(orchestrator.inventory().image_count("cat").unwrap(), 10);
        // 抽帧已在训练前结束，取消不改变其终态
        assert_eq!(orchestrator.extraction_state(), ExtractionState::Completed);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            jpeg_quality: 0,
            ..config(dir.path())
        };
        let result = TrainingOrchestrator::new(
            &config,
            memory_opener(None),
            Arc::new(FakeTrainer::default()),
        );
        assert!(matches!(result, Err(TrainingError::Config(_))));
    }
}
