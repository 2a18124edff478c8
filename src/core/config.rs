//! 管线配置（JSON5）与目录布局

use crate::core::video::{
    ExtractionOptions, FrameProcessor, FrameSampler, LabeledSource, DEFAULT_PROGRESS_STEPS,
};
use log::info;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// 标签会成为目录名，只允许单个安全的路径分量
static LABEL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^/\\:*?<>|\x00-\x1f]+$").expect("valid label regex"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    Parse(#[from] json5::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationSplit {
    #[default]
    Automatic,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelMetadata {
    pub author: String,
    pub short_description: String,
    pub license: String,
}

impl Default for ModelMetadata {
    fn default() -> Self {
        Self {
            author: String::new(),
            short_description: "Classifies north, east, west and south from the given images"
                .to_string(),
            license: "MIT".to_string(),
        }
    }
}

/// 交给外部训练器的参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParameters {
    pub max_iterations: u32,
    pub validation: ValidationSplit,
    pub augmentation: bool,
    pub metadata: ModelMetadata,
}

impl Default for TrainingParameters {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            validation: ValidationSplit::Automatic,
            augmentation: false,
            metadata: ModelMetadata::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub labels: Vec<String>,
    pub root_dir: PathBuf,
    pub video_extension: String,
    pub sample_interval_ms: u64,
    pub target_size: u32,
    pub jpeg_quality: u8,
    pub progress_steps: u64,
    pub source_timeout_secs: Option<u64>,
    pub encode_threads: Option<usize>,
    pub model_name: String,
    pub training: TrainingParameters,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            labels: ["North", "East", "West", "South"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            root_dir: PathBuf::from("."),
            video_extension: "mov".to_string(),
            sample_interval_ms: 20,
            target_size: 299,
            jpeg_quality: 80,
            progress_steps: DEFAULT_PROGRESS_STEPS,
            source_timeout_secs: None,
            encode_threads: None,
            model_name: "NewsModelV1".to_string(),
            training: TrainingParameters::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("📖 Loading pipeline config: {:?}", path);
        let text = fs::read_to_string(path)?;
        Self::from_json5(&text)
    }

    pub fn from_json5(text: &str) -> Result<Self, ConfigError> {
        let config: Self = json5::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.labels.is_empty() {
            return Err(ConfigError::Invalid("at least one label is required".into()));
        }
        let mut seen = HashSet::new();
        for label in &self.labels {
            if label.trim().is_empty()
                || label == "."
                || label == ".."
                || !LABEL_PATTERN.is_match(label)
            {
                return Err(ConfigError::Invalid(format!("invalid label name: {:?}", label)));
            }
            if !seen.insert(label.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate label: {:?}", label)));
            }
        }
        if self.sample_interval_ms == 0 {
            return Err(ConfigError::Invalid("sample_interval_ms must be > 0".into()));
        }
        if self.target_size == 0 {
            return Err(ConfigError::Invalid("target_size must be > 0".into()));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "jpeg_quality must be within 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        if self.progress_steps == 0 {
            return Err(ConfigError::Invalid("progress_steps must be > 0".into()));
        }
        if self.encode_threads == Some(0) {
            return Err(ConfigError::Invalid("encode_threads must be > 0".into()));
        }
        if self.model_name.trim().is_empty() || !LABEL_PATTERN.is_match(&self.model_name) {
            return Err(ConfigError::Invalid(format!("invalid model name: {:?}", self.model_name)));
        }
        Ok(())
    }

    pub fn extraction_options(&self) -> ExtractionOptions {
        ExtractionOptions {
            sampler: FrameSampler::new(Duration::from_millis(self.sample_interval_ms.max(1))),
            processor: FrameProcessor::new(self.target_size, self.jpeg_quality),
            progress_steps: self.progress_steps,
            source_timeout: self.source_timeout_secs.map(Duration::from_secs),
            encode_threads: self.encode_threads,
        }
    }
}

/// 由配置推导出的各目录与文件路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    labels: Vec<String>,
    video_extension: String,
    pub video_dir: PathBuf,
    pub training_data_dir: PathBuf,
    pub model_dir: PathBuf,
    pub model_file: PathBuf,
}

impl AppPaths {
    pub fn new(config: &PipelineConfig) -> Self {
        let root = &config.root_dir;
        let model_dir = root.join("MLModel");
        Self {
            labels: config.labels.clone(),
            video_extension: config.video_extension.clone(),
            video_dir: root.join("Video"),
            training_data_dir: root.join("TrainingData"),
            model_file: model_dir.join(format!("{}.mlmodel", config.model_name)),
            model_dir,
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn movie_file(&self, label: &str) -> PathBuf {
        if self.video_extension.is_empty() {
            self.video_dir.join(label)
        } else {
            self.video_dir
                .join(format!("{}.{}", label, self.video_extension))
        }
    }

    pub fn label_directory(&self, label: &str) -> PathBuf {
        self.training_data_dir.join(label)
    }

    /// 每次训练都重新构建
    pub fn labeled_sources(&self) -> Vec<LabeledSource> {
        self.labels
            .iter()
            .map(|label| LabeledSource {
                label: label.clone(),
                video_path: self.movie_file(label),
                output_directory: self.label_directory(label),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.labels, vec!["North", "East", "West", "South"]);

        let options = config.extraction_options();
        assert_eq!(options.sampler.step(), Duration::from_millis(20));
        assert_eq!(options.processor.target_size(), 299);
        assert_eq!(options.processor.jpeg_quality(), 80);
        assert_eq!(config.training.max_iterations, 50);
    }

    #[test]
    fn test_parse_json5_with_partial_fields() {
        let text = r#"{
            // 只覆盖部分字段
            labels: ["cat", "dog"],
            root_dir: "/data/app",
            source_timeout_secs: 600,
            training: { max_iterations: 10 },
        }"#;
        let config = PipelineConfig::from_json5(text).unwrap();

        assert_eq!(config.labels, vec!["cat", "dog"]);
        assert_eq!(config.sample_interval_ms, 20);
        assert_eq!(config.training.max_iterations, 10);
        assert_eq!(config.training.metadata.license, "MIT");
        assert_eq!(
            config.extraction_options().source_timeout,
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn test_rejects_bad_labels() {
        for labels in [vec![], vec!["a/b"], vec![".."], vec!["x", "x"], vec!["  "]] {
            let config = PipelineConfig {
                labels: labels.into_iter().map(String::from).collect(),
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_rejects_bad_numbers() {
        let bad = [
            PipelineConfig { sample_interval_ms: 0, ..Default::default() },
            PipelineConfig { target_size: 0, ..Default::default() },
            PipelineConfig { jpeg_quality: 0, ..Default::default() },
            PipelineConfig { jpeg_quality: 101, ..Default::default() },
            PipelineConfig { progress_steps: 0, ..Default::default() },
            PipelineConfig { encode_threads: Some(0), ..Default::default() },
        ];
        for config in bad {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            PipelineConfig::from_json5("{ labels: "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_paths_layout() {
        let config = PipelineConfig {
            root_dir: PathBuf::from("/docs"),
            ..Default::default()
        };
        let paths = AppPaths::new(&config);

        assert_eq!(paths.movie_file("North"), PathBuf::from("/docs/Video/North.mov"));
        assert_eq!(paths.label_directory("East"), PathBuf::from("/docs/TrainingData/East"));
        assert_eq!(paths.model_file, PathBuf::from("/docs/MLModel/NewsModelV1.mlmodel"));

        let sources = paths.labeled_sources();
        assert_eq!(sources.len(), 4);
        assert_eq!(sources[3].label, "South");
        assert_eq!(sources[3].output_directory, PathBuf::from("/docs/TrainingData/South"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json5");
        fs::write(&path, "{ target_size: 224, jpeg_quality: 90 }").unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.target_size, 224);
        assert_eq!(config.jpeg_quality, 90);
        assert!(matches!(
            PipelineConfig::load(&dir.path().join("missing.json5")),
            Err(ConfigError::Io(_))
        ));
    }
}
