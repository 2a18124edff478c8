//! 训练数据清单：录像是否就绪、清理与目录重建

use crate::core::config::AppPaths;
use log::{debug, info};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingDataItem {
    pub label: String,
    pub movie_file: PathBuf,
    pub label_directory: PathBuf,
    pub is_captured: bool,
}

#[derive(Debug, Clone)]
pub struct TrainingDataInventory {
    paths: AppPaths,
}

impl TrainingDataInventory {
    pub fn new(paths: AppPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn items(&self) -> Vec<TrainingDataItem> {
        self.paths
            .labels()
            .iter()
            .map(|label| {
                let movie_file = self.paths.movie_file(label);
                TrainingDataItem {
                    label: label.clone(),
                    is_captured: movie_file.exists(),
                    movie_file,
                    label_directory: self.paths.label_directory(label),
                }
            })
            .collect()
    }

    pub fn all_captured(&self) -> bool {
        self.items().iter().all(|item| item.is_captured)
    }

    pub fn missing_labels(&self) -> Vec<String> {
        self.items()
            .into_iter()
            .filter(|item| !item.is_captured)
            .map(|item| item.label)
            .collect()
    }

    /// 删除已录制的视频，返回删除的数量
    pub fn clear_recordings(&self) -> io::Result<usize> {
        let mut removed = 0;
        for item in self.items() {
            if !item.is_captured {
                continue;
            }
            remove_path(&item.movie_file)?;
            removed += 1;
        }
        info!("🧹 Removed {} recordings", removed);
        Ok(removed)
    }

    /// 删除并重建模型目录与各标签输出目录
    pub fn prepare_output(&self) -> io::Result<()> {
        recreate_dir(&self.paths.model_dir)?;
        for label in self.paths.labels() {
            recreate_dir(&self.paths.label_directory(label))?;
        }
        debug!("📁 Output directories recreated under {:?}", self.paths.training_data_dir);
        Ok(())
    }

    pub fn image_count(&self, label: &str) -> io::Result<usize> {
        let dir = self.paths.label_directory(label);
        if !dir.exists() {
            return Ok(0);
        }
        let mut count = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("jpg")) {
                count += 1;
            }
        }
        Ok(count)
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn recreate_dir(dir: &Path) -> io::Result<()> {
    if dir.exists() {
        remove_path(dir)?;
    }
    fs::create_dir_all(dir)
}
