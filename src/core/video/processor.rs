//! 训练图片归一化：居中裁正方形 → 缩放 → JPEG

use super::error::{ExtractError, ProcessingError};
use super::frame::Frame;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ColorType, DynamicImage, RgbaImage};
use log::warn;
use std::fs;
use std::path::Path;

pub const DEFAULT_TARGET_SIZE: u32 = 299;
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// 正方形裁剪区域（光栅坐标，原点在左上）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub side: u32,
}

impl CropRect {
    /// 居中正方形。偏移以左下角为原点向下取整，
    /// 换算到光栅坐标后 y 取 `(H - side) - floor((H - side) / 2)`
    pub fn centered(width: u32, height: u32) -> Option<Self> {
        let side = width.min(height);
        if side == 0 {
            return None;
        }
        let x = (width - side) / 2;
        let slack_y = height - side;
        let y = slack_y - slack_y / 2;
        Some(Self { x, y, side })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameProcessor {
    target_size: u32,
    jpeg_quality: u8,
}

impl FrameProcessor {
    pub fn new(target_size: u32, jpeg_quality: u8) -> Self {
        Self {
            target_size: target_size.max(1),
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    pub fn target_size(&self) -> u32 {
        self.target_size
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.jpeg_quality
    }

    /// 裁剪 + 缩放，输出恒为 `target × target`
    pub fn normalize(&self, frame: &Frame) -> Result<RgbaImage, ProcessingError> {
        let image = frame.to_image()?;
        self.normalize_image(&image)
    }

    pub fn normalize_image(&self, image: &RgbaImage) -> Result<RgbaImage, ProcessingError> {
        let (width, height) = image.dimensions();
        let rect =
            CropRect::centered(width, height).ok_or(ProcessingError::EmptyFrame { width, height })?;

        let square = imageops::crop_imm(image, rect.x, rect.y, rect.side, rect.side).to_image();
        if rect.side == self.target_size {
            return Ok(square);
        }
        Ok(imageops::resize(
            &square,
            self.target_size,
            self.target_size,
            FilterType::Triangle,
        ))
    }

    /// 在内存中编码，失败时不产生任何文件
    pub fn encode_jpeg(&self, image: &RgbaImage) -> Result<Vec<u8>, ProcessingError> {
        let rgb = DynamicImage::ImageRgba8(image.clone()).into_rgb8();
        let mut buffer = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut buffer, self.jpeg_quality);
        encoder.encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)?;
        Ok(buffer)
    }

    /// 处理单帧并写入 `output`
    pub fn process_to_file(&self, frame: &Frame, output: &Path) -> Result<(), ExtractError> {
        let normalized = self.normalize(frame)?;
        let jpeg = self.encode_jpeg(&normalized)?;

        if let Err(source) = fs::write(output, &jpeg) {
            if output.exists() {
                if let Err(e) = fs::remove_file(output) {
                    warn!("⚠️ Failed to remove partial image {:?}: {}", output, e);
                }
            }
            return Err(ExtractError::Write {
                path: output.to_path_buf(),
                source,
            });
        }
        Ok(())
    }
}

impl Default for FrameProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_SIZE, DEFAULT_JPEG_QUALITY)
    }
}
