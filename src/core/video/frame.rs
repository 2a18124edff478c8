use super::error::ProcessingError;
use image::RgbaImage;
use std::time::Duration;

/// 解码后的帧（RGBA）
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>, // RGBA 格式
    pub timestamp: Duration,
    pub frame_number: u64,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>, timestamp: Duration, frame_number: u64) -> Self {
        Self {
            width,
            height,
            data,
            timestamp,
            frame_number,
        }
    }

    pub fn from_image(image: RgbaImage, timestamp: Duration, frame_number: u64) -> Self {
        let (width, height) = image.dimensions();
        Self::new(width, height, image.into_raw(), timestamp, frame_number)
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// 校验尺寸与缓冲区长度后借出为 `RgbaImage`
    pub fn to_image(&self) -> Result<RgbaImage, ProcessingError> {
        if self.is_empty() {
            return Err(ProcessingError::EmptyFrame {
                width: self.width,
                height: self.height,
            });
        }
        let expected = self.pixel_count() * 4;
        if self.data.len() != expected {
            return Err(ProcessingError::BufferMismatch {
                expected,
                actual: self.data.len(),
            });
        }
        RgbaImage::from_raw(self.width, self.height, self.data.clone()).ok_or(
            ProcessingError::BufferMismatch {
                expected,
                actual: self.data.len(),
            },
        )
    }
}

/// 从原生层传递的原始帧数据（YUV420 平面）
#[derive(Debug)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub y_plane: Vec<u8>,
    pub u_plane: Vec<u8>,
    pub v_plane: Vec<u8>,
    pub timestamp_ms: u64,
    pub frame_number: u64,
}

impl RawFrame {
    fn planes_fit(&self) -> bool {
        let w = self.width as usize;
        let h = self.height as usize;
        let chroma = w.div_ceil(2) * h.div_ceil(2);
        self.y_plane.len() >= w * h && self.u_plane.len() >= chroma && self.v_plane.len() >= chroma
    }

    /// BT.601 转换；平面长度不足时返回错误而不是越界
    pub fn to_rgba(&self) -> Result<Frame, ProcessingError> {
        if self.width == 0 || self.height == 0 {
            return Err(ProcessingError::EmptyFrame {
                width: self.width,
                height: self.height,
            });
        }
        if !self.planes_fit() {
            return Err(ProcessingError::BufferMismatch {
                expected: self.width as usize * self.height as usize,
                actual: self.y_plane.len(),
            });
        }

        let width = self.width as usize;
        let chroma_width = width.div_ceil(2);
        let mut rgba_data = vec![0u8; width * self.height as usize * 4];

        for y in 0..self.height as usize {
            for x in 0..width {
                let y_idx = y * width + x;
                let uv_idx = (y / 2) * chroma_width + x / 2;

                let y_val = self.y_plane[y_idx] as f32;
                let u_val = self.u_plane[uv_idx] as f32 - 128.0;
                let v_val = self.v_plane[uv_idx] as f32 - 128.0;

                let r = (y_val + 1.402 * v_val).clamp(0.0, 255.0) as u8;
                let g = (y_val - 0.344136 * u_val - 0.714136 * v_val).clamp(0.0, 255.0) as u8;
                let b = (y_val + 1.772 * u_val).clamp(0.0, 255.0) as u8;

                let rgba_idx = y_idx * 4;
                rgba_data[rgba_idx] = r;
                rgba_data[rgba_idx + 1] = g;
                rgba_data[rgba_idx + 2] = b;
                rgba_data[rgba_idx + 3] = 255;
            }
        }

        Ok(Frame::new(
            self.width,
            self.height,
            rgba_data,
            Duration::from_millis(self.timestamp_ms),
            self.frame_number,
        ))
    }
}
