//! Frame type and image metrics: YUYV conversion, dark detection, shot quality.

use std::io::Cursor;

/// Share of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

/// Brightness window and sharpness floor for a usable evidence shot.
const GOOD_SHOT_MIN_BRIGHTNESS: f32 = 30.0;
const GOOD_SHOT_MAX_BRIGHTNESS: f32 = 220.0;
const GOOD_SHOT_MIN_SHARPNESS: f32 = 20.0;
const GOOD_SHOT_MIN_SIDE: u32 = 60;

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("is_dark", &self.is_dark)
            .finish()
    }
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        let is_dark = is_dark_frame(&data, DARK_FRAME_THRESHOLD);
        Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
            is_dark,
        }
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// Variance of the 4-neighbour Laplacian. Blurry frames score low.
    pub fn sharpness(&self) -> f32 {
        laplacian_variance(&self.data, self.width, self.height)
    }

    /// Whether the frame is fit to keep as evidence: exposed, in focus, big enough.
    pub fn is_good_shot(&self) -> bool {
        if self.width < GOOD_SHOT_MIN_SIDE || self.height < GOOD_SHOT_MIN_SIDE {
            return false;
        }
        let brightness = self.avg_brightness();
        (GOOD_SHOT_MIN_BRIGHTNESS..=GOOD_SHOT_MAX_BRIGHTNESS).contains(&brightness)
            && self.sharpness() >= GOOD_SHOT_MIN_SHARPNESS
    }

    /// Encode as a grayscale JPEG for evidence storage.
    pub fn to_jpeg(&self) -> Result<Vec<u8>, FrameError> {
        let expected = (self.width * self.height) as usize;
        let pixels = self.data.get(..expected).ok_or(FrameError::InvalidLength {
            expected,
            actual: self.data.len(),
        })?;
        let img = image::GrayImage::from_raw(self.width, self.height, pixels.to_vec()).ok_or(
            FrameError::InvalidLength {
                expected,
                actual: pixels.len(),
            },
        )?;
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut buf, image::ImageFormat::Jpeg)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(buf.into_inner())
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// True if more than `threshold_pct` of pixels fall in the darkest bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

/// Variance of the 3x3 Laplacian response over the frame interior.
pub fn laplacian_variance(gray: &[u8], width: u32, height: u32) -> f32 {
    let w = width as usize;
    let h = height as usize;
    if w < 3 || h < 3 || gray.len() < w * h {
        return 0.0;
    }

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut n = 0usize;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let c = gray[y * w + x] as i32;
            let lap = gray[(y - 1) * w + x] as i32
                + gray[(y + 1) * w + x] as i32
                + gray[y * w + x - 1] as i32
                + gray[y * w + x + 1] as i32
                - 4 * c;
            let v = lap as f64;
            sum += v;
            sum_sq += v * v;
            n += 1;
        }
    }

    let mean = sum / n as f64;
    (sum_sq / n as f64 - mean * mean) as f32
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("jpeg encoding failed: {0}")]
    Encode(String),
}
