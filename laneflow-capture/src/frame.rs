//! Owned RGB8 frame plus frame validation and ROI cropping.

use chrono::{DateTime, Utc};
use machine_vision_formats::{
    pixel_format::RGB8, ImageBuffer, ImageBufferMutRef, ImageBufferRef, ImageData, ImageMutData,
    Stride,
};

use laneflow_types::RoiCrop;

const BYTES_PER_PIXEL: usize = 3;

/// Smallest inner rectangle the ROI crop may produce on either axis.
pub const MIN_ROI_DIM: u32 = 32;

/// An owned, stride-aware RGB8 image with host timing information.
#[derive(Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    stride: u32,
    data: Vec<u8>,
    /// Frame number as counted by the host; gaps mean dropped frames.
    pub fno: usize,
    /// Host timestamp at which the decoded frame was received.
    pub stamp: DateTime<Utc>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Frame {{ {}x{}, fno {} }}", self.width, self.height, self.fno)
    }
}

impl Frame {
    /// Wrap a packed RGB24 buffer. Returns `None` when the buffer is too
    /// small for the given geometry.
    pub fn new(
        width: u32,
        height: u32,
        data: Vec<u8>,
        fno: usize,
        stamp: DateTime<Utc>,
    ) -> Option<Self> {
        let stride = width as usize * BYTES_PER_PIXEL;
        if data.len() < stride * height as usize {
            return None;
        }
        Some(Self {
            width,
            height,
            stride: stride as u32,
            data,
            fno,
            stamp,
        })
    }

    /// Allocate an all-black frame.
    pub fn zeros(width: u32, height: u32) -> Self {
        let stride = width as usize * BYTES_PER_PIXEL;
        Self {
            width,
            height,
            stride: stride as u32,
            data: vec![0u8; stride * height as usize],
            fno: 0,
            stamp: Utc::now(),
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let start = y as usize * self.stride as usize + x as usize * BYTES_PER_PIXEL;
        [self.data[start], self.data[start + 1], self.data[start + 2]]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        let start = y as usize * self.stride as usize + x as usize * BYTES_PER_PIXEL;
        self.data[start..start + 3].copy_from_slice(&rgb);
    }

    pub fn dims(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl ImageData<RGB8> for Frame {
    fn width(&self) -> u32 {
        self.width
    }
    fn height(&self) -> u32 {
        self.height
    }
    fn buffer_ref(&self) -> ImageBufferRef<'_, RGB8> {
        ImageBufferRef::new(&self.data)
    }
    fn buffer(self) -> ImageBuffer<RGB8> {
        ImageBuffer::new(self.data)
    }
}

impl ImageMutData<RGB8> for Frame {
    fn buffer_mut_ref(&mut self) -> ImageBufferMutRef<'_, RGB8> {
        ImageBufferMutRef::new(&mut self.data)
    }
}

impl Stride for Frame {
    fn stride(&self) -> usize {
        self.stride as usize
    }
}

/// Advisory decode sanity check.
///
/// Samples the central 50%×50% region and rejects frames whose mean
/// luminance is essentially pure black or pure white, the two signatures of
/// a botched decode.
pub fn is_frame_valid(frame: &Frame) -> bool {
    let (w, h) = frame.dims();
    if w == 0 || h == 0 {
        return false;
    }
    let x0 = w / 4;
    let x1 = (x0 + w / 2).min(w);
    let y0 = h / 4;
    let y1 = (y0 + h / 2).min(h);
    if x1 <= x0 || y1 <= y0 {
        return false;
    }

    let mut sum: f64 = 0.0;
    let mut n: u64 = 0;
    for y in y0..y1 {
        for x in x0..x1 {
            let [r, g, b] = frame.pixel(x, y);
            sum += 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
            n += 1;
        }
    }
    let mean = sum / n as f64;
    (1.0..=254.0).contains(&mean)
}

/// Resolve the ROI crop percents to an inner `(x, y, width, height)` rect.
///
/// Percents are clamped to `[0, 50]`. If the inner rectangle would be
/// narrower than [`MIN_ROI_DIM`] on an axis, the crop for that axis is
/// dropped and the full extent kept.
pub fn roi_rect(width: u32, height: u32, cfg: &RoiCrop) -> (u32, u32, u32, u32) {
    let clamp = |p: f32| -> f32 { p.clamp(0.0, 50.0) };

    let left = (width as f32 * clamp(cfg.left_percent) / 100.0) as u32;
    let right = (width as f32 * clamp(cfg.right_percent) / 100.0) as u32;
    let top = (height as f32 * clamp(cfg.top_percent) / 100.0) as u32;
    let bottom = (height as f32 * clamp(cfg.bottom_percent) / 100.0) as u32;

    let (x, w) = if width.saturating_sub(left + right) < MIN_ROI_DIM {
        (0, width)
    } else {
        (left, width - left - right)
    };
    let (y, h) = if height.saturating_sub(top + bottom) < MIN_ROI_DIM {
        (0, height)
    } else {
        (top, height - top - bottom)
    };
    (x, y, w, h)
}

/// Copy the configured inner rectangle out of `frame`.
pub fn apply_roi_crop(frame: &Frame, cfg: &RoiCrop) -> Frame {
    let (w, h) = frame.dims();
    let (rx, ry, rw, rh) = roi_rect(w, h, cfg);
    if (rx, ry, rw, rh) == (0, 0, w, h) {
        return frame.clone();
    }

    let src_stride = frame.stride();
    let dst_stride = rw as usize * BYTES_PER_PIXEL;
    let mut data = Vec::with_capacity(dst_stride * rh as usize);
    let src = frame.buffer_ref().data;
    for row in ry..ry + rh {
        let start = row as usize * src_stride + rx as usize * BYTES_PER_PIXEL;
        data.extend_from_slice(&src[start..start + dst_stride]);
    }

    Frame {
        width: rw,
        height: rh,
        stride: dst_stride as u32,
        data,
        fno: frame.fno,
        stamp: frame.stamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_frame(width: u32, height: u32, level: u8) -> Frame {
        let mut f = Frame::zeros(width, height);
        for y in 0..height {
            for x in 0..width {
                f.set_pixel(x, y, [level, level, level]);
            }
        }
        f
    }

    #[test]
    fn mid_gray_frame_is_valid() {
        assert!(is_frame_valid(&gray_frame(64, 64, 128)));
    }

    #[test]
    fn black_and_white_frames_are_rejected() {
        assert!(!is_frame_valid(&gray_frame(64, 64, 0)));
        assert!(!is_frame_valid(&gray_frame(64, 64, 255)));
    }

    #[test]
    fn validation_samples_only_the_center() {
        // black border, gray center: must pass
        let mut f = gray_frame(64, 64, 0);
        for y in 16..48 {
            for x in 16..48 {
                f.set_pixel(x, y, [100, 100, 100]);
            }
        }
        assert!(is_frame_valid(&f));
    }

    #[test]
    fn roi_percents_are_clamped_to_half() {
        let cfg = RoiCrop {
            top_percent: 60.0,
            bottom_percent: -5.0,
            left_percent: 0.0,
            right_percent: 0.0,
        };
        let (_, y, _, h) = roi_rect(640, 480, &cfg);
        // 60 clamps to 50, -5 clamps to 0
        assert_eq!(y, 240);
        assert_eq!(h, 240);
    }

    #[test]
    fn roi_never_produces_sub_minimum_axis() {
        let cfg = RoiCrop {
            top_percent: 50.0,
            bottom_percent: 50.0,
            left_percent: 10.0,
            right_percent: 10.0,
        };
        // 64px tall: 50%+50% leaves zero, so the vertical crop is dropped
        let (x, y, w, h) = roi_rect(100, 64, &cfg);
        assert_eq!((y, h), (0, 64));
        // horizontal crop of 10% leaves 80 >= 32, kept
        assert_eq!((x, w), (10, 80));
    }

    #[test]
    fn crop_copies_the_inner_rect() {
        let mut f = Frame::zeros(100, 100);
        f.set_pixel(50, 50, [1, 2, 3]);
        let cfg = RoiCrop {
            top_percent: 10.0,
            bottom_percent: 10.0,
            left_percent: 10.0,
            right_percent: 10.0,
        };
        let cropped = apply_roi_crop(&f, &cfg);
        assert_eq!(cropped.dims(), (80, 80));
        assert_eq!(cropped.pixel(40, 40), [1, 2, 3]);
    }

    #[test]
    fn disabled_crop_returns_full_frame() {
        let f = Frame::zeros(48, 48);
        let cropped = apply_roi_crop(&f, &RoiCrop::default());
        assert_eq!(cropped.dims(), (48, 48));
    }
}
