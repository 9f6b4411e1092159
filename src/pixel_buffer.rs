//! Borrowed view of decoded image samples.
//!
//! Decoding (FITS, TIFF, RAW, ...) happens elsewhere; the decoder hands over a
//! typed sample slice plus geometry and, optionally, per-channel statistics.
//! Multi-channel data is planar: channel `c` occupies samples
//! `[c * w * h, (c + 1) * w * h)`.

use crate::error::ExtractionError;

/// Typed, borrowed sample storage.
#[derive(Debug, Clone, Copy)]
pub enum SampleData<'a> {
    U8(&'a [u8]),
    I16(&'a [i16]),
    U16(&'a [u16]),
    I32(&'a [i32]),
    U32(&'a [u32]),
    F32(&'a [f32]),
    F64(&'a [f64]),
}

impl SampleData<'_> {
    pub fn len(&self) -> usize {
        match self {
            SampleData::U8(s) => s.len(),
            SampleData::I16(s) => s.len(),
            SampleData::U16(s) => s.len(),
            SampleData::I32(s) => s.len(),
            SampleData::U32(s) => s.len(),
            SampleData::F32(s) => s.len(),
            SampleData::F64(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// FITS-style BITPIX: positive for integers, negative for floats.
    pub fn bit_depth(&self) -> i32 {
        match self {
            SampleData::U8(_) => 8,
            SampleData::I16(_) | SampleData::U16(_) => 16,
            SampleData::I32(_) | SampleData::U32(_) => 32,
            SampleData::F32(_) => -32,
            SampleData::F64(_) => -64,
        }
    }

    /// Largest representable value for integer types; `None` for floats.
    pub fn type_max(&self) -> Option<f64> {
        match self {
            SampleData::U8(_) => Some(u8::MAX as f64),
            SampleData::I16(_) => Some(i16::MAX as f64),
            SampleData::U16(_) => Some(u16::MAX as f64),
            SampleData::I32(_) => Some(i32::MAX as f64),
            SampleData::U32(_) => Some(u32::MAX as f64),
            SampleData::F32(_) | SampleData::F64(_) => None,
        }
    }

    #[inline]
    fn get(&self, i: usize) -> f32 {
        match self {
            SampleData::U8(s) => s[i] as f32,
            SampleData::I16(s) => s[i] as f32,
            SampleData::U16(s) => s[i] as f32,
            SampleData::I32(s) => s[i] as f32,
            SampleData::U32(s) => s[i] as f32,
            SampleData::F32(s) => s[i],
            SampleData::F64(s) => s[i] as f32,
        }
    }
}

/// Summary statistics of one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub stddev: f64,
}

impl ChannelStats {
    /// Compute statistics over finite samples. An all-NaN channel yields zeros.
    pub fn compute(samples: impl Iterator<Item = f32>) -> Self {
        let mut values: Vec<f32> = samples.filter(|v| v.is_finite()).collect();
        if values.is_empty() {
            return Self {
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                median: 0.0,
                stddev: 0.0,
            };
        }
        let n = values.len() as f64;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0f64;
        for &v in &values {
            let v = v as f64;
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        let mean = sum / n;
        let var = values
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        let mid = values.len() / 2;
        let (_, m, _) = values.select_nth_unstable_by(mid, f32::total_cmp);
        Self {
            min,
            max,
            mean,
            median: *m as f64,
            stddev: var.sqrt(),
        }
    }
}

/// Rectangular region of interest, in full-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subframe {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl Subframe {
    pub fn new(x: i64, y: i64, width: i64, height: i64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Normalize against an image: negative extents are flipped, the origin is
    /// clamped into the image and the size is cut at the image edge.
    /// Returns `(x0, y0, w, h)` with `w, h` possibly zero.
    pub fn clamp_to(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let (mut x, mut w) = (self.x, self.width);
        if w < 0 {
            x += w;
            w = -w;
        }
        let (mut y, mut h) = (self.y, self.height);
        if h < 0 {
            y += h;
            h = -h;
        }
        let x = x.clamp(0, width as i64);
        let y = y.clamp(0, height as i64);
        let w = w.min(width as i64 - x).max(0);
        let h = h.min(height as i64 - y).max(0);
        (x as u32, y as u32, w as u32, h as u32)
    }
}

/// A single-channel `f32` working plane cut from a [`PixelBuffer`].
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
    /// Full-image coordinates of this plane's (0, 0) pixel.
    pub origin: (u32, u32),
    /// Raw samples binned into each plane pixel along one axis.
    pub binning: u32,
}

impl Plane {
    #[inline]
    pub fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width as usize + x]
    }

    /// Block-average by `factor`. Trailing partial blocks are dropped.
    pub fn downsample(&self, factor: u32) -> Plane {
        if factor <= 1 {
            return self.clone();
        }
        let f = factor as usize;
        let w = self.width as usize;
        let nw = w / f;
        let nh = self.height as usize / f;
        let mut data = vec![0.0f32; nw * nh];
        let norm = 1.0 / (f * f) as f32;
        for by in 0..nh {
            for bx in 0..nw {
                let mut acc = 0.0f32;
                for yy in by * f..(by + 1) * f {
                    let row = &self.data[yy * w + bx * f..yy * w + (bx + 1) * f];
                    acc += row.iter().sum::<f32>();
                }
                data[by * nw + bx] = acc * norm;
            }
        }
        Plane {
            data,
            width: nw as u32,
            height: nh as u32,
            origin: self.origin,
            binning: self.binning * factor,
        }
    }

    /// Map a plane coordinate back to full-image pixels.
    pub fn to_image(&self, x: f64, y: f64) -> (f64, f64) {
        let f = self.binning as f64;
        (
            self.origin.0 as f64 + (x + 0.5) * f - 0.5,
            self.origin.1 as f64 + (y + 0.5) * f - 0.5,
        )
    }
}

/// Immutable view of decoded image samples plus per-channel statistics.
#[derive(Debug, Clone)]
pub struct PixelBuffer<'a> {
    data: SampleData<'a>,
    width: u32,
    height: u32,
    channels: u32,
    stats: Vec<ChannelStats>,
}

impl<'a> PixelBuffer<'a> {
    /// Wrap decoded samples, computing per-channel statistics.
    pub fn new(
        data: SampleData<'a>,
        width: u32,
        height: u32,
        channels: u32,
    ) -> Result<Self, ExtractionError> {
        Self::validate(&data, width, height, channels)?;
        let n = width as usize * height as usize;
        let stats = (0..channels as usize)
            .map(|c| ChannelStats::compute((c * n..(c + 1) * n).map(|i| data.get(i))))
            .collect();
        Ok(Self {
            data,
            width,
            height,
            channels,
            stats,
        })
    }

    /// Wrap decoded samples with statistics already computed by the decoder.
    pub fn with_statistics(
        data: SampleData<'a>,
        width: u32,
        height: u32,
        channels: u32,
        stats: Vec<ChannelStats>,
    ) -> Result<Self, ExtractionError> {
        Self::validate(&data, width, height, channels)?;
        if stats.len() != channels as usize {
            return Err(ExtractionError::StatisticsMismatch {
                expected: channels as usize,
                actual: stats.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            channels,
            stats,
        })
    }

    fn validate(
        data: &SampleData<'_>,
        width: u32,
        height: u32,
        channels: u32,
    ) -> Result<(), ExtractionError> {
        if width == 0 || height == 0 || channels == 0 {
            return Err(ExtractionError::EmptyBuffer {
                width,
                height,
                channels,
            });
        }
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(ExtractionError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn bit_depth(&self) -> i32 {
        self.data.bit_depth()
    }

    pub fn samples(&self) -> SampleData<'a> {
        self.data
    }

    pub fn statistics(&self) -> &[ChannelStats] {
        &self.stats
    }

    /// Value at which a sample is considered saturated: the type maximum for
    /// integer data, otherwise the largest observed channel maximum.
    pub fn saturation_level(&self) -> f64 {
        self.data.type_max().unwrap_or_else(|| {
            self.stats
                .iter()
                .map(|s| s.max)
                .fold(f64::NEG_INFINITY, f64::max)
        })
    }

    /// Cut an `f32` working plane. `channel = None` averages all channels.
    pub fn plane(
        &self,
        channel: Option<u32>,
        subframe: Option<Subframe>,
    ) -> Result<Plane, ExtractionError> {
        if let Some(c) = channel {
            if c >= self.channels {
                return Err(ExtractionError::InvalidChannel {
                    channel: c,
                    channels: self.channels,
                });
            }
        }
        let (x0, y0, w, h) = match subframe {
            Some(s) => s.clamp_to(self.width, self.height),
            None => (0, 0, self.width, self.height),
        };
        if w == 0 || h == 0 {
            let s = subframe.unwrap_or(Subframe::new(0, 0, 0, 0));
            return Err(ExtractionError::InvalidSubframe {
                x: s.x,
                y: s.y,
                width: s.width,
                height: s.height,
                image_width: self.width,
                image_height: self.height,
            });
        }
        let full_w = self.width as usize;
        let n = full_w * self.height as usize;
        let selected: Vec<usize> = match channel {
            Some(c) => vec![c as usize],
            None => (0..self.channels as usize).collect(),
        };
        let count = selected.len() as f32;

        let mut data = Vec::with_capacity(w as usize * h as usize);
        for y in y0 as usize..(y0 + h) as usize {
            for x in x0 as usize..(x0 + w) as usize {
                let i = y * full_w + x;
                let v: f32 = selected.iter().map(|&c| self.data.get(c * n + i)).sum();
                data.push(v / count);
            }
        }
        Ok(Plane {
            data,
            width: w,
            height: h,
            origin: (x0, y0),
            binning: 1,
        })
    }
}
