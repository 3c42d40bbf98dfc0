//! ISP processing kernel and statistics records.

use serde::{Deserialize, Serialize};

use crate::capture::frame::{ImageBuffer, PixelFormat, SurfaceDesc};
use crate::control::{DynamicProperties, StatsSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IspVersion {
    V4,
    V5,
}

/// Fixed statistics shape of one ISP generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsLayout {
    pub histogram_bins: usize,
    pub lac_cols: usize,
    pub lac_rows: usize,
    pub flicker_bands: usize,
}

impl IspVersion {
    pub fn layout(self) -> StatsLayout {
        match self {
            IspVersion::V4 => StatsLayout {
                histogram_bins: 64,
                lac_cols: 8,
                lac_rows: 8,
                flicker_bands: 16,
            },
            IspVersion::V5 => StatsLayout {
                histogram_bins: 256,
                lac_cols: 16,
                lac_rows: 16,
                flicker_bands: 32,
            },
        }
    }

    /// Processed output surface for a raw input surface.
    pub fn output_surface(self, raw: SurfaceDesc) -> SurfaceDesc {
        SurfaceDesc::new(PixelFormat::Rgb24, raw.width / 2, raw.height / 2)
    }
}

/// Local-average/clip window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LacWindow {
    /// Mean R, Gr, Gb, B of the window.
    pub average: [f32; 4],
    pub clipped: u32,
    pub pixels: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LacWindows {
    pub cols: usize,
    pub rows: usize,
    pub windows: Vec<LacWindow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsV4 {
    pub histogram: Vec<u32>,
    pub lac: LacWindows,
    pub flicker_bands: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsV5 {
    pub histogram: Vec<u32>,
    /// R, Gr, Gb, B histograms.
    pub channel_histograms: [Vec<u32>; 4],
    pub lac: LacWindows,
    pub flicker_bands: Vec<f32>,
}

/// ISP statistics, shaped by the ISP generation chosen at pipeline construction.
#[derive(Debug, Clone, PartialEq)]
pub enum IspStats {
    V4(StatsV4),
    V5(StatsV5),
}

impl IspStats {
    pub fn new(version: IspVersion) -> Self {
        let layout = version.layout();
        let lac = LacWindows {
            cols: layout.lac_cols,
            rows: layout.lac_rows,
            windows: vec![LacWindow::default(); layout.lac_cols * layout.lac_rows],
        };
        match version {
            IspVersion::V4 => IspStats::V4(StatsV4 {
                histogram: vec![0; layout.histogram_bins],
                lac,
                flicker_bands: vec![0.0; layout.flicker_bands],
            }),
            IspVersion::V5 => IspStats::V5(StatsV5 {
                histogram: vec![0; layout.histogram_bins],
                channel_histograms: std::array::from_fn(|_| vec![0; layout.histogram_bins]),
                lac,
                flicker_bands: vec![0.0; layout.flicker_bands],
            }),
        }
    }

    pub fn version(&self) -> IspVersion {
        match self {
            IspStats::V4(_) => IspVersion::V4,
            IspStats::V5(_) => IspVersion::V5,
        }
    }

    /// Luma histogram over the full 8-bit range.
    pub fn histogram(&self) -> &[u32] {
        match self {
            IspStats::V4(s) => &s.histogram,
            IspStats::V5(s) => &s.histogram,
        }
    }

    pub fn lac(&self) -> &LacWindows {
        match self {
            IspStats::V4(s) => &s.lac,
            IspStats::V5(s) => &s.lac,
        }
    }

    pub fn flicker_bands(&self) -> &[f32] {
        match self {
            IspStats::V4(s) => &s.flicker_bands,
            IspStats::V5(s) => &s.flicker_bands,
        }
    }

    /// Mean luma on a 0-255 scale, from the histogram bin centers.
    pub fn mean_luma(&self) -> f32 {
        let hist = self.histogram();
        let bin_width = 256.0 / hist.len() as f32;
        let (mut sum, mut count) = (0.0f64, 0u64);
        for (bin, &n) in hist.iter().enumerate() {
            sum += (bin as f64 + 0.5) * bin_width as f64 * n as f64;
            count += n as u64;
        }
        if count == 0 {
            0.0
        } else {
            (sum / count as f64) as f32
        }
    }

    fn clear(&mut self) {
        let (hist, lac, bands) = match self {
            IspStats::V4(s) => (&mut s.histogram, &mut s.lac, &mut s.flicker_bands),
            IspStats::V5(s) => {
                for ch in s.channel_histograms.iter_mut() {
                    ch.fill(0);
                }
                (&mut s.histogram, &mut s.lac, &mut s.flicker_bands)
            }
        };
        hist.fill(0);
        lac.windows.fill(LacWindow::default());
        bands.fill(0.0);
    }
}

/// Pooled statistics slot.
#[derive(Debug)]
pub struct StatsRecord {
    pub sequence: u64,
    pub stats: IspStats,
}

impl StatsRecord {
    pub fn new(version: IspVersion) -> Self {
        Self {
            sequence: 0,
            stats: IspStats::new(version),
        }
    }
}

fn luma(r: f32, g: f32, b: f32) -> f32 {
    0.299 * r + 0.587 * g + 0.114 * b
}

/// Gather statistics from the first raw plane.
pub fn compute_stats(raw: &ImageBuffer, settings: &StatsSettings, out: &mut IspStats) {
    out.clear();
    let desc = raw.desc();
    let plane = raw.plane(0);
    let w = desc.width as usize;
    let qw = w / 2;
    let qh = desc.height as usize / 2;
    if qw == 0 || qh == 0 {
        return;
    }

    let bins = out.histogram().len();
    let (cols, rows) = (out.lac().cols, out.lac().rows);
    let band_count = out.flicker_bands().len();
    let mut sums = vec![[0.0f32; 4]; cols * rows];
    let mut band_sums = vec![(0.0f32, 0u32); band_count];

    for qy in 0..qh {
        let top = 2 * qy * w;
        let bottom = top + w;
        let band = qy * band_count / qh;
        for qx in 0..qw {
            let quad = [
                plane[top + 2 * qx],
                plane[top + 2 * qx + 1],
                plane[bottom + 2 * qx],
                plane[bottom + 2 * qx + 1],
            ];
            let [r, gr, gb, b] = quad.map(f32::from);
            let y = luma(r, (gr + gb) * 0.5, b);
            let bin = ((y as usize) * bins / 256).min(bins - 1);

            let wi = (qy * rows / qh) * cols + qx * cols / qw;
            for (c, v) in quad.iter().enumerate() {
                sums[wi][c] += f32::from(*v);
            }
            let clipped = quad.iter().any(|&v| v >= settings.clip_threshold);

            match out {
                IspStats::V4(s) => {
                    s.histogram[bin] += 1;
                    tally(&mut s.lac.windows[wi], clipped);
                }
                IspStats::V5(s) => {
                    s.histogram[bin] += 1;
                    for (c, v) in quad.iter().enumerate() {
                        s.channel_histograms[c][(*v as usize) * bins / 256] += 1;
                    }
                    tally(&mut s.lac.windows[wi], clipped);
                }
            }
            band_sums[band].0 += y;
            band_sums[band].1 += 1;
        }
    }

    let windows = match out {
        IspStats::V4(s) => &mut s.lac.windows,
        IspStats::V5(s) => &mut s.lac.windows,
    };
    for (window, sum) in windows.iter_mut().zip(&sums) {
        if window.pixels > 0 {
            let n = window.pixels as f32;
            window.average = (*sum).map(|v| v / n);
        }
    }

    if settings.flicker_detection {
        let bands = match out {
            IspStats::V4(s) => &mut s.flicker_bands,
            IspStats::V5(s) => &mut s.flicker_bands,
        };
        for (band, (sum, n)) in bands.iter_mut().zip(band_sums) {
            if n > 0 {
                *band = sum / n as f32;
            }
        }
    }
}

fn tally(window: &mut LacWindow, clipped: bool) {
    window.pixels += 1;
    if clipped {
        window.clipped += 1;
    }
}

/// Demosaic RGGB quads into half-resolution RGB, then apply white balance,
/// color correction and digital gain.
pub fn process_image(raw: &ImageBuffer, settings: &DynamicProperties, out: &mut ImageBuffer) {
    let src = raw.desc();
    let dst = out.desc();
    let w = src.width as usize;
    let qw = (dst.width as usize).min(w / 2);
    let qh = (dst.height as usize).min(src.height as usize / 2);
    let wb = settings.wb_gains;
    let ccm = settings.isp.ccm.0;
    let gain = settings.digital_gain;

    for sibling in 0..raw.sibling_count().min(out.sibling_count()) {
        let input = raw.plane(sibling);
        let output = out.plane_mut(sibling);
        for qy in 0..qh {
            let top = 2 * qy * w;
            let bottom = top + w;
            for qx in 0..qw {
                let r = f32::from(input[top + 2 * qx]) * wb.r;
                let g = (f32::from(input[top + 2 * qx + 1]) * wb.gr
                    + f32::from(input[bottom + 2 * qx]) * wb.gb)
                    * 0.5;
                let b = f32::from(input[bottom + 2 * qx + 1]) * wb.b;
                let o = (qy * dst.width as usize + qx) * 3;
                for (c, row) in ccm.iter().enumerate() {
                    let v = (row[0] * r + row[1] * g + row[2] * b) * gain;
                    output[o + c] = v.clamp(0.0, 255.0) as u8;
                }
            }
        }
    }
}
