//! Pixel layouts understood by the encoder, and conversion between them
//!
//! Conversion is pure: no state survives between calls and rows are processed in parallel
//! with rayon. Vertical orientation is never touched here; bottom-up captures are flipped by
//! the encoder's `vflip` filter instead.

use rayon::prelude::*;
use serde_derive::{Deserialize, Serialize};

use crate::error::ConversionError;

/// Frame layouts, named after their ffmpeg `-pix_fmt` spelling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Rgba,
    Bgra,
    Argb,
    Yuv420p,
    Yuv422p,
    Yuv444p,
    Nv12,
    Nv21,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 10] = [
        PixelFormat::Rgb24,
        PixelFormat::Bgr24,
        PixelFormat::Rgba,
        PixelFormat::Bgra,
        PixelFormat::Argb,
        PixelFormat::Yuv420p,
        PixelFormat::Yuv422p,
        PixelFormat::Yuv444p,
        PixelFormat::Nv12,
        PixelFormat::Nv21,
    ];

    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Rgba => "rgba",
            PixelFormat::Bgra => "bgra",
            PixelFormat::Argb => "argb",
            PixelFormat::Yuv420p => "yuv420p",
            PixelFormat::Yuv422p => "yuv422p",
            PixelFormat::Yuv444p => "yuv444p",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Nv21 => "nv21",
        }
    }

    /// Parse an ffmpeg pixel format name. `i420`, `i422` and `i444` are accepted as aliases.
    pub fn from_ffmpeg_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        match name.as_str() {
            "i420" => return Some(PixelFormat::Yuv420p),
            "i422" => return Some(PixelFormat::Yuv422p),
            "i444" => return Some(PixelFormat::Yuv444p),
            _ => {}
        }
        Self::ALL.into_iter().find(|f| f.ffmpeg_name() == name)
    }

    /// Exact byte size of one `width` x `height` frame in this layout
    pub fn required_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match packed_order(self) {
            Some(order) => w * h * order.bpp,
            None => {
                let layout = YuvLayout::new(self, width, height);
                w * h + 2 * layout.chroma_width * layout.chroma_height
            }
        }
    }
}

/// Free function form of [`PixelFormat::required_size`]
pub fn required_size(format: PixelFormat, width: u32, height: u32) -> usize {
    format.required_size(width, height)
}

#[derive(Debug, Clone, Copy)]
struct PackedOrder {
    bpp: usize,
    r: usize,
    g: usize,
    b: usize,
    a: Option<usize>,
}

fn packed_order(format: PixelFormat) -> Option<PackedOrder> {
    let order = |bpp, r, g, b, a| PackedOrder { bpp, r, g, b, a };
    match format {
        PixelFormat::Rgb24 => Some(order(3, 0, 1, 2, None)),
        PixelFormat::Bgr24 => Some(order(3, 2, 1, 0, None)),
        PixelFormat::Rgba => Some(order(4, 0, 1, 2, Some(3))),
        PixelFormat::Bgra => Some(order(4, 2, 1, 0, Some(3))),
        PixelFormat::Argb => Some(order(4, 1, 2, 3, Some(0))),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
enum ChromaPlacement {
    Planar,
    // V sample first when swapped (nv21)
    Interleaved { swapped: bool },
}

#[derive(Debug, Clone, Copy)]
struct YuvLayout {
    width: usize,
    height: usize,
    x_shift: u32,
    y_shift: u32,
    chroma_width: usize,
    chroma_height: usize,
    placement: ChromaPlacement,
}

impl YuvLayout {
    fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        let (x_shift, y_shift, placement) = match format {
            PixelFormat::Yuv420p => (1, 1, ChromaPlacement::Planar),
            PixelFormat::Yuv422p => (1, 0, ChromaPlacement::Planar),
            PixelFormat::Nv12 => (1, 1, ChromaPlacement::Interleaved { swapped: false }),
            PixelFormat::Nv21 => (1, 1, ChromaPlacement::Interleaved { swapped: true }),
            _ => (0, 0, ChromaPlacement::Planar),
        };
        let (w, h) = (width as usize, height as usize);
        Self {
            width: w,
            height: h,
            x_shift,
            y_shift,
            chroma_width: w.div_ceil(1 << x_shift),
            chroma_height: h.div_ceil(1 << y_shift),
            placement,
        }
    }

    fn luma_len(&self) -> usize {
        self.width * self.height
    }

    fn chroma_plane_len(&self) -> usize {
        self.chroma_width * self.chroma_height
    }

    fn read_chroma(&self, chroma: &[u8], cx: usize, cy: usize) -> (u8, u8) {
        match self.placement {
            ChromaPlacement::Planar => {
                let idx = cy * self.chroma_width + cx;
                (chroma[idx], chroma[self.chroma_plane_len() + idx])
            }
            ChromaPlacement::Interleaved { swapped } => {
                let idx = (cy * self.chroma_width + cx) * 2;
                if swapped {
                    (chroma[idx + 1], chroma[idx])
                } else {
                    (chroma[idx], chroma[idx + 1])
                }
            }
        }
    }

    /// Fill every chroma sample with `sample(cx, cy) -> (u, v)`
    fn write_chroma<F>(&self, chroma: &mut [u8], sample: F)
    where
        F: Fn(usize, usize) -> (u8, u8) + Sync,
    {
        let cw = self.chroma_width;
        match self.placement {
            ChromaPlacement::Planar => {
                let (u_plane, v_plane) = chroma.split_at_mut(self.chroma_plane_len());
                u_plane
                    .par_chunks_mut(cw)
                    .zip(v_plane.par_chunks_mut(cw))
                    .enumerate()
                    .for_each(|(cy, (u_row, v_row))| {
                        for cx in 0..cw {
                            let (u, v) = sample(cx, cy);
                            u_row[cx] = u;
                            v_row[cx] = v;
                        }
                    });
            }
            ChromaPlacement::Interleaved { swapped } => {
                chroma
                    .par_chunks_mut(cw * 2)
                    .enumerate()
                    .for_each(|(cy, row)| {
                        for cx in 0..cw {
                            let (u, v) = sample(cx, cy);
                            let (first, second) = if swapped { (v, u) } else { (u, v) };
                            row[cx * 2] = first;
                            row[cx * 2 + 1] = second;
                        }
                    });
            }
        }
    }
}

// BT.709 limited range, 8.8 fixed point
#[inline]
fn rgb_to_luma(r: i32, g: i32, b: i32) -> u8 {
    (((47 * r + 157 * g + 16 * b + 128) >> 8) + 16).clamp(0, 255) as u8
}

#[inline]
fn rgb_to_chroma(r: i32, g: i32, b: i32) -> (u8, u8) {
    let u = ((-26 * r - 86 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 102 * g - 10 * b + 128) >> 8) + 128;
    (u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let c = 298 * (y as i32 - 16);
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = (c + 459 * e + 128) >> 8;
    let g = (c - 55 * d - 136 * e + 128) >> 8;
    let b = (c + 541 * d + 128) >> 8;
    (
        r.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        b.clamp(0, 255) as u8,
    )
}

/// Convert one frame from `in_format` to `out_format`.
///
/// Both buffers must hold at least [`required_size`] bytes for their format; only that prefix
/// is read or written.
pub fn convert(
    input: &[u8],
    in_format: PixelFormat,
    output: &mut [u8],
    out_format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<(), ConversionError> {
    if width == 0 || height == 0 {
        return Err(ConversionError::EmptyFrame { width, height });
    }
    let in_size = in_format.required_size(width, height);
    let out_size = out_format.required_size(width, height);
    if input.len() < in_size {
        return Err(ConversionError::BufferTooSmall {
            which: "input",
            required: in_size,
            actual: input.len(),
        });
    }
    if output.len() < out_size {
        return Err(ConversionError::BufferTooSmall {
            which: "output",
            required: out_size,
            actual: output.len(),
        });
    }
    let input = &input[..in_size];
    let output = &mut output[..out_size];

    if in_format == out_format {
        output.copy_from_slice(input);
        return Ok(());
    }

    match (packed_order(in_format), packed_order(out_format)) {
        (Some(src), Some(dst)) => repack(input, src, output, dst, width as usize),
        (Some(src), None) => packed_to_yuv(input, src, output, YuvLayout::new(out_format, width, height)),
        (None, Some(dst)) => yuv_to_packed(input, YuvLayout::new(in_format, width, height), output, dst),
        (None, None) => replane(
            input,
            YuvLayout::new(in_format, width, height),
            output,
            YuvLayout::new(out_format, width, height),
        ),
    }
    Ok(())
}

fn repack(input: &[u8], src: PackedOrder, output: &mut [u8], dst: PackedOrder, width: usize) {
    output
        .par_chunks_mut(width * dst.bpp)
        .zip(input.par_chunks(width * src.bpp))
        .for_each(|(out_row, in_row)| {
            for (o, i) in out_row
                .chunks_exact_mut(dst.bpp)
                .zip(in_row.chunks_exact(src.bpp))
            {
                o[dst.r] = i[src.r];
                o[dst.g] = i[src.g];
                o[dst.b] = i[src.b];
                if let Some(a) = dst.a {
                    o[a] = src.a.map(|sa| i[sa]).unwrap_or(255);
                }
            }
        });
}

fn packed_to_yuv(input: &[u8], src: PackedOrder, output: &mut [u8], layout: YuvLayout) {
    let stride = layout.width * src.bpp;
    let (luma, chroma) = output.split_at_mut(layout.luma_len());

    luma.par_chunks_mut(layout.width)
        .zip(input.par_chunks(stride))
        .for_each(|(out_row, in_row)| {
            for (o, px) in out_row.iter_mut().zip(in_row.chunks_exact(src.bpp)) {
                *o = rgb_to_luma(px[src.r] as i32, px[src.g] as i32, px[src.b] as i32);
            }
        });

    // Chroma takes the average colour of its subsampling block
    layout.write_chroma(chroma, |cx, cy| {
        let x0 = cx << layout.x_shift;
        let y0 = cy << layout.y_shift;
        let x1 = (x0 + (1 << layout.x_shift)).min(layout.width);
        let y1 = (y0 + (1 << layout.y_shift)).min(layout.height);
        let (mut r, mut g, mut b, mut n) = (0i32, 0i32, 0i32, 0i32);
        for y in y0..y1 {
            let row = &input[y * stride..(y + 1) * stride];
            for x in x0..x1 {
                let px = &row[x * src.bpp..(x + 1) * src.bpp];
                r += px[src.r] as i32;
                g += px[src.g] as i32;
                b += px[src.b] as i32;
                n += 1;
            }
        }
        rgb_to_chroma(r / n, g / n, b / n)
    });
}

fn yuv_to_packed(input: &[u8], layout: YuvLayout, output: &mut [u8], dst: PackedOrder) {
    let (luma, chroma) = input.split_at(layout.luma_len());
    output
        .par_chunks_mut(layout.width * dst.bpp)
        .enumerate()
        .for_each(|(y, out_row)| {
            let cy = y >> layout.y_shift;
            for (x, o) in out_row.chunks_exact_mut(dst.bpp).enumerate() {
                let (u, v) = layout.read_chroma(chroma, x >> layout.x_shift, cy);
                let (r, g, b) = yuv_to_rgb(luma[y * layout.width + x], u, v);
                o[dst.r] = r;
                o[dst.g] = g;
                o[dst.b] = b;
                if let Some(a) = dst.a {
                    o[a] = 255;
                }
            }
        });
}

fn replane(input: &[u8], src: YuvLayout, output: &mut [u8], dst: YuvLayout) {
    let (in_luma, in_chroma) = input.split_at(src.luma_len());
    let (out_luma, out_chroma) = output.split_at_mut(dst.luma_len());
    out_luma.copy_from_slice(in_luma);

    if (src.x_shift, src.y_shift) == (dst.x_shift, dst.y_shift) {
        dst.write_chroma(out_chroma, |cx, cy| src.read_chroma(in_chroma, cx, cy));
        return;
    }

    // Average the source chroma under each destination block, a single pixel block replicates
    dst.write_chroma(out_chroma, |cx, cy| {
        let x0 = cx << dst.x_shift;
        let y0 = cy << dst.y_shift;
        let x1 = (x0 + (1 << dst.x_shift)).min(dst.width);
        let y1 = (y0 + (1 << dst.y_shift)).min(dst.height);
        let (mut u, mut v, mut n) = (0u32, 0u32, 0u32);
        for y in y0..y1 {
            for x in x0..x1 {
                let (su, sv) = src.read_chroma(in_chroma, x >> src.x_shift, y >> src.y_shift);
                u += su as u32;
                v += sv as u32;
                n += 1;
            }
        }
        (((u + n / 2) / n) as u8, ((v + n / 2) / n) as u8)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(format: PixelFormat, width: u32, height: u32, rgb: (u8, u8, u8)) -> Vec<u8> {
        let mut rgb24 = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..width * height {
            rgb24.extend_from_slice(&[rgb.0, rgb.1, rgb.2]);
        }
        let mut out = vec![0u8; format.required_size(width, height)];
        convert(&rgb24, PixelFormat::Rgb24, &mut out, format, width, height).expect("convert");
        out
    }

    #[test]
    fn required_sizes_match_layouts() {
        assert_eq!(required_size(PixelFormat::Rgb24, 1920, 1080), 1920 * 1080 * 3);
        assert_eq!(required_size(PixelFormat::Argb, 4, 4), 64);
        assert_eq!(required_size(PixelFormat::Yuv420p, 1920, 1080), 1920 * 1080 * 3 / 2);
        assert_eq!(required_size(PixelFormat::Nv12, 1920, 1080), 1920 * 1080 * 3 / 2);
        assert_eq!(required_size(PixelFormat::Yuv422p, 1920, 1080), 1920 * 1080 * 2);
        assert_eq!(required_size(PixelFormat::Yuv444p, 1920, 1080), 1920 * 1080 * 3);
        // odd sizes round the chroma planes up
        assert_eq!(required_size(PixelFormat::Yuv420p, 5, 3), 15 + 2 * 3 * 2);
        assert_eq!(required_size(PixelFormat::Nv21, 5, 3), 15 + 2 * 3 * 2);
        assert_eq!(required_size(PixelFormat::Yuv422p, 5, 3), 15 + 2 * 3 * 3);
    }

    #[test]
    fn every_supported_conversion_fills_exactly_required_size() {
        for &(w, h) in &[(1u32, 1u32), (2, 2), (5, 3), (16, 9), (33, 17)] {
            let source = solid(PixelFormat::Bgra, w, h, (10, 200, 90));
            for target in PixelFormat::ALL {
                // one sentinel byte past the frame must stay untouched
                let size = target.required_size(w, h);
                let mut out = vec![0xAAu8; size + 1];
                convert(&source, PixelFormat::Bgra, &mut out, target, w, h).expect("convert");
                assert_eq!(out[size], 0xAA, "{target:?} wrote past {size} bytes at {w}x{h}");
            }
        }
    }

    #[test]
    fn repack_swaps_channels_and_fills_alpha() {
        let bgra = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut rgb = [0u8; 6];
        convert(&bgra, PixelFormat::Bgra, &mut rgb, PixelFormat::Rgb24, 2, 1).expect("convert");
        assert_eq!(rgb, [3, 2, 1, 7, 6, 5]);

        let mut argb = [0u8; 8];
        convert(&rgb, PixelFormat::Rgb24, &mut argb, PixelFormat::Argb, 2, 1).expect("convert");
        assert_eq!(argb, [255, 3, 2, 1, 255, 7, 6, 5]);
    }

    #[test]
    fn limited_range_extremes() {
        let white = solid(PixelFormat::Yuv444p, 2, 2, (255, 255, 255));
        assert_eq!(&white[..4], &[235; 4]);
        assert_eq!(&white[4..], &[128; 8]);

        let black = solid(PixelFormat::Yuv420p, 2, 2, (0, 0, 0));
        assert_eq!(black, vec![16, 16, 16, 16, 128, 128]);
    }

    #[test]
    fn semi_planar_interleaves_chroma_of_planar() {
        let (w, h) = (6, 4);
        let mut rgb = Vec::new();
        for i in 0..w * h {
            rgb.extend_from_slice(&[(i * 7) as u8, (i * 13) as u8, (255 - i * 5) as u8]);
        }
        let mut i420 = vec![0u8; PixelFormat::Yuv420p.required_size(w, h)];
        let mut nv12 = vec![0u8; PixelFormat::Nv12.required_size(w, h)];
        let mut nv21 = vec![0u8; PixelFormat::Nv21.required_size(w, h)];
        convert(&rgb, PixelFormat::Rgb24, &mut i420, PixelFormat::Yuv420p, w, h).expect("i420");
        convert(&rgb, PixelFormat::Rgb24, &mut nv12, PixelFormat::Nv12, w, h).expect("nv12");
        convert(&i420, PixelFormat::Yuv420p, &mut nv21, PixelFormat::Nv21, w, h).expect("nv21");

        let luma = (w * h) as usize;
        let plane = 3 * 2;
        assert_eq!(&i420[..luma], &nv12[..luma]);
        for i in 0..plane {
            let (u, v) = (i420[luma + i], i420[luma + plane + i]);
            assert_eq!((nv12[luma + 2 * i], nv12[luma + 2 * i + 1]), (u, v));
            assert_eq!((nv21[luma + 2 * i], nv21[luma + 2 * i + 1]), (v, u));
        }
    }

    #[test]
    fn yuv_back_to_rgb_is_close() {
        let nv12 = solid(PixelFormat::Nv12, 4, 2, (200, 100, 50));
        let mut rgb = vec![0u8; 4 * 2 * 3];
        convert(&nv12, PixelFormat::Nv12, &mut rgb, PixelFormat::Rgb24, 4, 2).expect("convert");
        for px in rgb.chunks_exact(3) {
            assert!((px[0] as i32 - 200).abs() <= 3, "{px:?}");
            assert!((px[1] as i32 - 100).abs() <= 3, "{px:?}");
            assert!((px[2] as i32 - 50).abs() <= 3, "{px:?}");
        }
    }

    #[test]
    fn rejects_short_buffers() {
        let mut out = vec![0u8; 10];
        let err = convert(&[0u8; 12], PixelFormat::Rgb24, &mut out, PixelFormat::Yuv444p, 2, 2)
            .expect_err("output too small");
        assert!(matches!(err, ConversionError::BufferTooSmall { which: "output", .. }));

        let err = convert(&[0u8; 2], PixelFormat::Rgb24, &mut out, PixelFormat::Rgb24, 2, 2)
            .expect_err("input too small");
        assert!(matches!(err, ConversionError::BufferTooSmall { which: "input", .. }));
    }

    /// 4x2 i444 frame with distinct chroma per pixel
    fn i444_ramp() -> Vec<u8> {
        let mut frame: Vec<u8> = (0..8).map(|i| 16 + i * 10).collect();
        frame.extend([10u8, 20, 30, 40, 50, 60, 70, 81]);
        frame.extend([200u8, 190, 180, 170, 160, 150, 140, 131]);
        frame
    }

    #[test]
    fn downsamples_chroma_by_averaging() {
        let i444 = i444_ramp();
        let luma = &i444[..8];

        let mut i422 = vec![0u8; PixelFormat::Yuv422p.required_size(4, 2)];
        convert(&i444, PixelFormat::Yuv444p, &mut i422, PixelFormat::Yuv422p, 4, 2).expect("i422");
        assert_eq!(&i422[..8], luma);
        assert_eq!(&i422[8..12], &[15, 35, 55, 76]);
        assert_eq!(&i422[12..], &[195, 175, 155, 136]);

        let mut i420 = vec![0u8; PixelFormat::Yuv420p.required_size(4, 2)];
        convert(&i444, PixelFormat::Yuv444p, &mut i420, PixelFormat::Yuv420p, 4, 2).expect("i420");
        assert_eq!(&i420[..8], luma);
        // (10 + 20 + 50 + 60) / 4 and (30 + 40 + 70 + 81) / 4 rounded
        assert_eq!(&i420[8..], &[35, 55, 175, 155]);

        let mut nv12 = vec![0u8; PixelFormat::Nv12.required_size(4, 2)];
        convert(&i444, PixelFormat::Yuv444p, &mut nv12, PixelFormat::Nv12, 4, 2).expect("nv12");
        assert_eq!(&nv12[..8], luma);
        assert_eq!(&nv12[8..], &[35, 175, 55, 155]);

        // each 4:2:2 sample is already rounded once
        let mut from_422 = vec![0u8; PixelFormat::Yuv420p.required_size(4, 2)];
        convert(&i422, PixelFormat::Yuv422p, &mut from_422, PixelFormat::Yuv420p, 4, 2).expect("422 to 420");
        assert_eq!(&from_422[..8], luma);
        assert_eq!(&from_422[8..], &[35, 56, 175, 156]);
    }

    #[test]
    fn upsampling_replicates_and_round_trips() {
        let i420 = [16u8, 17, 18, 19, 20, 21, 22, 23, 40, 90, 200, 100];
        let mut i444 = vec![0u8; PixelFormat::Yuv444p.required_size(4, 2)];
        convert(&i420, PixelFormat::Yuv420p, &mut i444, PixelFormat::Yuv444p, 4, 2).expect("i444");
        assert_eq!(&i444[..8], &i420[..8]);
        assert_eq!(&i444[8..16], &[40, 40, 90, 90, 40, 40, 90, 90]);
        assert_eq!(&i444[16..], &[200, 200, 100, 100, 200, 200, 100, 100]);

        let mut back = vec![0u8; i420.len()];
        convert(&i444, PixelFormat::Yuv444p, &mut back, PixelFormat::Yuv420p, 4, 2).expect("back");
        assert_eq!(back, i420);
    }

    #[test]
    fn parses_ffmpeg_names() {
        assert_eq!(PixelFormat::from_ffmpeg_name("NV12"), Some(PixelFormat::Nv12));
        assert_eq!(PixelFormat::from_ffmpeg_name("i420"), Some(PixelFormat::Yuv420p));
        assert_eq!(PixelFormat::from_ffmpeg_name("yuv444p"), Some(PixelFormat::Yuv444p));
        assert_eq!(PixelFormat::from_ffmpeg_name("p010le"), None);
    }
}
