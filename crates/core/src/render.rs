//! Colour-map tiles and encode them as images.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};

use crate::config::{ColormapName, ImageFormat, PyramidConfig};
use crate::roi::Overlay;
use crate::tiles::TileSpec;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("tile has {got} pixels, expected {width}x{height}")]
    Shape { width: usize, height: usize, got: usize },

    #[error("tile of {width}x{height} is too large to encode")]
    TooLarge { width: usize, height: usize },

    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

// Polynomial fit of matplotlib's viridis, coefficients lowest order first.
const VIRIDIS: [[f64; 3]; 7] = [
    [0.2777273272234177, 0.005407344544966578, 0.3340998053353061],
    [0.1050930431085774, 1.404613529898575, 1.384590162594685],
    [-0.3308618287255563, 0.214847559468213, 0.09509516302823659],
    [-4.634230498983486, -5.799100973351585, -19.33244095627987],
    [6.228269936347081, 14.17993336680509, 56.69055260068105],
    [4.776384997670288, -13.74514537774601, -65.35303263337234],
    [-5.435455855934631, 4.645852612178535, 26.3124352495832],
];

const ROI_FILL: [u8; 3] = [0xFF, 0x6B, 0x35];
const ROI_FILL_ALPHA: f32 = 0.4;
const ROI_BORDER: [u8; 3] = [0xD8, 0x43, 0x15];
const ROI_BORDER_PX: usize = 2;

fn to_byte(c: f64) -> u8 {
    (c.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Map a normalized value to RGB. Inputs outside [0, 1] are clamped.
pub fn colormap(name: ColormapName, value: f32) -> [u8; 3] {
    let t = if value.is_finite() { (value as f64).clamp(0.0, 1.0) } else { 0.0 };
    match name {
        ColormapName::Grayscale => {
            let g = to_byte(t);
            [g, g, g]
        }
        ColormapName::Viridis => {
            let mut rgb = [0u8; 3];
            for (ch, out) in rgb.iter_mut().enumerate() {
                // Horner evaluation from the highest coefficient down.
                let c = VIRIDIS.iter().rev().fold(0.0, |acc, coeffs| acc * t + coeffs[ch]);
                *out = to_byte(c);
            }
            rgb
        }
    }
}

/// Turns tiles into encoded image bytes. Called from worker threads.
pub trait TileRenderer: Send + Sync {
    /// File extension for keys of tiles this renderer produces.
    fn extension(&self) -> &str;

    fn render(&self, tile: &TileSpec) -> Result<Vec<u8>, RenderError>;
}

/// Colour-mapped JPEG or PNG tiles via the `image` crate.
#[derive(Debug, Clone, Copy)]
pub struct ImageRenderer {
    pub colormap: ColormapName,
    pub format: ImageFormat,
    pub quality: u8,
}

impl ImageRenderer {
    pub fn from_config(config: &PyramidConfig) -> Self {
        Self {
            colormap: config.colormap,
            format: config.image_format,
            quality: config.jpeg_quality,
        }
    }

    /// Interleaved RGB bytes for a tile, top row first, with its overlays
    /// drawn on top.
    pub fn rgb(&self, tile: &TileSpec) -> Vec<u8> {
        let mut rgb: Vec<u8> = tile
            .pixels
            .iter()
            .flat_map(|&v| colormap(self.colormap, v))
            .collect();
        for overlay in &tile.overlays {
            paint_overlay(&mut rgb, tile.width, tile.height, overlay);
        }
        rgb
    }
}

fn blend(base: u8, over: u8, alpha: f32) -> u8 {
    (base as f32 * (1.0 - alpha) + over as f32 * alpha).round() as u8
}

/// Translucent fill with an opaque border on the sides the overlay marks.
fn paint_overlay(rgb: &mut [u8], width: usize, height: usize, o: &Overlay) {
    let (x1, y1) = (o.x1.min(width), o.y1.min(height));
    for y in o.y0..y1 {
        for x in o.x0..x1 {
            let on_border = (o.left && x < o.x0 + ROI_BORDER_PX)
                || (o.right && x + ROI_BORDER_PX >= o.x1)
                || (o.top && y < o.y0 + ROI_BORDER_PX)
                || (o.bottom && y + ROI_BORDER_PX >= o.y1);
            let i = (y * width + x) * 3;
            let px = &mut rgb[i..i + 3];
            if on_border {
                px.copy_from_slice(&ROI_BORDER);
            } else {
                for (c, fill) in px.iter_mut().zip(ROI_FILL) {
                    *c = blend(*c, fill, ROI_FILL_ALPHA);
                }
            }
        }
    }
}

impl TileRenderer for ImageRenderer {
    fn extension(&self) -> &str {
        self.format.extension()
    }

    fn render(&self, tile: &TileSpec) -> Result<Vec<u8>, RenderError> {
        if tile.pixels.len() != tile.width * tile.height || tile.pixels.is_empty() {
            return Err(RenderError::Shape {
                width: tile.width,
                height: tile.height,
                got: tile.pixels.len(),
            });
        }
        let too_large = || RenderError::TooLarge { width: tile.width, height: tile.height };
        let width = u32::try_from(tile.width).map_err(|_| too_large())?;
        let height = u32::try_from(tile.height).map_err(|_| too_large())?;

        let rgb = self.rgb(tile);
        let mut buf = Vec::new();
        match self.format {
            ImageFormat::Jpeg => {
                JpegEncoder::new_with_quality(&mut buf, self.quality).write_image(
                    &rgb,
                    width,
                    height,
                    ExtendedColorType::Rgb8,
                )?;
            }
            ImageFormat::Png => {
                PngEncoder::new(&mut buf).write_image(&rgb, width, height, ExtendedColorType::Rgb8)?;
            }
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(width: usize, height: usize) -> TileSpec {
        let n = width * height;
        TileSpec {
            zoom: 0,
            x: 0,
            y: 0,
            width,
            height,
            pixels: (0..n).map(|i| i as f32 / (n - 1).max(1) as f32).collect(),
            overlays: Vec::new(),
        }
    }

    #[test]
    fn test_viridis_endpoints() {
        let lo = colormap(ColormapName::Viridis, 0.0);
        let hi = colormap(ColormapName::Viridis, 1.0);
        // matplotlib viridis: #440154 .. #fde725
        for (got, want) in lo.iter().zip([68u8, 1, 84]) {
            assert!((*got as i32 - want as i32).abs() <= 4, "low end {:?}", lo);
        }
        for (got, want) in hi.iter().zip([253u8, 231, 37]) {
            assert!((*got as i32 - want as i32).abs() <= 4, "high end {:?}", hi);
        }
    }

    #[test]
    fn test_viridis_brightens() {
        let luma = |rgb: [u8; 3]| rgb.iter().map(|&c| c as u32).sum::<u32>();
        let mut last = 0;
        for i in 0..=10 {
            let l = luma(colormap(ColormapName::Viridis, i as f32 / 10.0));
            assert!(l >= last, "luma dropped at {}", i);
            last = l;
        }
    }

    #[test]
    fn test_grayscale_and_clamping() {
        assert_eq!(colormap(ColormapName::Grayscale, 0.0), [0, 0, 0]);
        assert_eq!(colormap(ColormapName::Grayscale, 1.0), [255, 255, 255]);
        assert_eq!(colormap(ColormapName::Grayscale, 0.5), [128, 128, 128]);
        assert_eq!(colormap(ColormapName::Grayscale, 7.0), [255, 255, 255]);
        assert_eq!(colormap(ColormapName::Grayscale, f32::NAN), [0, 0, 0]);
    }

    #[test]
    fn test_jpeg_magic() {
        let renderer = ImageRenderer::from_config(&PyramidConfig::default());
        assert_eq!(renderer.extension(), "jpg");
        let bytes = renderer.render(&tile(16, 8)).unwrap();
        assert_eq!(&bytes[..3], &[0xFF, 0xD8, 0xFF]);
    }

    #[test]
    fn test_png_decodes_to_tile_size() {
        let renderer = ImageRenderer {
            colormap: ColormapName::Grayscale,
            format: ImageFormat::Png,
            quality: 85,
        };
        let t = tile(5, 3);
        let bytes = renderer.render(&t).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
        let img = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (5, 3));
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(img.get_pixel(4, 2).0, [255, 255, 255]);
    }

    #[test]
    fn test_overlay_border_and_fill() {
        let renderer = ImageRenderer {
            colormap: ColormapName::Grayscale,
            format: ImageFormat::Png,
            quality: 85,
        };
        let mut t = tile(12, 10);
        t.pixels.iter_mut().for_each(|p| *p = 0.0);
        t.overlays.push(Overlay { x0: 2, y0: 1, x1: 10, y1: 9, left: true, top: true, right: false, bottom: true });

        let img = image::load_from_memory(&renderer.render(&t).unwrap()).unwrap().to_rgb8();
        assert_eq!(img.get_pixel(2, 5).0, ROI_BORDER);
        assert_eq!(img.get_pixel(6, 1).0, ROI_BORDER);
        assert_eq!(img.get_pixel(6, 8).0, ROI_BORDER);
        // Fill over black: 40% of the fill colour.
        assert_eq!(img.get_pixel(6, 5).0, [102, 43, 21]);
        // Open right side: no border where the box continues into the next tile.
        assert_eq!(img.get_pixel(9, 5).0, [102, 43, 21]);
        assert_eq!(img.get_pixel(11, 5).0, [0, 0, 0]);
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_shape_mismatch() {
        let renderer = ImageRenderer::from_config(&PyramidConfig::default());
        let mut t = tile(4, 4);
        t.pixels.pop();
        assert!(matches!(renderer.render(&t), Err(RenderError::Shape { .. })));
    }
}
