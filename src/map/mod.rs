//! Floor-map reconstruction
//!
//! Turns the vendor's compressed raster plus the accumulated path trace
//! into a rendered PNG:
//!
//! 1. Normalize the base64 payload (the transport mangles `+` into spaces),
//!    decode it and LZ4-decompress to exactly `width * height` bytes.
//! 2. Remap the 8-bit grayscale values through a fixed display palette;
//!    value 127 marks unexplored area and becomes transparent, values the
//!    palette does not list replicate to direct gray.
//! 3. Overlay the path polyline and the robot position, flip vertically
//!    (device space is bottom-left origin, image space top-left) and
//!    encode as PNG.
//!
//! Rendering is a pure function of raster + overlay state, so the result
//! is cached behind two dirty flags and recomputed only when either input
//! changed. Before any raster arrives a fixed placeholder image stands in.

pub mod lz4;

use crate::error::{Error, Result};
use crate::protocol::messages::MapRaster;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::{imageops, Rgba, RgbaImage};
use std::io::Cursor;

/// Placeholder dimensions before the first map frame
const PLACEHOLDER_SIZE: (u32, u32) = (429, 255);

/// Robot marker radius in pixels
const ROBOT_RADIUS: i32 = 4;

const PATH_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const ROBOT_FILL: Rgba<u8> = Rgba([0, 0, 0, 255]);
const ROBOT_OUTLINE: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Convert a device-space position (millimeters) to pixel coordinates.
///
/// Map geometry is published in meters, positions in millimeters, so the
/// origin and resolution are scaled up before the divide.
pub fn device_to_pixel(pos: [f64; 2], x_min: f64, y_min: f64, resolution: f64) -> (i32, i32) {
    let step = resolution * 1000.0;
    let px = ((pos[0] - x_min * 1000.0) / step).round() as i32;
    let py = ((pos[1] - y_min * 1000.0) / step).round() as i32;
    (px, py)
}

/// Grayscale raster value to display color.
///
/// 127 is unexplored space and renders transparent; unlisted values fall
/// back to direct gray replication.
fn palette(value: u8) -> Rgba<u8> {
    match value {
        127 => Rgba([0, 0, 0, 0]),
        0 => Rgba([15, 60, 152, 255]),
        255 => Rgba([3, 98, 142, 255]),
        1 => Rgba([5, 153, 99, 255]),
        2 => Rgba([9, 153, 5, 255]),
        3 => Rgba([141, 153, 5, 255]),
        4 => Rgba([153, 103, 5, 255]),
        5 => Rgba([153, 40, 5, 255]),
        6 => Rgba([153, 5, 58, 255]),
        7 => Rgba([151, 5, 153, 255]),
        8 => Rgba([96, 5, 153, 255]),
        9 => Rgba([40, 5, 153, 255]),
        v => Rgba([v, v, v, 255]),
    }
}

/// Decode the raster payload of a map frame into a colored image.
pub fn decode_raster(raster: &MapRaster) -> Result<RgbaImage> {
    // '+' arrives as ' ' after the transport's form decoding
    let normalized = raster.map.replace(' ', "+");
    let compressed = BASE64
        .decode(normalized.trim())
        .map_err(|e| Error::Decode(format!("map payload is not valid base64: {e}")))?;

    let expected = raster.width as usize * raster.height as usize;
    let gray = lz4::decompress(&compressed, expected)?;

    let mut image = RgbaImage::new(raster.width, raster.height);
    for (i, &value) in gray.iter().enumerate() {
        let x = (i as u32) % raster.width;
        let y = (i as u32) / raster.width;
        image.put_pixel(x, y, palette(value));
    }
    Ok(image)
}

/// Compose path trace and robot position onto a decoded raster, flip into
/// image orientation and encode as PNG.
pub fn render_overlay(
    base: &RgbaImage,
    raster: &MapRaster,
    path: &[[f64; 2]],
    robot: Option<[f64; 2]>,
) -> Result<Vec<u8>> {
    let mut image = base.clone();

    let to_pixel = |pos: [f64; 2]| device_to_pixel(pos, raster.x_min, raster.y_min, raster.resolution);

    if path.len() > 1 {
        let pixels: Vec<(i32, i32)> = path.iter().map(|&p| to_pixel(p)).collect();
        for segment in pixels.windows(2) {
            draw_line(&mut image, segment[0], segment[1], PATH_COLOR);
        }
    }

    if let Some(pos) = robot {
        draw_robot(&mut image, to_pixel(pos));
    }

    encode_png(&imageops::flip_vertical(&image))
}

/// Placeholder served before any map frame arrives: flat background with
/// the vendor app's rectangle sentinel.
pub fn placeholder_image() -> Result<Vec<u8>> {
    let (w, h) = PLACEHOLDER_SIZE;
    let mut image = RgbaImage::from_pixel(w, h, Rgba([0, 0, 0, 255]));
    fill_rect(&mut image, (40, 40), (w as i32 - 10, h as i32 - 10), ROBOT_FILL);
    encode_png(&image)
}

pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, image::ImageFormat::Png)
        .map_err(|e| Error::Decode(format!("png encode: {e}")))?;
    Ok(bytes.into_inner())
}

fn put_pixel_checked(image: &mut RgbaImage, x: i32, y: i32, color: Rgba<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

/// Bresenham line; points outside the raster are clipped per pixel.
fn draw_line(image: &mut RgbaImage, from: (i32, i32), to: (i32, i32), color: Rgba<u8>) {
    let (mut x, mut y) = from;
    let dx = (to.0 - x).abs();
    let dy = -(to.1 - y).abs();
    let sx = if x < to.0 { 1 } else { -1 };
    let sy = if y < to.1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        put_pixel_checked(image, x, y, color);
        if (x, y) == to {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

/// Filled disc with a one-pixel contrasting rim.
fn draw_robot(image: &mut RgbaImage, center: (i32, i32)) {
    let r2 = ROBOT_RADIUS * ROBOT_RADIUS;
    for dy in -ROBOT_RADIUS..=ROBOT_RADIUS {
        for dx in -ROBOT_RADIUS..=ROBOT_RADIUS {
            let d2 = dx * dx + dy * dy;
            if d2 > r2 {
                continue;
            }
            let color = if d2 > (ROBOT_RADIUS - 1) * (ROBOT_RADIUS - 1) {
                ROBOT_OUTLINE
            } else {
                ROBOT_FILL
            };
            put_pixel_checked(image, center.0 + dx, center.1 + dy, color);
        }
    }
}

fn fill_rect(image: &mut RgbaImage, from: (i32, i32), to: (i32, i32), color: Rgba<u8>) {
    for y in from.1..=to.1 {
        for x in from.0..=to.0 {
            put_pixel_checked(image, x, y, color);
        }
    }
}

/// Cached render state for one device
///
/// Holds the last decoded raster, the last encoded PNG and the two dirty
/// flags that let a poll skip the decode and draw work entirely.
#[derive(Debug, Default)]
pub struct RenderCache {
    decoded: Option<RgbaImage>,
    png: Option<Vec<u8>>,
    placeholder: Option<Vec<u8>>,
    raster_dirty: bool,
    overlay_dirty: bool,
}

impl RenderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new raster arrived: decode and redraw on the next render.
    pub fn mark_raster_dirty(&mut self) {
        self.raster_dirty = true;
    }

    /// Path or robot position changed: redraw on the next render.
    pub fn mark_overlay_dirty(&mut self) {
        self.overlay_dirty = true;
    }

    /// The cached placeholder, encoded at most once.
    pub fn placeholder(&mut self) -> Result<Vec<u8>> {
        if let Some(bytes) = &self.placeholder {
            return Ok(bytes.clone());
        }
        let bytes = placeholder_image()?;
        self.placeholder = Some(bytes.clone());
        Ok(bytes)
    }

    /// Render the map, reusing cached work where the dirty flags allow.
    pub fn image(
        &mut self,
        raster: Option<&MapRaster>,
        path: &[[f64; 2]],
        robot: Option<[f64; 2]>,
    ) -> Result<Vec<u8>> {
        let Some(raster) = raster else {
            return self.placeholder();
        };

        if !self.raster_dirty && !self.overlay_dirty {
            if let Some(bytes) = &self.png {
                return Ok(bytes.clone());
            }
        }

        if self.raster_dirty || self.decoded.is_none() {
            self.decoded = Some(decode_raster(raster)?);
        }
        let Some(base) = self.decoded.as_ref() else {
            return Err(Error::Decode("raster cache empty after decode".to_string()));
        };

        let bytes = render_overlay(base, raster, path, robot)?;
        self.png = Some(bytes.clone());
        self.raster_dirty = false;
        self.overlay_dirty = false;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// LZ4 block that stores `data` as one literal run.
    fn lz4_literal_block(data: &[u8]) -> Vec<u8> {
        assert!(data.len() >= 15, "use a plain token for short runs");
        let mut block = vec![0xF0];
        let mut rest = data.len() - 15;
        while rest >= 255 {
            block.push(0xFF);
            rest -= 255;
        }
        block.push(rest as u8);
        block.extend_from_slice(data);
        block
    }

    fn raster_fixture(gray: &[u8], width: u32, height: u32) -> MapRaster {
        MapRaster {
            map: BASE64.encode(lz4_literal_block(gray)),
            width,
            height,
            x_min: -2.0,
            y_min: -1.0,
            resolution: 0.05,
            path_id: Some(1),
        }
    }

    #[test]
    fn test_device_to_pixel() {
        assert_eq!(device_to_pixel([0.0, 0.0], -2.0, -1.0, 0.05), (40, 20));
        assert_eq!(device_to_pixel([-2000.0, -1000.0], -2.0, -1.0, 0.05), (0, 0));
        // Rounds to nearest pixel
        assert_eq!(device_to_pixel([26.0, -26.0], 0.0, 0.0, 0.05), (1, -1));
    }

    #[test]
    fn test_palette_and_flip_through_pipeline() {
        // 4x4 raster whose first row exercises palette, transparency and
        // the gray fallback: 0, 127, 200, 9
        let raster = raster_fixture(&[0, 127, 200, 9, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], 4, 4);
        let decoded = decode_raster(&raster).unwrap();
        assert_eq!(decoded.dimensions(), (4, 4));
        assert_eq!(*decoded.get_pixel(0, 0), Rgba([15, 60, 152, 255]));
        assert_eq!(*decoded.get_pixel(1, 0), Rgba([0, 0, 0, 0]));
        // Unlisted value replicates to gray
        assert_eq!(*decoded.get_pixel(2, 0), Rgba([200, 200, 200, 255]));
        assert_eq!(*decoded.get_pixel(3, 0), Rgba([40, 5, 153, 255]));

        // After the vertical flip the first raster row is the bottom image row
        let png = render_overlay(&decoded, &raster, &[], None).unwrap();
        let rendered = image::load_from_memory(&png).unwrap().to_rgba8();
        assert_eq!(rendered.dimensions(), (4, 4));
        assert_eq!(*rendered.get_pixel(0, 3), Rgba([15, 60, 152, 255]));
        assert_eq!(*rendered.get_pixel(1, 3), Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn test_space_normalization_in_base64() {
        let gray = [5u8; 16];
        let mut raster = raster_fixture(&gray, 4, 4);
        raster.map = raster.map.replace('+', " ");
        let decoded = decode_raster(&raster).unwrap();
        assert_eq!(*decoded.get_pixel(0, 0), Rgba([153, 40, 5, 255]));
    }

    #[test]
    fn test_placeholder_idempotent() {
        let mut cache = RenderCache::new();
        let first = cache.image(None, &[], None).unwrap();
        let second = cache.image(None, &[], None).unwrap();
        assert!(!first.is_empty());
        assert_eq!(first, second);

        let expected = image::load_from_memory(&first).unwrap().to_rgba8();
        assert_eq!(expected.dimensions(), PLACEHOLDER_SIZE);
    }

    #[test]
    fn test_clean_flags_serve_cached_bytes() {
        let raster = raster_fixture(&[127u8; 16], 4, 4);
        let mut cache = RenderCache::new();
        cache.mark_raster_dirty();

        let first = cache.image(Some(&raster), &[], Some([0.0, 0.0])).unwrap();
        let second = cache.image(Some(&raster), &[], Some([0.0, 0.0])).unwrap();
        assert_eq!(first, second);

        // A dirty overlay forces a fresh render of the same bytes
        cache.mark_overlay_dirty();
        let third = cache.image(Some(&raster), &[], Some([0.0, 0.0])).unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn test_robot_marker_drawn() {
        // Uniform unexplored raster with the robot in the middle; origin at
        // zero so device (100mm, 100mm) lands on pixel (2, 2) pre-flip.
        let raster = MapRaster {
            map: BASE64.encode(lz4_literal_block(&[127u8; 25])),
            width: 5,
            height: 5,
            x_min: 0.0,
            y_min: 0.0,
            resolution: 0.05,
            path_id: None,
        };
        let decoded = decode_raster(&raster).unwrap();
        let png = render_overlay(&decoded, &raster, &[], Some([100.0, 100.0])).unwrap();
        let rendered = image::load_from_memory(&png).unwrap().to_rgba8();
        // Disc center is opaque fill, flipped to row 2 of a 5-row image
        assert_eq!(*rendered.get_pixel(2, 2), ROBOT_FILL);
    }

    #[test]
    fn test_path_polyline_drawn() {
        let raster = MapRaster {
            map: BASE64.encode(lz4_literal_block(&[0u8; 25])),
            width: 5,
            height: 5,
            x_min: 0.0,
            y_min: 0.0,
            resolution: 0.05,
            path_id: None,
        };
        let decoded = decode_raster(&raster).unwrap();
        let path = [[0.0, 0.0], [200.0, 0.0]];
        let png = render_overlay(&decoded, &raster, &path, None).unwrap();
        let rendered = image::load_from_memory(&png).unwrap().to_rgba8();
        // Device row y=0 flips to image row 4
        for x in 0..=4 {
            assert_eq!(*rendered.get_pixel(x, 4), PATH_COLOR);
        }
    }

    #[test]
    fn test_bad_payload_is_decode_error() {
        let mut raster = raster_fixture(&[0u8; 16], 4, 4);
        raster.map = "!!!not-base64!!!".to_string();
        assert!(matches!(decode_raster(&raster), Err(Error::Decode(_))));

        // Declared dimensions disagree with the compressed payload
        let short = raster_fixture(&[0u8; 16], 5, 5);
        assert!(matches!(decode_raster(&short), Err(Error::Decode(_))));
    }
}
