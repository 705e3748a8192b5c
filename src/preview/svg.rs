//! SVG rasterisation for image previews

use std::path::Path;

use super::error::PreviewError;
use super::imaging::RawImage;

/// A rasterised SVG and its intrinsic size.
#[derive(Debug)]
pub struct RasterizedSvg {
    pub image: RawImage,
    pub intrinsic_width: u32,
    pub intrinsic_height: u32,
}

#[must_use]
pub fn is_svg(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("svg"))
}

/// Render the SVG at its intrinsic size, shrunk to fit `max_edge`.
#[cfg(feature = "svg")]
pub fn rasterize(path: &Path, max_edge: u32) -> Result<RasterizedSvg, PreviewError> {
    use resvg::tiny_skia::{Pixmap, Transform};
    use resvg::usvg;

    use super::imaging::fit_within;

    let data = std::fs::read(path).map_err(|e| PreviewError::io(path, e))?;

    let mut options = usvg::Options::default();
    options.resources_dir = path.parent().map(Path::to_path_buf);
    if needs_fonts(&data) {
        options.fontdb_mut().load_system_fonts();
    }
    let tree = usvg::Tree::from_data(&data, &options)
        .map_err(|e| PreviewError::decode(format!("svg: {e}")))?;

    let size = tree.size().to_int_size();
    let (width, height) = (size.width(), size.height());
    let (target_width, target_height) = fit_within(width, height, max_edge);

    let mut pixmap = Pixmap::new(target_width, target_height)
        .ok_or_else(|| PreviewError::decode("svg has an empty canvas"))?;
    let transform = Transform::from_scale(
        target_width as f32 / width as f32,
        target_height as f32 / height as f32,
    );
    let mut pixmap_mut = pixmap.as_mut();
    resvg::render(&tree, transform, &mut pixmap_mut);

    let mut rgba = pixmap.take();
    unpremultiply_rgba(&mut rgba);

    Ok(RasterizedSvg {
        image: RawImage::new(target_width, target_height, rgba)?,
        intrinsic_width: width,
        intrinsic_height: height,
    })
}

#[cfg(not(feature = "svg"))]
pub fn rasterize(path: &Path, _max_edge: u32) -> Result<RasterizedSvg, PreviewError> {
    Err(PreviewError::decode(format!(
        "SVG support disabled; cannot render {path:?}"
    )))
}

#[cfg(feature = "svg")]
fn needs_fonts(data: &[u8]) -> bool {
    let text = String::from_utf8_lossy(data);
    text.contains("<text") || text.contains("font-family")
}

// tiny-skia pixmaps are premultiplied.
#[cfg(feature = "svg")]
fn unpremultiply_rgba(data: &mut [u8]) {
    for pixel in data.chunks_exact_mut(4) {
        let alpha = u32::from(pixel[3]);
        if alpha == 0 {
            pixel[..3].fill(0);
            continue;
        }
        for channel in &mut pixel[..3] {
            *channel = ((u32::from(*channel) * 255 + alpha / 2) / alpha).min(255) as u8;
        }
    }
}

#[cfg(all(test, feature = "svg"))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SQUARE: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="400" height="200">
  <rect x="0" y="0" width="400" height="200" fill="#ff0000"/>
</svg>"##;

    #[test]
    fn renders_at_intrinsic_size_when_small_enough() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logo.svg");
        std::fs::write(&path, SQUARE).unwrap();

        let svg = rasterize(&path, 1000).unwrap();
        assert_eq!((svg.image.width, svg.image.height), (400, 200));
        assert_eq!((svg.intrinsic_width, svg.intrinsic_height), (400, 200));
        assert_eq!(&svg.image.pixels[..4], &[255, 0, 0, 255]);
    }

    #[test]
    fn shrinks_to_max_edge() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logo.svg");
        std::fs::write(&path, SQUARE).unwrap();

        let svg = rasterize(&path, 100).unwrap();
        assert_eq!((svg.image.width, svg.image.height), (100, 50));
        assert_eq!(svg.intrinsic_width, 400);
    }

    #[test]
    fn malformed_svg_is_a_decode_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.svg");
        std::fs::write(&path, "<svg").unwrap();
        assert!(matches!(
            rasterize(&path, 100),
            Err(PreviewError::Decode(_))
        ));
    }

    #[test]
    fn unpremultiply_restores_colour() {
        let mut pixels = [64, 0, 0, 128, 10, 10, 10, 0];
        unpremultiply_rgba(&mut pixels);
        assert_eq!(pixels, [128, 0, 0, 128, 0, 0, 0, 0]);
    }
}
