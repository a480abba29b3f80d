// Image I/O at the edge of the engine: decoding files into normalized intensity
// grids, listing the images of a directory, and writing grids back out as PNGs
// for debugging.

use crate::config::ImageConfig;
use crate::core_modules::grid::{Grid, IntensityGrid};
use crate::error::Result;
use image::imageops::FilterType;
use image::{DynamicImage, ImageEncoder};
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "gif", "tif"];

/// Decodes an image file into a grayscale grid of the configured size.
pub fn load_intensity_grid<P: AsRef<Path>>(path: P, config: &ImageConfig) -> Result<IntensityGrid> {
    let img = image::open(path)?;
    grid_from_image(&img, config)
}

/// Converts to 8-bit luma, resizes to the fixed width (keeping the aspect ratio
/// unless a height is configured) and normalizes to [0, 1] with two decimals.
pub fn grid_from_image(img: &DynamicImage, config: &ImageConfig) -> Result<IntensityGrid> {
    let luma = img.to_luma8();
    let (width, height) = luma.dimensions();
    let target_width = config.width;
    let target_height = config.height.unwrap_or_else(|| {
        let scaled = (height as f64 * target_width as f64 / width.max(1) as f64).round();
        (scaled as u32).max(1)
    });

    let luma = if (width, height) != (target_width, target_height) {
        image::imageops::resize(&luma, target_width, target_height, FilterType::Triangle)
    } else {
        luma
    };

    let data = luma
        .pixels()
        .map(|pixel| (pixel[0] as f64 / 255.0 * 100.0).round() / 100.0)
        .collect();
    Grid::new(target_width as usize, target_height as usize, data)
}

/// Image files directly inside `dir`, sorted by path.
pub fn list_images<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if path.is_file() && is_image {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Writes a grid as an 8-bit grayscale PNG, min-max scaled to the full range.
pub fn save_grid_png<P: AsRef<Path>>(grid: &Grid, path: P) -> Result<()> {
    let min = grid.values().iter().cloned().fold(f64::INFINITY, f64::min);
    let max = grid.values().iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    let buffer: Vec<u8> = grid
        .values()
        .iter()
        .map(|&v| {
            if range > 0.0 {
                ((v - min) / range * 255.0).round() as u8
            } else {
                0
            }
        })
        .collect();

    let output = std::fs::File::create(path)?;
    let encoder = image::codecs::png::PngEncoder::new(output);
    encoder.write_image(
        &buffer,
        grid.width() as u32,
        grid.height() as u32,
        image::ExtendedColorType::L8,
    )?;
    Ok(())
}
