//! Debug exports: grayscale PNG renders of generated height grids and
//! JSON dumps of the inferred refinement plan.

use std::error::Error;
use std::fs::File;
use std::io::{BufWriter, Write};

use image::{GrayImage, ImageBuffer, Luma};

use crate::heightfield::HeightGrid;
use crate::mapgen::PlanReport;

/// Render a height grid to a grayscale image, darkest at the lowest
/// recorded ground level.
pub fn render_height_image(grid: &HeightGrid) -> GrayImage {
    let (min_h, max_h) = grid.range();
    let range = (max_h - min_h).max(f32::EPSILON);

    let mut img: GrayImage = ImageBuffer::new(grid.width() as u32, grid.height() as u32);
    for (px, pz, pixel) in img.enumerate_pixels_mut() {
        let h = grid.get(grid.min.0 + px as i32, grid.min.1 + pz as i32);
        let shade = ((h - min_h) / range * 255.0).round() as u8;
        *pixel = Luma([shade]);
    }
    img
}

/// Write a height grid as a PNG file.
pub fn export_height_png(grid: &HeightGrid, filename: &str) -> Result<(), Box<dyn Error>> {
    render_height_image(grid).save(filename)?;
    Ok(())
}

/// Write the inferred refinement plan as pretty-printed JSON.
pub fn export_plan_json(plan: &PlanReport, filename: &str) -> Result<(), Box<dyn Error>> {
    let file = File::create(filename)?;
    let mut w = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut w, plan)?;
    writeln!(w)?;
    Ok(())
}
