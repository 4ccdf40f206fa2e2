use clap::Parser;

use voxel_mapgen::export;
use voxel_mapgen::heightfield::Heightfield;
use voxel_mapgen::mapgen::MapgenParams;

#[derive(Parser, Debug)]
#[command(name = "voxel_mapgen")]
#[command(about = "Generate deterministic voxel terrain heightfields by recursive refinement")]
struct Args {
    /// Width of the generated region in columns
    #[arg(short = 'W', long, default_value = "256")]
    width: i32,

    /// Depth (Z extent) of the generated region in columns
    #[arg(short = 'D', long, default_value = "256")]
    depth: i32,

    /// World X coordinate of the region's lower corner
    #[arg(long, default_value = "0")]
    x: i32,

    /// World Z coordinate of the region's lower corner
    #[arg(long, default_value = "0")]
    z: i32,

    /// Random seed (uses random seed if not specified)
    #[arg(short, long)]
    seed: Option<u64>,

    /// Coarsening depth of the refinement hierarchy
    #[arg(long, default_value = "8")]
    root_level: u32,

    /// Export the generated heightfield to PNG (specify output path)
    #[arg(long)]
    export_png: Option<String>,

    /// Export the inferred refinement plan to JSON (specify output path)
    #[arg(long)]
    export_plan: Option<String>,
}

fn main() {
    let args = Args::parse();

    let seed = args.seed.unwrap_or_else(|| rand::random());

    println!("Generating heightfield with seed: {}", seed);
    println!(
        "Region: {}x{} columns at ({}, {})",
        args.width, args.depth, args.x, args.z
    );

    let params = MapgenParams {
        root_level: args.root_level,
        grid_origin: (0, 0),
    };
    let mut field = Heightfield::new(seed, params);
    println!(
        "Refinement hierarchy: {} levels, fragment size {} columns",
        args.root_level,
        field.frag_size()
    );

    let min = (args.x, args.z);
    let max = (args.x + args.width - 1, args.z + args.depth - 1);
    let grid = field.generate_region(min, max);

    let (min_h, max_h) = grid.range();
    println!("Ground level range: {:.2} to {:.2}", min_h, max_h);
    println!("Cache: {}", field.stats().summary());
    println!(
        "Spawn level at ({}, {}): {}",
        args.x,
        args.z,
        field.spawn_level_at(args.x, args.z)
    );

    if let Some(path) = &args.export_png {
        println!("Exporting heightfield to {}...", path);
        if let Err(e) = export::export_height_png(&grid, path) {
            eprintln!("Failed to export PNG: {}", e);
        }
    }

    if let Some(path) = &args.export_plan {
        println!("Exporting refinement plan to {}...", path);
        if let Err(e) = export::export_plan_json(&field.plan_report(), path) {
            eprintln!("Failed to export plan: {}", e);
        }
    }
}
