use std::path::{Path, PathBuf};

use clap::Parser;

use crate::converter::ConverterOptions;

#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Root directory of the CDB store (the directory that contains Tiles).
    #[arg(short, long, value_parser = existing_canonical_path)]
    pub input: PathBuf,
    /// Directory for the output.
    #[arg(short, long)]
    pub output: PathBuf,
    /// Generate per-vertex normals for the elevation meshes.
    #[arg(long)]
    pub elevation_normal: bool,
    /// Convert only the elevation LOD chain, skipping full resolution
    /// leaves.
    #[arg(long)]
    pub elevation_lod: bool,
    /// Emit 3D Tiles Next implicit tiling: subtree availability files
    /// instead of explicit per-dataset tile trees.
    #[arg(long = "3d-tiles-next")]
    pub three_d_tiles_next: bool,
    /// Number of levels per subtree when --3d-tiles-next is set.
    #[arg(long, default_value = "7", value_parser = subtree_levels_in_range)]
    pub subtree_levels: u32,
    /// Fraction of elevation indices below which the mesh switches to the
    /// simplified index path.
    #[arg(long, default_value = "0.3")]
    pub elevation_threshold_indices: f32,
    /// Maximum error in metres allowed when decimating elevation meshes.
    #[arg(long, default_value = "0.01")]
    pub elevation_decimate_error: f32,
    /// Comma separated datasets to combine into one tileset, each entry
    /// formatted as {DatasetName}_{ComponentSelector1}_{ComponentSelector2},
    /// e.g. 'Elevation_1_1,GSModels_1_1'. Can be repeated.
    #[arg(long = "combine", value_name = "DATASETS")]
    pub combine: Vec<String>,
}

impl Cli {
    pub fn converter_options(&self) -> ConverterOptions {
        ConverterOptions {
            elevation_normal: self.elevation_normal,
            elevation_lod: self.elevation_lod,
            three_d_tiles_next: self.three_d_tiles_next,
            subtree_levels: self.subtree_levels,
            elevation_threshold_indices: self.elevation_threshold_indices,
            elevation_decimate_error: self.elevation_decimate_error,
        }
    }

    /// The requested dataset combinations, one list per --combine flag.
    pub fn combinations(&self) -> Vec<Vec<String>> {
        self.combine
            .iter()
            .map(|combination| {
                combination
                    .split(',')
                    .map(|spec| spec.trim().to_string())
                    .filter(|spec| !spec.is_empty())
                    .collect()
            })
            .collect()
    }
}

fn existing_canonical_path(s: &str) -> Result<PathBuf, String> {
    if let Ok(c) = Path::new(s).canonicalize() {
        if c.exists() {
            Ok(c)
        } else {
            Err(format!("path {:?} does not exist", &c))
        }
    } else {
        Err(format!("could not resolve the path {:?}", s))
    }
}

fn subtree_levels_in_range(s: &str) -> Result<u32, String> {
    let levels: u32 = s
        .parse()
        .map_err(|_| format!("{:?} is not a number of subtree levels", s))?;
    if levels < 1 {
        return Err(String::from("subtree levels must be at least 1"));
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::Cli;
    use clap::{CommandFactory, Parser};

    fn required_args() -> Vec<&'static str> {
        vec![
            "cdbtiler",
            "-i",
            env!("CARGO_MANIFEST_DIR"),
            "-o",
            "out",
        ]
    }

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert()
    }

    #[test]
    fn verify_defaults() {
        let cli = Cli::try_parse_from(required_args()).unwrap();
        let options = cli.converter_options();
        assert!(!options.three_d_tiles_next);
        assert_eq!(options.subtree_levels, 7);
    }

    #[test]
    fn verify_subtree_levels_range() {
        let mut args = required_args();
        args.extend(["--3d-tiles-next", "--subtree-levels", "4"]);
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(cli.three_d_tiles_next);
        assert_eq!(cli.subtree_levels, 4);

        let mut args = required_args();
        args.extend(["--subtree-levels", "0"]);
        assert!(Cli::try_parse_from(args).is_err());
    }

    /// Can we pass multiple combinations, each with several datasets?
    #[test]
    fn verify_combine() {
        let mut args = required_args();
        args.extend([
            "--combine",
            "Elevation_1_1,GSModels_1_1",
            "--combine",
            "RoadNetwork_2_3",
        ]);
        let cli = Cli::try_parse_from(args).unwrap();
        let combinations = cli.combinations();
        assert_eq!(
            combinations,
            vec![
                vec!["Elevation_1_1".to_string(), "GSModels_1_1".to_string()],
                vec!["RoadNetwork_2_3".to_string()],
            ]
        );
    }
}
