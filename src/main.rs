use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use dicom_roi_mask::{
    DegeneratePolicy, RasterizeOptions, SortBy, group_studies, mask::MaskError, open_directory,
    volume_loader::VolumeLoaderError,
};
use thiserror::Error;
use tracing::{Level, error, info, warn};

#[derive(Debug, Error)]
enum Error {
    #[error("Invalid source directory: {}", .0.display())]
    InvalidSource(PathBuf),

    #[error("No structure sets found in {}", .0.display())]
    NoStructureSets(PathBuf),

    #[error(transparent)]
    Load(#[from] VolumeLoaderError),

    #[error(transparent)]
    Save(#[from] MaskError),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SliceOrder {
    Position,
    InstanceNumber,
}

impl From<SliceOrder> for SortBy {
    fn from(order: SliceOrder) -> Self {
        match order {
            SliceOrder::Position => SortBy::ImagePositionPatient,
            SliceOrder::InstanceNumber => SortBy::InstanceNumber,
        }
    }
}

#[derive(Parser, Debug)]
#[command(version = env!("CARGO_PKG_VERSION"), about = "Rasterize RTSTRUCT contours into voxel masks", long_about = None)]
struct Args {
    #[arg(help = "Directory containing the .dcm image series and structure sets")]
    source: PathBuf,

    #[arg(help = "Output directory for the NIfTI masks")]
    output: PathBuf,

    #[arg(help = "Value of voxels outside the ROI", long = "background", default_value_t = 0)]
    background: u8,

    #[arg(help = "Value of voxels inside the ROI", long = "mask-value", default_value_t = 255)]
    mask_value: u8,

    #[arg(
        help = "How to order image slices",
        long = "sort-by",
        value_enum,
        default_value_t = SliceOrder::Position
    )]
    sort_by: SliceOrder,

    #[arg(
        help = "Fail an ROI on contours with fewer than 3 distinct points instead of skipping them",
        long = "reject-degenerate",
        default_value_t = false
    )]
    reject_degenerate: bool,

    #[arg(
        help = "Also write every mask as a stack of axial PNG slices",
        long = "png",
        default_value_t = false
    )]
    png: bool,

    #[arg(
        help = "Enable verbose logging",
        long = "verbose",
        short = 'v',
        default_value_t = false
    )]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    if let Err(e) = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(level)
            .finish(),
    ) {
        eprintln!("[ERROR] Could not set up global logging subscriber: {e}");
    }

    run(args).unwrap_or_else(|e| {
        error!("{e}");
        std::process::exit(1);
    });
}

fn run(args: Args) -> Result<(), Error> {
    if !args.source.is_dir() {
        return Err(Error::InvalidSource(args.source));
    }

    let policy = if args.reject_degenerate {
        DegeneratePolicy::Reject
    } else {
        DegeneratePolicy::Skip
    };
    let options = RasterizeOptions::new(args.background, args.mask_value).with_degenerate_policy(policy);

    let objects = open_directory(&args.source)?;
    info!("Number of DICOM files found: {}", objects.len());

    let studies = group_studies(&objects);
    if studies.is_empty() {
        return Err(Error::NoStructureSets(args.source));
    }

    for (index, study) in studies.iter().enumerate() {
        let masks = match study.masks(args.sort_by.into(), &options) {
            Ok(masks) => masks,
            Err(e) => {
                warn!(study = index, "Skipping study: {e}");
                continue;
            }
        };

        let study_dir = args.output.join(format!("study_{index}"));
        for (roi, mask) in masks {
            let name = study.rtstruct().roi_name(roi).unwrap_or("unnamed");
            match mask {
                Ok(mask) => {
                    let path = study_dir.join(format!("roi_{roi}.nii.gz"));
                    mask.save_nifti(&path)?;
                    if args.png {
                        mask.save_slices(study_dir.join(format!("roi_{roi}")))?;
                    }
                    info!(
                        study = index,
                        roi,
                        name,
                        voxels = mask.count(args.mask_value),
                        path = %path.display(),
                        "Saved mask"
                    );
                }
                Err(e) => error!(study = index, roi, name, "Failed to rasterize ROI: {e}"),
            }
        }
    }

    Ok(())
}
