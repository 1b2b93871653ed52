use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use snafu::prelude::*;
use snafu::Report;
use tracing::error;

use lesion_dataset::acquisition::{self, AcquireOptions, AcquisitionStrategy, CachedPlatform, PlatformClient};
use lesion_dataset::config::{self, DatasetConfig};
use lesion_dataset::convert::{self, ConversionOptions, SeriesOptions};
use lesion_dataset::descriptor::{self, DatasetDescriptor};
use lesion_dataset::matcher::{self, MatchOptions};
use lesion_dataset::utils::init_tracing;

/// Build a CT lesion segmentation training dataset
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// verbose mode
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download resources and their segmentations from the annotation platform
    Acquire(AcquireArgs),
    /// Convert every DICOM series folder to a volume
    Convert(ConvertArgs),
    /// Re-convert selected series folders without the slice increment check
    ConvertRelaxed(ConvertRelaxedArgs),
    /// Match images with masks, lay out the dataset and write dataset.json
    Prepare(MatchArgs),
    /// Match images with masks and lay out the dataset
    Match(MatchArgs),
    /// Write dataset.json for an existing dataset folder
    Descriptor(DescriptorArgs),
}

#[derive(Args, Debug)]
struct AcquireArgs {
    /// project name on the annotation platform
    #[arg(short, long)]
    project: String,
    /// base URL of the platform API
    #[arg(long, env = "ANNOTATION_API_URL")]
    api_url: String,
    /// API key sent with every request
    #[arg(long, env = "ANNOTATION_API_KEY", hide_env_values = true)]
    api_key: String,
    /// how payloads are persisted
    #[arg(long, value_enum, default_value_t = AcquisitionStrategy::Decoded)]
    strategy: AcquisitionStrategy,
    #[arg(long, default_value = config::DEFAULT_RESOURCES_DIR)]
    resources_dir: PathBuf,
    #[arg(long, default_value = config::DEFAULT_IMAGES_DIR)]
    images_dir: PathBuf,
    #[arg(long, default_value = config::DEFAULT_MASKS_DIR)]
    masks_dir: PathBuf,
    /// where fetched payloads are cached
    #[arg(long, default_value = "./.annotation_cache")]
    cache_dir: PathBuf,
    /// always fetch from the platform
    #[arg(long)]
    no_cache: bool,
    /// skip model-generated segmentations
    #[arg(long)]
    no_ai_segmentations: bool,
    /// reverse decoded masks along the slice axis
    #[arg(long)]
    reverse_mask_slices: bool,
}

#[derive(Args, Debug)]
struct SeriesArgs {
    /// folder with one subfolder per DICOM series
    #[arg(long, default_value = config::DEFAULT_RESOURCES_DIR)]
    dicom_root: PathBuf,
    #[arg(short, long, default_value = config::DEFAULT_IMAGES_DIR)]
    output_dir: PathBuf,
    /// keep the acquisition axis order
    #[arg(long)]
    no_reorient: bool,
    /// allowed slice increment deviation in mm
    #[arg(long, default_value_t = 0.2)]
    tolerance: f64,
    /// stop at the first failing series
    #[arg(long)]
    fail_first: bool,
}

impl SeriesArgs {
    fn options(&self, verbose: bool) -> ConversionOptions {
        ConversionOptions {
            series: SeriesOptions {
                reorient: !self.no_reorient,
                validate_slice_increment: true,
                slice_increment_tolerance: self.tolerance,
            },
            fail_first: self.fail_first,
            verbose,
            ..Default::default()
        }
    }
}

#[derive(Args, Debug)]
struct ConvertArgs {
    #[command(flatten)]
    series: SeriesArgs,
}

#[derive(Args, Debug)]
struct ConvertRelaxedArgs {
    #[command(flatten)]
    series: SeriesArgs,
    /// series folder names below the DICOM root
    #[arg(required = true)]
    folders: Vec<String>,
}

#[derive(Args, Debug)]
struct DatasetArgs {
    /// base folder the dataset folder is created in
    #[arg(long, env = "nnUNet_raw")]
    output_base: PathBuf,
    #[arg(long, default_value_t = config::DEFAULT_DATASET_ID)]
    dataset_id: u16,
    #[arg(long, default_value = config::DEFAULT_TASK_NAME)]
    task_name: String,
    #[arg(long, default_value = config::DEFAULT_FILE_ENDING)]
    file_ending: String,
}

impl DatasetArgs {
    fn config(&self) -> DatasetConfig {
        DatasetConfig {
            dataset_id: self.dataset_id,
            task_name: self.task_name.clone(),
            file_ending: self.file_ending.clone(),
            ..Default::default()
        }
    }
}

#[derive(Args, Debug)]
struct MatchArgs {
    #[command(flatten)]
    dataset: DatasetArgs,
    #[arg(long, default_value = config::DEFAULT_IMAGES_DIR)]
    images_dir: PathBuf,
    #[arg(long, default_value = config::DEFAULT_MASKS_DIR)]
    masks_dir: PathBuf,
    /// manifest location, defaults to the current directory
    #[arg(long)]
    manifest: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct DescriptorArgs {
    #[command(flatten)]
    dataset: DatasetArgs,
    /// training case count; counted from labelsTr when omitted
    #[arg(long)]
    num_training: Option<usize>,
}

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("Could not start the async runtime"))]
    Runtime { source: std::io::Error },

    #[snafu(display("Acquisition failed"))]
    Acquire { source: acquisition::Error },

    #[snafu(display("Conversion failed"))]
    Convert { source: convert::Error },

    #[snafu(display("Matching failed"))]
    Match { source: matcher::Error },

    #[snafu(display("Descriptor emission failed"))]
    Descriptor { source: descriptor::Error },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        error!("{}", Report::from_error(e));
        std::process::exit(-2);
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    let verbose = cli.verbose;
    match cli.command {
        Command::Acquire(args) => run_acquire(args, verbose),
        Command::Convert(args) => {
            let options = args.series.options(verbose);
            let report = convert::convert_all(&args.series.dicom_root, &args.series.output_dir, &options)
                .context(ConvertSnafu)?;
            print_conversion(&report);
            Ok(())
        }
        Command::ConvertRelaxed(args) => {
            let options = args.series.options(verbose);
            let report = convert::convert_selected(
                &args.series.dicom_root,
                &args.folders,
                &args.series.output_dir,
                &options,
            )
            .context(ConvertSnafu)?;
            print_conversion(&report);
            Ok(())
        }
        Command::Prepare(args) => run_match(args, verbose, true),
        Command::Match(args) => run_match(args, verbose, false),
        Command::Descriptor(args) => {
            let config = args.dataset.config();
            let layout = config.layout(&args.dataset.output_base);
            let num_training = match args.num_training {
                Some(n) => n,
                None => descriptor::count_training_cases(&layout.labels_tr, &config.file_ending)
                    .context(DescriptorSnafu)?,
            };
            let path = descriptor::generate_dataset_json(&layout.root, &DatasetDescriptor::lesions(&config, num_training))
                .context(DescriptorSnafu)?;
            println!("Wrote {} ({} training cases)", path.display(), num_training);
            Ok(())
        }
    }
}

fn run_acquire(args: AcquireArgs, verbose: bool) -> Result<(), Error> {
    let options = AcquireOptions {
        project_name: args.project,
        strategy: args.strategy,
        resources_dir: args.resources_dir,
        images_dir: args.images_dir,
        masks_dir: args.masks_dir,
        load_ai_segmentations: !args.no_ai_segmentations,
        reverse_mask_slices: args.reverse_mask_slices,
        verbose,
        ..Default::default()
    };
    let client = PlatformClient::new(args.api_url, args.api_key);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context(RuntimeSnafu)?;
    let report = rt
        .block_on(async {
            if args.no_cache {
                acquisition::acquire(&client, &options).await
            } else {
                let cached = CachedPlatform::new(client, args.cache_dir);
                tracing::info!("Caching payloads under {}", cached.cache_dir().display());
                acquisition::acquire(&cached, &options).await
            }
        })
        .context(AcquireSnafu)?;

    println!(
        "Fetched {} resources: {} images, {} masks",
        report.resources,
        report.images.len(),
        report.masks.len()
    );
    Ok(())
}

fn run_match(args: MatchArgs, verbose: bool, with_descriptor: bool) -> Result<(), Error> {
    let config = args.dataset.config();
    let options = MatchOptions {
        config: config.clone(),
        manifest_path: args.manifest,
        verbose,
    };
    let report = matcher::convert_to_dataset(&args.images_dir, &args.masks_dir, &args.dataset.output_base, &options)
        .context(MatchSnafu)?;

    println!("Training cases ({}):", report.num_training());
    for case in &report.train_cases {
        println!("  {}", case);
    }
    println!("Test cases ({}):", report.test_cases.len());
    for case in &report.test_cases {
        println!("  {}", case);
    }
    println!("Manifest: {}", report.manifest_path.display());

    if with_descriptor {
        let root = config.layout(&args.dataset.output_base).root;
        let path = descriptor::generate_dataset_json(&root, &DatasetDescriptor::lesions(&config, report.num_training()))
            .context(DescriptorSnafu)?;
        println!("Descriptor: {}", path.display());
    }
    Ok(())
}

fn print_conversion(report: &convert::ConversionReport) {
    println!("Converted {} series", report.converted.len());
    if !report.failed.is_empty() {
        println!("Failed {} series:", report.failed.len());
        for failed in &report.failed {
            println!("  {}", failed.folder.display());
        }
    }
}
