mod input;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use input::{InputInfo, InputKind};
use xgdkit_iso::cancel::CancelToken;
use xgdkit_iso::exe::MediaPatch;
use xgdkit_iso::extract::Extractor;
use xgdkit_iso::read::ImageReader;
use xgdkit_iso::title::TitleHelper;
use xgdkit_iso::write::cci::CciWriter;
use xgdkit_iso::write::cso::CsoWriter;
use xgdkit_iso::write::god::GodWriter;
use xgdkit_iso::write::xiso::XisoWriter;
use xgdkit_iso::ScrubType;

#[derive(Debug, Clone, Parser)]
#[command(name = "xgdkit", version, about = "Convert Xbox and Xbox 360 disc images")]
struct Args {
    /// Image file, split pair member, game directory, or batch directory
    input_path: PathBuf,

    /// Where outputs are created (defaults next to the input)
    output_directory: Option<PathBuf>,

    #[command(flatten)]
    format: FormatArgs,

    /// Zero non-data sectors and trim the image tail
    #[arg(long)]
    partial_scrub: bool,

    /// Reauthor the image completely for the smallest output
    #[arg(long)]
    full_scrub: bool,

    /// Split the resulting XISO for OG Xbox file-size limits
    #[arg(long)]
    split: bool,

    /// Patch the allowed-media field of extracted XBE files
    #[arg(long)]
    am_patch: bool,

    /// Rename extracted XBE titles from a title database
    #[arg(long)]
    rename: bool,

    /// Disable online title lookups
    #[arg(long)]
    offline: bool,

    /// Enable trace logging
    #[arg(long)]
    debug: bool,

    /// Log errors only
    #[arg(long)]
    quiet: bool,
}

#[derive(Debug, Clone, clap::Args)]
#[group(required = true, multiple = false)]
struct FormatArgs {
    /// Extract all files to a directory
    #[arg(long)]
    extract: bool,
    /// Create an XISO image
    #[arg(long)]
    xiso: bool,
    /// Create a Games on Demand container
    #[arg(long)]
    god: bool,
    /// Create a CCI archive
    #[arg(long)]
    cci: bool,
    /// Create a CSO archive
    #[arg(long)]
    cso: bool,
    /// Settings for OG Xbox (extract + rename)
    #[arg(long)]
    ogxbox: bool,
    /// Settings for Xbox 360 (GoD + full scrub)
    #[arg(long)]
    xbox360: bool,
    /// Settings for Xemu (XISO + full scrub, unwrapped output)
    #[arg(long)]
    xemu: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutFormat {
    Extract,
    Xiso,
    God,
    Cci,
    Cso,
}

#[derive(Debug, Clone)]
struct Settings {
    format: OutFormat,
    scrub: ScrubType,
    split: bool,
    am_patch: bool,
    rename: bool,
    /// Place the image directly in the output directory, no game folder.
    unwrapped: bool,
}

impl Settings {
    fn from_args(args: &Args) -> Self {
        let mut scrub = ScrubType::None;
        if args.partial_scrub {
            scrub = ScrubType::Partial;
        }
        if args.full_scrub {
            scrub = ScrubType::Full;
        }
        let mut settings = Self {
            format: OutFormat::Xiso,
            scrub,
            split: args.split,
            am_patch: args.am_patch,
            rename: args.rename,
            unwrapped: false,
        };
        let format = &args.format;
        if format.extract {
            settings.format = OutFormat::Extract;
        } else if format.xiso {
            settings.format = OutFormat::Xiso;
        } else if format.god {
            settings.format = OutFormat::God;
        } else if format.cci {
            settings.format = OutFormat::Cci;
        } else if format.cso {
            settings.format = OutFormat::Cso;
        } else if format.ogxbox {
            settings.format = OutFormat::Extract;
            settings.rename = true;
        } else if format.xbox360 {
            settings.format = OutFormat::God;
            settings.scrub = ScrubType::Full;
        } else if format.xemu {
            settings.format = OutFormat::Xiso;
            settings.scrub = ScrubType::Full;
            settings.split = false;
            settings.unwrapped = true;
        }
        settings
    }
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let level = if args.debug {
        tracing::Level::TRACE
    } else if args.quiet {
        tracing::Level::ERROR
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    match run(&args) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let settings = Settings::from_args(args);
    if args.offline {
        tracing::debug!("online lookups disabled");
    }
    if settings.rename {
        tracing::debug!("no title provider is configured; --rename has no effect");
    }

    let input_path = std::path::absolute(&args.input_path)
        .with_context(|| format!("resolving {}", args.input_path.display()))?;
    let output_directory = match &args.output_directory {
        Some(dir) => dir.clone(),
        None => input_path
            .parent()
            .unwrap_or(Path::new("."))
            .join("xgdkit_output"),
    };

    let inputs = input::gather_inputs(&input_path)?;
    let token = CancelToken::new();
    let mut failed: Vec<PathBuf> = Vec::new();

    for info in &inputs {
        let shown = info.paths.first().expect("input has a path");
        tracing::info!(input = %shown.display(), "processing");
        match process_input(info, &output_directory, &settings, &token) {
            Ok(outputs) => {
                for path in outputs {
                    tracing::info!(output = %path.display(), "created");
                }
            }
            Err(err) => {
                tracing::error!(input = %shown.display(), "{err:#}");
                failed.push(shown.clone());
            }
        }
    }

    if !failed.is_empty() {
        for path in &failed {
            tracing::error!(input = %path.display(), "failed");
        }
        anyhow::bail!("{} of {} inputs failed", failed.len(), inputs.len());
    }
    tracing::info!("finished processing inputs");
    Ok(())
}

fn process_input(
    info: &InputInfo,
    output_directory: &Path,
    settings: &Settings,
    token: &CancelToken,
) -> Result<Vec<PathBuf>> {
    match info.kind {
        InputKind::ExtractedDir => convert_from_dir(&info.paths[0], output_directory, settings, token),
        _ => {
            let mut reader = open_reader(info)?;
            convert_from_reader(&mut reader, output_directory, settings, token)
        }
    }
}

fn open_reader(info: &InputInfo) -> Result<ImageReader> {
    let reader = match info.kind {
        InputKind::Iso => ImageReader::open_xiso(&info.paths)?,
        InputKind::Cci => ImageReader::open_cci(&info.paths)?,
        InputKind::Cso => ImageReader::open_cso(&info.paths)?,
        InputKind::God => ImageReader::open_god(&info.paths[0])?,
        InputKind::ExtractedDir => unreachable!("directories do not get a reader"),
    };
    Ok(reader)
}

fn convert_from_reader(
    reader: &mut ImageReader,
    output_directory: &Path,
    settings: &Settings,
    token: &CancelToken,
) -> Result<Vec<PathBuf>> {
    let title = TitleHelper::from_reader(reader, None)?;
    match settings.format {
        OutFormat::Extract => {
            let out_dir = output_directory.join(title.folder_name());
            let mut extractor = Extractor::new(reader);
            if settings.am_patch {
                extractor = extractor.with_media_patch(MediaPatch::Extend);
            }
            extractor.extract(&out_dir, token)?;
            Ok(vec![out_dir])
        }
        OutFormat::Xiso => {
            let out_path = image_out_path(output_directory, &title, settings, "iso");
            let writer = XisoWriter::from_reader(reader, settings.scrub, settings.split);
            Ok(writer.convert(&out_path, token)?)
        }
        OutFormat::Cci => {
            let out_path = image_out_path(output_directory, &title, settings, "cci");
            Ok(CciWriter::from_reader(reader, settings.scrub).convert(&out_path, token)?)
        }
        OutFormat::Cso => {
            let out_path = image_out_path(output_directory, &title, settings, "cso");
            Ok(CsoWriter::from_reader(reader, settings.scrub).convert(&out_path, token)?)
        }
        OutFormat::God => {
            let out_dir = output_directory.join(title.god_folder_name());
            Ok(GodWriter::from_reader(reader, &title, settings.scrub).convert(&out_dir, token)?)
        }
    }
}

fn convert_from_dir(
    game_dir: &Path,
    output_directory: &Path,
    settings: &Settings,
    token: &CancelToken,
) -> Result<Vec<PathBuf>> {
    let title = TitleHelper::from_dir(game_dir, None)?;
    match settings.format {
        OutFormat::Extract => {
            anyhow::bail!("input {} is already a directory", game_dir.display())
        }
        OutFormat::Xiso => {
            let out_path = image_out_path(output_directory, &title, settings, "iso");
            Ok(XisoWriter::from_dir(game_dir, settings.split).convert(&out_path, token)?)
        }
        OutFormat::Cci => {
            let out_path = image_out_path(output_directory, &title, settings, "cci");
            Ok(CciWriter::from_dir(game_dir).convert(&out_path, token)?)
        }
        OutFormat::Cso => {
            let out_path = image_out_path(output_directory, &title, settings, "cso");
            Ok(CsoWriter::from_dir(game_dir).convert(&out_path, token)?)
        }
        OutFormat::God => {
            let out_dir = output_directory.join(title.god_folder_name());
            Ok(GodWriter::from_dir(game_dir, &title).convert(&out_dir, token)?)
        }
    }
}

/// `<out>/<folder>/<name>.<ext>`, or `<out>/<name>.<ext>` for unwrapped
/// profiles.
fn image_out_path(
    output_directory: &Path,
    title: &TitleHelper,
    settings: &Settings,
    extension: &str,
) -> PathBuf {
    let file_name = format!("{}.{}", title.iso_name(), extension);
    if settings.unwrapped {
        output_directory.join(file_name)
    } else {
        output_directory.join(title.folder_name()).join(file_name)
    }
}
