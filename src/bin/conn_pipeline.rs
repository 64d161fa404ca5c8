use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use conn_pipeline::bids::BidsMetadataReader;
use conn_pipeline::config::{ConfigLoader, DEFAULT_FWHM};
use conn_pipeline::error::ConnError;
use conn_pipeline::output::{ConsoleOutput, JsonOutput, OutputMode, ProgressEvent, ProgressSink};
use conn_pipeline::paths;
use conn_pipeline::pipeline::{Pipeline, PipelineOptions, PipelineReport, SkipFlags};
use conn_pipeline::runner::{StageExecution, StageExecutor, Toolbox};
use conn_pipeline::validate::{self, CHECK_TIMEOUT, DerivativeValidator};
use conn_pipeline::{export_light, reorganize_data, run_mapping};

const DEFAULT_INSTALL_DIR: &str = "conn_standalone";
const TEMPLATE_SUBDIR: &str = "scripts/conn";

const HEADER: [&str; 4] = [
    "╔════════════════════════════════════════════════════════════════╗",
    "║           CONN Modular Processing Pipeline                     ║",
    "║  Project Setup → Import → Smooth → Denoise                     ║",
    "╚════════════════════════════════════════════════════════════════╝",
];

const COMPLETED: [&str; 3] = [
    "╔════════════════════════════════════════════════════════════════╗",
    "║                  PIPELINE COMPLETED SUCCESSFULLY                ║",
    "╚════════════════════════════════════════════════════════════════╝",
];

#[derive(Parser)]
#[command(name = "conn-pipeline")]
#[command(about = "CONN functional-connectivity pipeline driver for fMRIPrep/BIDS datasets")]
#[command(version)]
struct Cli {
    #[arg(long, global = true, help = "Print results as JSON instead of progress lines")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the Setup → Import → Smooth → Denoise batch pipeline")]
    Run(RunArgs),
    #[command(about = "Summarize a BIDS dataset")]
    Metadata(MetadataArgs),
    #[command(about = "Add CONN subject ids to participants.tsv")]
    MapIds(MapIdsArgs),
    #[command(about = "Normalize the session layout of fMRIPrep derivatives")]
    Reorganize(DirArgs),
    #[command(about = "Copy a CONN project without its per-subject volumes")]
    Export(ExportArgs),
    #[command(about = "Check fMRIPrep derivative volumes for gzip corruption")]
    Validate(DirArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(short = 'p', long, help = "Directory where the CONN project is created/saved")]
    project_dir: Utf8PathBuf,

    #[arg(short = 'f', long, help = "Root directory of the fMRIPrep derivatives")]
    fmriprep_dir: Utf8PathBuf,

    #[arg(short = 'b', long, help = "Root directory of the BIDS dataset")]
    bids_dir: Utf8PathBuf,

    #[arg(short = 'i', long, help = "CONN installation directory [default: ~/conn_standalone]")]
    install_dir: Option<Utf8PathBuf>,

    #[arg(long, default_value_t = DEFAULT_FWHM, help = "Smoothing kernel size in mm")]
    fwhm: u32,

    #[arg(long, help = "Pipeline configuration JSON file")]
    config: Option<Utf8PathBuf>,

    #[arg(long, help = "Do not generate QA plots")]
    no_qa: bool,

    #[arg(
        long,
        help = "Directory holding the batch script templates [default: scripts/conn next to the executable]"
    )]
    template_dir: Option<Utf8PathBuf>,

    #[arg(long, help = "Skip step 1 (project already exists)")]
    skip_setup: bool,

    #[arg(long, help = "Skip step 2 (data already imported)")]
    skip_import: bool,

    #[arg(long, help = "Skip step 3 (no smoothing)")]
    skip_smooth: bool,

    #[arg(long, help = "Skip step 4 (no denoising)")]
    skip_denoise: bool,
}

#[derive(Args)]
struct MetadataArgs {
    bids_dir: Utf8PathBuf,
}

#[derive(Args)]
struct MapIdsArgs {
    #[arg(long, help = "CONN project file (conn_<name>.mat)")]
    conn: Utf8PathBuf,

    #[arg(long, help = "BIDS root holding participants.tsv")]
    bids: Utf8PathBuf,
}

#[derive(Args)]
struct DirArgs {
    dir: Utf8PathBuf,
}

#[derive(Args)]
struct ExportArgs {
    project: Utf8PathBuf,
    dest: Utf8PathBuf,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<ConnError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ConnError) -> u8 {
    match error {
        ConnError::Interrupted => 130,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Console
    };
    let console = ConsoleOutput::new();
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Console => &console,
        OutputMode::Json => &JsonOutput,
    };

    match cli.command {
        Commands::Run(args) => run_pipeline(args, output_mode, &console, sink),
        Commands::Metadata(args) => run_metadata(args, output_mode),
        Commands::MapIds(args) => {
            let outcome = run_mapping(&args.conn, &args.bids, sink)?;
            print_json(output_mode, &outcome)
        }
        Commands::Reorganize(args) => {
            let report = reorganize_data(&args.dir, sink)?;
            sink.event(ProgressEvent::info(format!(
                "{} subject(s) standardized, {} file(s) moved, {} file(s) rewritten",
                report.subjects_standardized,
                report.files_moved(),
                report.files_rewritten
            )));
            print_json(output_mode, &report)
        }
        Commands::Export(args) => {
            let report = export_light(&args.project, &args.dest, sink)?;
            print_json(output_mode, &report)
        }
        Commands::Validate(args) => {
            let root = paths::normalize(&args.dir)?;
            let validator = DerivativeValidator::new(validate::system_check(CHECK_TIMEOUT));
            let report = validator.validate(&root, sink)?;
            print_json(output_mode, &report)?;
            if report.is_ok() {
                Ok(())
            } else {
                Err(ConnError::ValidationFailed {
                    count: report.failures.len(),
                }
                .into())
            }
        }
    }
}

fn run_pipeline(
    args: RunArgs,
    output_mode: OutputMode,
    console: &ConsoleOutput,
    sink: &dyn ProgressSink,
) -> miette::Result<()> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)).into_diagnostic()?;

    if output_mode == OutputMode::Console {
        console.banner(&HEADER);
    }

    let config = ConfigLoader::resolve(args.config.as_deref())?;
    let install_dir = args
        .install_dir
        .or_else(|| paths::home_dir().map(|home| home.join(DEFAULT_INSTALL_DIR)));
    let template_dir = match args.template_dir {
        Some(dir) => dir,
        None => default_template_dir()?,
    };
    let options = PipelineOptions {
        project_dir: args.project_dir,
        derivatives_dir: args.fmriprep_dir,
        bids_dir: args.bids_dir,
        install_dir,
        template_dir,
        fwhm: config.effective_fwhm(args.fwhm),
        generate_qa: !args.no_qa,
        skip: SkipFlags {
            setup: args.skip_setup,
            import: args.skip_import,
            smooth: args.skip_smooth,
            denoise: args.skip_denoise,
        },
    }
    .normalized()?;

    if output_mode == OutputMode::Console {
        print_configuration(&options);
    }

    let validator = DerivativeValidator::new(validate::system_check(CHECK_TIMEOUT));
    let report = if options.all_skipped() {
        Pipeline::new(options, NopToolbox, validator).run(sink)?
    } else {
        let toolbox = Toolbox::detect(options.install_dir.as_deref())?;
        sink.event(ProgressEvent::success(format!(
            "Using {}: {}",
            toolbox.label(),
            toolbox.program()
        )));
        Pipeline::new(options, toolbox, validator)
            .with_interrupt(interrupted)
            .run(sink)?
    };

    match output_mode {
        OutputMode::Console => print_completion(console, &report),
        OutputMode::Json => JsonOutput::print(&report).into_diagnostic()?,
    }
    Ok(())
}

fn run_metadata(args: MetadataArgs, output_mode: OutputMode) -> miette::Result<()> {
    let root = paths::normalize(&args.bids_dir)?;
    let metadata = BidsMetadataReader::open(&root)?.acquisition_parameters();
    match output_mode {
        OutputMode::Console => println!("{metadata}"),
        OutputMode::Json => JsonOutput::print(&metadata).into_diagnostic()?,
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(output_mode: OutputMode, value: &T) -> miette::Result<()> {
    if output_mode == OutputMode::Json {
        JsonOutput::print(value).into_diagnostic()?;
    }
    Ok(())
}

fn default_template_dir() -> miette::Result<Utf8PathBuf> {
    let exe = std::env::current_exe().into_diagnostic()?;
    let exe = paths::to_utf8(exe)?;
    Ok(exe
        .parent()
        .unwrap_or(Utf8Path::new("."))
        .join(TEMPLATE_SUBDIR))
}

fn print_configuration(options: &PipelineOptions) {
    let install_dir = options
        .install_dir
        .as_ref()
        .map(|dir| dir.to_string())
        .unwrap_or_else(|| "(not set)".to_string());
    println!();
    println!("Configuration:");
    println!("  Project directory:  {}", options.project_dir);
    println!("  fMRIprep directory: {}", options.derivatives_dir);
    println!("  BIDS directory:     {}", options.bids_dir);
    println!("  CONN install dir:   {install_dir}");
    println!("  Template dir:       {}", options.template_dir);
    println!("  Smoothing FWHM:     {} mm", options.fwhm);
    println!("  Generate QA:        {}", options.generate_qa);
    println!("  Log file:           {}", options.log_file());
    println!();
}

fn print_completion(console: &ConsoleOutput, report: &PipelineReport) {
    println!();
    for line in COMPLETED {
        console.event(ProgressEvent::success(line));
    }
    println!();
    println!("Project directory: {}", report.project_dir);
    println!("Log file: {}", report.log_file);
    println!();
}

struct NopToolbox;

impl StageExecutor for NopToolbox {
    fn execute(
        &self,
        _script: &Utf8Path,
        _on_line: &mut dyn FnMut(&str),
        _interrupt: &AtomicBool,
    ) -> Result<StageExecution, ConnError> {
        Err(ConnError::MissingTool)
    }
}
