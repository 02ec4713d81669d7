// src/main.rs - cws-stack command line: inject, compare, check, suite
use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use cws_stack::checks;
use cws_stack::compare::{self, CompareOptions};
use cws_stack::config::{self, Config};
use cws_stack::job::JobController;
use cws_stack::request::{ProcessingOptions, StackRequest};
use cws_stack::suite;
use cws_stack::tool::{MagickTool, TransformTool};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Inject image stacks into sliced CWS archives
#[derive(Parser, Debug)]
#[command(name = "cws-stack", version, about = "Replace the slice images of a CWS archive with your own stack.")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Also write the log to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Raster tool executable, overriding the config
    #[arg(long)]
    tool: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a new archive from a template and an image stack
    Inject {
        template: PathBuf,
        /// First image of the stack, e.g. slice_0000.png
        first_slice: PathBuf,
        output: PathBuf,
        #[command(flatten)]
        options: OptionArgs,
    },
    /// Check whether two archives hold the same slices and control files
    Compare {
        a: PathBuf,
        b: PathBuf,
        /// Folder for diff artifacts (default: <a>_diff)
        #[arg(long)]
        diff_dir: Option<PathBuf>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate inputs without running a job
    Check {
        template: PathBuf,
        first_slice: PathBuf,
        output: PathBuf,
        #[command(flatten)]
        options: OptionArgs,
    },
    /// Run a regression suite file
    Suite { file: PathBuf },
}

/// Processing flags; unset flags keep the config file's values.
#[derive(Args, Debug, Default)]
struct OptionArgs {
    #[arg(long)]
    negate: bool,
    /// Threshold at this percent of full brightness (0-100)
    #[arg(long, value_name = "PERCENT")]
    threshold: Option<f64>,
    /// Threshold at this absolute gray level (0-255)
    #[arg(long, value_name = "LEVEL", conflicts_with = "threshold")]
    threshold_level: Option<u8>,
    /// Use the first slice for every layer
    #[arg(long)]
    repeat_first: bool,
    /// Multiply every slice with this mask image
    #[arg(long)]
    mask: Option<PathBuf>,
}

impl OptionArgs {
    fn apply(self, mut options: ProcessingOptions) -> ProcessingOptions {
        options.negate |= self.negate;
        options.repeat_first |= self.repeat_first;
        let percent = self
            .threshold
            .or(self.threshold_level.map(ProcessingOptions::threshold_from_gray_level));
        if let Some(percent) = percent {
            options.threshold = true;
            options.threshold_percent = percent;
        }
        if let Some(mask) = self.mask {
            options.use_mask = true;
            options.mask_image = Some(mask);
        }
        options
    }
}

fn init_logging(verbose: u8, log_file: Option<&PathBuf>) -> Result<(), BoxError> {
    let level = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let builder = tracing_subscriber::fmt().with_max_level(level).with_target(false);
    match log_file {
        Some(path) => {
            let file = File::create(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_ref())?;

    let mut config = match &cli.config {
        Some(path) => config::load_config_path(path).map_err(|e| {
            tracing::error!("Failed to load config from '{}': {}", path.display(), e);
            e
        })?,
        None => Config::default(),
    };
    if let Some(program) = cli.tool {
        config.tool.program = program.to_string_lossy().into_owned();
        config.tool.directory = None;
    }
    let tool: Arc<dyn TransformTool> = Arc::new(MagickTool::from_config(&config.tool));

    let code = match cli.command {
        Commands::Inject { template, first_slice, output, options } => {
            let request = StackRequest::new(template, first_slice, output)
                .with_options(options.apply(config.options.clone()));
            inject(&config, tool, request).await?
        }
        Commands::Compare { a, b, diff_dir, json } => {
            let options = CompareOptions { diff_dir, scratch_dir: config.job.scratch_dir.clone() };
            let result = compare::compare(&a, &b, &options, tool.as_ref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Slices: {} vs {}, {} equal", result.slice_count_a, result.slice_count_b, result.slices_equal);
                if !result.slices_different.is_empty() {
                    println!("Different slices: {:?}", result.slices_different);
                }
                println!("gcode: {:?}, slicing: {:?}, manifest: {:?}", result.gcode, result.slicing, result.manifest);
                if result.equal {
                    println!("Archives match");
                } else {
                    println!("Archives differ; see {}", result.diff_dir.display());
                }
            }
            i32::from(!result.equal)
        }
        Commands::Check { template, first_slice, output, options } => {
            let request = StackRequest::new(template, first_slice, output)
                .with_options(options.apply(config.options.clone()));
            let report = checks::check_request(&request);
            for outcome in &report.outcomes {
                println!("[{}] {}: {}", if outcome.ok { "ok" } else { "!!" }, outcome.name, outcome.message);
            }
            if let (Some(template), Some(stack)) = (report.template_slices, report.stack_slices) {
                if stack > template {
                    println!("{} slices will be lost", stack - template);
                } else if stack < template {
                    println!("{} slices will be blank", template - stack);
                }
            }
            i32::from(!report.ok())
        }
        Commands::Suite { file } => {
            let report = suite::run_suite(&file, &config, tool).await?;
            for case in &report.cases {
                let verdict = if case.passed() { "Passed" } else { "Failed!" };
                println!("{}: {} ({})", case.name, verdict, case.build_message);
                if let Some(error) = &case.compare_error {
                    println!("    {}", error);
                }
            }
            if report.passed() {
                println!("All tests passed!");
                0
            } else {
                println!("Some tests failed: {}", report.failed_names().collect::<Vec<_>>().join(", "));
                1
            }
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn inject(config: &Config, tool: Arc<dyn TransformTool>, request: StackRequest) -> Result<i32, BoxError> {
    let mut controller = JobController::new(config.job.clone(), tool);
    if !controller.start(request) {
        return Err("could not start the job".into());
    }

    let cancel = controller.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; cancelling");
            cancel.cancel();
        }
    });

    let mut last_percent = -1.0;
    loop {
        while let Some(message) = controller.poll_message() {
            println!("{}", message);
        }
        let status = controller.poll_status();
        if status.percent >= last_percent + 1.0 || status.done {
            println!("{:5.1}%", status.percent);
            last_percent = status.percent;
        }
        if status.done {
            while let Some(message) = controller.poll_message() {
                println!("{}", message);
            }
            println!("{}", status.final_message);
            return Ok(i32::from(!status.success));
        }
        tokio::time::sleep(config.job.poll_interval()).await;
    }
}
