mod export;
mod timing;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use stratum_core::{
    Accelerator, AcceleratorMode, CancelToken, HistoryItem, ModuleRegistry, Pipeline,
    PipelineConfig, Session,
};
use stratum_gpu::WgpuAccelerator;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::timing::{StepTimings, Timer};

#[derive(Parser, Debug)]
#[command(name = "stratum", version, about = "Apply an edit history to an image")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an edit history over an image and write the result.
    Process(ProcessArgs),
    /// List the registered processing modules.
    Modules,
    /// Print a history with every item upgraded to current parameter versions.
    Migrate(MigrateArgs),
}

#[derive(Parser, Debug)]
struct ProcessArgs {
    /// Input image (JPEG, PNG or TIFF).
    input: PathBuf,

    /// Output image; the format follows the extension.
    output: PathBuf,

    /// Edit history JSON. Defaults to every module at its default parameters.
    #[arg(long)]
    history: Option<PathBuf>,

    /// Pipeline config JSON. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Never use the GPU.
    #[arg(long, default_value_t = false)]
    no_accel: bool,

    /// Process tiling-capable modules in square tiles of this edge length.
    #[arg(long)]
    tile: Option<u32>,

    /// Worker threads for the CPU path.
    #[arg(long)]
    threads: Option<usize>,

    /// Carry the input's alpha channel through every module as a mask.
    #[arg(long, default_value_t = false)]
    mask_display: bool,
}

#[derive(Parser, Debug)]
struct MigrateArgs {
    /// Edit history JSON.
    history: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Process(args) => cmd_process(args),
        Command::Modules => cmd_modules(),
        Command::Migrate(args) => cmd_migrate(args),
    }
}

fn read_history(path: &Path) -> Result<Vec<HistoryItem>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading history {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing history {}", path.display()))
}

fn default_history(registry: &ModuleRegistry) -> Result<Vec<HistoryItem>> {
    registry
        .iter()
        .map(|module| -> Result<HistoryItem> {
            Ok(HistoryItem::new(module.descriptor().op, module.default_params()?))
        })
        .collect()
}

fn pipeline_config(args: &ProcessArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if args.no_accel {
        config.accelerator = AcceleratorMode::Disabled;
    }
    if let Some(tile) = args.tile {
        config.tile_size = Some(tile).filter(|&t| t > 0);
    }
    if args.threads.is_some() {
        config.threads = args.threads;
    }
    config.mask_display |= args.mask_display;
    Ok(config)
}

fn open_accelerator(config: &PipelineConfig) -> Option<Arc<dyn Accelerator>> {
    if !config.accelerator_enabled() {
        info!("GPU disabled, using the CPU path");
        return None;
    }
    match WgpuAccelerator::with_default_adapter() {
        Ok(accel) => {
            info!(adapter = accel.name(), "using GPU");
            Some(Arc::new(accel))
        }
        Err(e) => {
            warn!(error = %format!("{e:#}"), "GPU unavailable, using the CPU path");
            None
        }
    }
}

fn cmd_process(args: ProcessArgs) -> Result<()> {
    let config = pipeline_config(&args)?;
    let registry = ModuleRegistry::with_builtin_modules();
    let history = match &args.history {
        Some(path) => read_history(path)?,
        None => default_history(&registry)?,
    };
    let session = Session::new(registry, open_accelerator(&config));
    let mut timings = StepTimings::new();

    let timer = Timer::start("load");
    let input = export::load_linear(&args.input, config.mask_display)?;
    let (name, elapsed) = timer.stop();
    info!("{:.6} secs to load the image", elapsed.as_secs_f64());
    timings.add_step(name, elapsed);

    let timer = Timer::start("process");
    let mut pipeline = Pipeline::new(&session, &history, config)?;
    let (output, report) = pipeline.process(&input, &CancelToken::new())?;
    let (name, elapsed) = timer.stop();
    info!("pipeline processing took {:.6} secs", elapsed.as_secs_f64());
    timings.add_step(name, elapsed);

    for stage in &report.stages {
        info!(
            module = %stage.op,
            backend = ?stage.backend,
            regions = stage.regions,
            fallbacks = stage.fallbacks,
            "stage"
        );
    }
    if report.fallbacks() > 0 {
        warn!(
            fallbacks = report.fallbacks(),
            "some regions were re-run on the CPU"
        );
    }

    let timer = Timer::start("write");
    export::save_srgb(&output, &args.output)?;
    let (name, elapsed) = timer.stop();
    info!("{:.6} secs to write the image", elapsed.as_secs_f64());
    timings.add_step(name, elapsed);

    timings.log_summary();
    Ok(())
}

fn cmd_modules() -> Result<()> {
    let registry = ModuleRegistry::with_builtin_modules();
    for module in registry.iter() {
        let desc = module.descriptor();
        println!("{} (v{}): {}", desc.op, module.params_version(), desc.name);
        if !desc.aliases.is_empty() {
            println!("  aliases: {}", desc.aliases.join(", "));
        }
        println!("  {}", desc.description.purpose);
        println!(
            "  groups: {:?}  colorspace: {:?}  tiling: {}",
            desc.groups, desc.colorspace, desc.flags.allow_tiling
        );
        for field in module.param_fields() {
            println!(
                "  {:<22} {:>8} .. {:<8} default {:<6} {}",
                field.name, field.min, field.max, field.default, field.description
            );
        }
    }
    Ok(())
}

fn cmd_migrate(args: MigrateArgs) -> Result<()> {
    let history = read_history(&args.history)?;
    let session = Session::general_only();
    let mut upgraded = Vec::with_capacity(history.len());

    for item in history {
        let Some(module) = session.registry().get(&item.op) else {
            eprintln!("{}: unknown module, kept as is", item.op);
            upgraded.push(item);
            continue;
        };
        let resolved = session.resolve_params(&item)?;
        let replaced = match module.migrate(&item.params) {
            Ok(blob) => blob != resolved,
            Err(_) => true,
        };
        if replaced {
            eprintln!(
                "{}: version {} params unusable, replaced by defaults",
                item.op, item.params.version
            );
        }
        upgraded.push(HistoryItem {
            params: resolved,
            ..item
        });
    }

    println!("{}", serde_json::to_string_pretty(&upgraded)?);
    Ok(())
}
