use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{self, ConfigDoc};
use crate::engine::ENGINE_ENV;
use crate::executor::{ExecCtx, LogSink, RunOptions, execute_plan};
use crate::modules::core::TargetConfig;
use crate::modules::{Pipeline, build_plan};
use crate::workspace::{PKG_DIR_ENV, PackagePaths};
use crate::{Error, Result};

#[derive(Debug, Parser)]
#[command(name = "bootforge", author, version, about)]
pub struct Cli {
    /// Log filter (e.g. `debug`, `bootforge=trace`); defaults to RUST_LOG or `info`
    #[arg(long, global = true)]
    pub log_level: Option<String>,
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Rebuild one target inside a freshly built container
    Rebuild {
        /// Target name (a file under <pkg>/targets/)
        target: String,
        #[command(flatten)]
        args: RebuildArgs,
    },
    /// Print the ordered task plan for a target
    Plan {
        target: String,
        /// Show the in-container driver plan instead of the host plan
        #[arg(long)]
        driver: bool,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
        #[command(flatten)]
        spec: SpecArgs,
    },
    /// Print the fully merged build spec (after extends/imports)
    Resolve {
        target: String,
        #[command(flatten)]
        spec: SpecArgs,
    },
    /// Run the build inside the container (invoked by the image entrypoint)
    Drive {
        /// Resolved build spec
        #[arg(long)]
        spec: PathBuf,
        /// Where sources are downloaded and unpacked
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,
        /// Artifact output directory; defaults to [container].output_mount
        #[arg(long)]
        output: Option<PathBuf>,
        /// Directory holding staged inputs; defaults to the spec's directory
        #[arg(long)]
        input_dir: Option<PathBuf>,
        /// Resolve inputs against a package directory instead of staged files
        #[arg(long)]
        pkg_dir: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Clone, Args)]
pub struct SpecArgs {
    /// Package directory (templates, target specs, artifact destinations)
    #[arg(long, env = PKG_DIR_ENV)]
    pub pkg_dir: Option<PathBuf>,
    /// Build spec to use instead of <pkg>/targets/<target>.toml
    #[arg(long)]
    pub spec: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct RebuildArgs {
    /// Container engine executable to use instead of auto-detection
    #[arg(long, env = ENGINE_ENV)]
    pub overwrite_container_executable: Option<String>,
    #[command(flatten)]
    pub spec: SpecArgs,
    /// Prebuilt driver binary instead of `cargo build`
    #[arg(long)]
    pub driver_binary: Option<PathBuf>,
    /// Parent directory for the staging directory [default: /tmp]
    #[arg(long)]
    pub staging_root: Option<PathBuf>,
    /// Keep the staging directory after the run
    #[arg(long)]
    pub keep_staging: bool,
    /// Fail unless artifacts hash the same as in this earlier run manifest
    #[arg(long)]
    pub verify_against: Option<PathBuf>,
    /// Log every task and command without running them
    #[arg(long)]
    pub dry_run: bool,
}

/// Standalone per-target rebuild program.
#[derive(Debug, Parser)]
#[command(author, version, about = "Rebuild one target inside a container")]
pub struct RebuildCli {
    #[arg(long)]
    pub log_level: Option<String>,
    #[command(flatten)]
    pub args: RebuildArgs,
}

pub fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(l) => EnvFilter::new(l),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Log the error and map its kind to the process exit status.
pub fn report(res: Result<()>) -> ExitCode {
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = e.kind().as_str(), "{e}");
            ExitCode::from(e.kind().exit_code())
        }
    }
}

pub fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());
    report(run(cli.cmd))
}

/// Entry point of the `rebuild-<target>` programs.
pub fn rebuild_main(target: &str) -> ExitCode {
    let cli = RebuildCli::parse();
    init_tracing(cli.log_level.as_deref());
    report(cmd_rebuild(target, &cli.args))
}

pub fn run(cmd: Command) -> Result<()> {
    match cmd {
        Command::Rebuild { target, args } => cmd_rebuild(&target, &args),
        Command::Plan {
            target,
            driver,
            dot,
            spec,
        } => cmd_plan(&target, &spec, driver, dot),
        Command::Resolve { target, spec } => cmd_resolve(&target, &spec),
        Command::Drive {
            spec,
            work_dir,
            output,
            input_dir,
            pkg_dir,
            dry_run,
        } => cmd_drive(&spec, work_dir, output, input_dir, pkg_dir, dry_run),
    }
}

/// Load the build spec for `target`, returning it with the package root.
pub fn load_target(target: &str, args: &SpecArgs) -> Result<(PackagePaths, ConfigDoc)> {
    let pkg = PackagePaths::discover(args.pkg_dir.as_deref())?;
    let path = match args.spec.as_ref() {
        Some(p) => p.clone(),
        None => pkg.target_spec(target)?,
    };
    if !path.is_file() {
        return Err(Error::fs(format!(
            "no build spec for target '{target}' at {}",
            path.display()
        )));
    }
    let doc = config::load(&path)?;
    let declared = TargetConfig::load(&doc)?;
    if declared.name != target {
        warn!(
            requested = target,
            declared = %declared.name,
            "spec declares a different target name"
        );
    }
    Ok((pkg, doc))
}

pub fn cmd_rebuild(target: &str, args: &RebuildArgs) -> Result<()> {
    let (pkg, doc) = load_target(target, &args.spec)?;
    let plan = build_plan(&doc, Pipeline::Host)?;
    let reg = Pipeline::Host.registry()?;

    let mut opts = RunOptions::new(pkg);
    opts.engine_override = args.overwrite_container_executable.clone();
    if let Some(root) = args.staging_root.clone() {
        opts.staging_root = root;
    }
    opts.keep_staging = args.keep_staging;
    opts.driver_binary = args.driver_binary.clone();
    opts.verify_against = args.verify_against.clone();

    let mut ctx = ExecCtx::new(args.dry_run, Arc::new(LogSink::default()), opts);
    execute_plan(&doc, &plan, &reg, &mut ctx)
}

fn cmd_plan(target: &str, args: &SpecArgs, driver: bool, dot: bool) -> Result<()> {
    let (_, doc) = load_target(target, args)?;
    let pipeline = if driver {
        Pipeline::Driver
    } else {
        Pipeline::Host
    };
    let plan = build_plan(&doc, pipeline)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }
    for (i, task) in plan.ordered()?.iter().enumerate() {
        println!(
            "{:>2}. {:<22}  {:<10} {:<10}  {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn cmd_resolve(target: &str, args: &SpecArgs) -> Result<()> {
    let (_, doc) = load_target(target, args)?;
    print!("{}", doc.to_toml_string()?);
    Ok(())
}

fn cmd_drive(
    spec: &Path,
    work_dir: PathBuf,
    output: Option<PathBuf>,
    input_dir: Option<PathBuf>,
    pkg_dir: Option<PathBuf>,
    dry_run: bool,
) -> Result<()> {
    let doc = config::load(spec)?;
    let spec_dir = spec
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let (pkg, input_dir) = match pkg_dir {
        Some(dir) => (PackagePaths::discover(Some(dir.as_path()))?, input_dir),
        None => (
            PackagePaths::new(spec_dir.clone()),
            Some(input_dir.unwrap_or(spec_dir)),
        ),
    };

    let plan = build_plan(&doc, Pipeline::Driver)?;
    let reg = Pipeline::Driver.registry()?;

    let mut opts = RunOptions::new(pkg);
    opts.work_dir = work_dir;
    opts.output_dir = output;
    opts.input_dir = input_dir;

    let mut ctx = ExecCtx::new(dry_run, Arc::new(LogSink::default()), opts);
    execute_plan(&doc, &plan, &reg, &mut ctx)
}
