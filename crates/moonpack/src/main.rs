use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use log::debug;
use moonpack::{
    config::Config,
    deploy::{PublishTarget, deploy_single_file, publish},
    error::JobWarning,
    job::{Analysis, BundleJob, JobReport},
    protocol::WorkerReport,
    resolver::Resolution,
    worker::run_worker,
};

#[derive(Parser, Debug)]
#[command(name = "moonpack")]
#[command(version)]
#[command(about = "Bundle a Lua require tree into a single deployable file")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bundle a project, write the artifact and deploy it
    Bundle(BundleArgs),
    /// Syntax-check a project and verify that every require resolves
    Check(CheckArgs),
    /// Print the dependency tree of a project
    Graph(ProjectArgs),
    /// Run the bundling engine for one project (used by `bundle`)
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
struct ProjectArgs {
    /// Project directory containing the entry module
    project_dir: PathBuf,

    /// Entry module, relative to the project directory [default: Main.lua]
    #[arg(long)]
    entry: Option<String>,

    /// Config file [default: <project-dir>/moonpack.toml]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Project search root; repeat to give several, in precedence order
    #[arg(long = "src", value_name = "DIR")]
    src: Vec<PathBuf>,

    /// Runtime module directory, also the deployment target
    #[arg(long)]
    deploy_dir: Option<PathBuf>,

    /// Worker timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Skip the `luac -p` syntax check
    #[arg(long)]
    no_validate: bool,
}

#[derive(Args, Debug)]
struct BundleArgs {
    #[command(flatten)]
    project: ProjectArgs,

    /// Directory the bundle is written to [default: <project-dir>/build]
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// File name of the bundle [default: title.txt contents, or Main.lua]
    #[arg(long)]
    output_name: Option<String>,

    /// Write the artifact without copying it to the deploy directory
    #[arg(long)]
    no_deploy: bool,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[command(flatten)]
    project: ProjectArgs,

    /// Also run a full bundle without writing any output
    #[arg(long)]
    bundle: bool,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    project_dir: PathBuf,
    entry_file: String,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Bundle(args) => bundle_command(&args)?,
        Command::Check(args) => check_command(&args)?,
        Command::Graph(args) => graph_command(&args)?,
        Command::Worker(args) => return worker_command(&args),
    }
    Ok(ExitCode::SUCCESS)
}

fn init_logging(verbose: u8) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    match verbose {
        0 => {}
        1 => {
            builder.filter_level(log::LevelFilter::Info);
        }
        2 => {
            builder.filter_level(log::LevelFilter::Debug);
        }
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
        }
    }
    builder.target(env_logger::Target::Stderr).init();
}

fn load_config(args: &ProjectArgs) -> Result<Config> {
    let mut config = Config::load(&args.project_dir, args.config.as_deref())?;
    if !args.src.is_empty() {
        config.src = args
            .src
            .iter()
            .map(|dir| {
                std::path::absolute(dir)
                    .with_context(|| format!("Invalid --src {}", dir.display()))
            })
            .collect::<Result<_>>()?;
    }
    if let Some(dir) = &args.deploy_dir {
        config.deploy_dir = Some(dir.clone());
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if args.no_validate {
        config.validate_syntax = false;
    }
    debug!("Effective config: {config:?}");
    Ok(config)
}

fn bundle_command(args: &BundleArgs) -> Result<()> {
    let mut config = load_config(&args.project)?;
    if let Some(dir) = &args.output_dir {
        config.output_dir = Some(dir.clone());
    }
    if let Some(name) = &args.output_name {
        config.output_name = Some(name.clone());
    }

    let job = BundleJob::from_config(
        &args.project.project_dir,
        args.project.entry.as_deref(),
        &config,
    )?;
    if job.is_single_file() {
        let deploy_dir = if args.no_deploy {
            None
        } else {
            Some(config.deploy_dir()?)
        };
        return single_file_command(&job, deploy_dir.as_deref());
    }

    let target = PublishTarget {
        output_dir: config.output_dir(&job.project_dir),
        output_name: config.output_name().to_owned(),
        deploy_dir: if args.no_deploy {
            None
        } else {
            Some(config.deploy_dir()?)
        },
    };

    let report = job.run()?;
    let published = publish(&report.bundle, &target)?;

    let mut out = io::stdout().lock();
    print_report(&mut out, &job, &report)?;
    writeln!(
        out,
        "Artifact: {} ({} bytes, sha256 {})",
        published.artifact.path.display(),
        published.artifact.size,
        published.artifact.sha256
    )?;
    if let Some(deployed) = &published.deployed {
        writeln!(out, "Deployed to: {}", deployed.display())?;
    }
    Ok(())
}

/// Syntax-check a standalone entry and deploy it without bundling
fn single_file_command(job: &BundleJob, deploy_dir: Option<&Path>) -> Result<()> {
    let warnings = job.check_single_file()?;
    let mut out = io::stdout().lock();
    print_warnings(&mut out, &warnings)?;
    match deploy_dir {
        Some(dir) => {
            let artifact = deploy_single_file(&job.entry_path(), dir)?;
            writeln!(
                out,
                "Single file deployed to: {} ({} bytes, sha256 {})",
                artifact.path.display(),
                artifact.size,
                artifact.sha256
            )?;
        }
        None => writeln!(out, "Single file {} checked, not deployed", job.entry_file)?,
    }
    Ok(())
}

fn check_command(args: &CheckArgs) -> Result<()> {
    let config = load_config(&args.project)?;
    let job = BundleJob::from_config(
        &args.project.project_dir,
        args.project.entry.as_deref(),
        &config,
    )?;
    if job.is_single_file() {
        let warnings = job.check_single_file()?;
        let mut out = io::stdout().lock();
        writeln!(out, "Single file {} passed the check", job.entry_file)?;
        print_warnings(&mut out, &warnings)?;
        return Ok(());
    }
    let analysis = job.check()?;

    let mut out = io::stdout().lock();
    writeln!(
        out,
        "Dependency analysis passed: {} module(s), {} runtime module(s)",
        analysis.graph.node_count(),
        analysis.globals.len()
    )?;
    print_warnings(&mut out, &analysis.warnings)?;

    if args.bundle {
        // Validation already ran above
        let dry_run = BundleJob {
            validate_syntax: false,
            ..job.clone()
        };
        let report = dry_run.run()?;
        print_report(&mut out, &job, &report)?;
        writeln!(out, "Bundle check passed (nothing written)")?;
    }
    Ok(())
}

fn graph_command(args: &ProjectArgs) -> Result<()> {
    let config = load_config(args)?;
    let job = BundleJob::from_config(&args.project_dir, args.entry.as_deref(), &config)?;
    let analysis = job.analyze()?;

    let mut out = io::stdout().lock();
    print_graph(&mut out, &job.project_dir, &analysis)?;
    Ok(())
}

fn worker_command(args: &WorkerArgs) -> Result<ExitCode> {
    let report = run_worker(&args.project_dir, &args.entry_file);
    report.write_to(io::stdout().lock())?;
    if let WorkerReport::Failure { diagnostic } = &report {
        writeln!(io::stderr(), "{diagnostic}")?;
    }
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_report(out: &mut impl Write, job: &BundleJob, report: &JobReport) -> Result<()> {
    writeln!(
        out,
        "Bundled {} module(s) from {}",
        report.module_count,
        relative(&job.project_dir, &report.entry).display()
    )?;
    if !report.stripped.is_empty() {
        writeln!(out, "Runtime modules left to the host: {}", report.stripped.join(", "))?;
    }
    for group in &report.cycle_groups {
        writeln!(out, "Cycle: {}", format_group(&job.project_dir, group))?;
    }
    print_warnings(out, &report.warnings)
}

fn print_warnings(out: &mut impl Write, warnings: &[JobWarning]) -> Result<()> {
    for warning in warnings {
        writeln!(out, "warning: {warning}")?;
    }
    Ok(())
}

fn print_graph(out: &mut impl Write, project_dir: &Path, analysis: &Analysis) -> Result<()> {
    let graph = &analysis.graph;
    for node in graph.nodes.values() {
        writeln!(out, "{}", relative(project_dir, &node.path).display())?;
        for dependency in &node.dependencies {
            match &dependency.resolution {
                Resolution::Local(path) => writeln!(
                    out,
                    "  {} -> {}",
                    dependency.name,
                    relative(project_dir, path).display()
                )?,
                Resolution::Global(_) | Resolution::Unresolved => {
                    writeln!(out, "  {} [{}]", dependency.name, dependency.kind())?;
                }
            }
        }
    }

    if !analysis.globals.is_empty() {
        let globals: Vec<&str> = analysis.globals.iter().map(String::as_str).collect();
        writeln!(out, "\nRuntime modules: {}", globals.join(", "))?;
    }
    let unresolved = graph.unresolved();
    if !unresolved.is_empty() {
        writeln!(out, "\nUnresolved:")?;
        for reference in &unresolved {
            writeln!(out, "  {reference}")?;
        }
    }
    for group in &analysis.cycle_groups {
        writeln!(out, "\nCycle: {}", format_group(project_dir, group))?;
    }
    print_warnings(out, &analysis.warnings)
}

fn format_group(project_dir: &Path, group: &[PathBuf]) -> String {
    group
        .iter()
        .map(|path| relative(project_dir, path).display().to_string())
        .collect::<Vec<_>>()
        .join(" <-> ")
}

fn relative<'a>(base: &Path, path: &'a Path) -> &'a Path {
    path.strip_prefix(base).unwrap_or(path)
}
