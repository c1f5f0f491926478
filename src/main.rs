use anyhow::Result;
use clap::Parser;
use fwpm::cleanup;
use fwpm::commands::{self, StorageOptions};
use fwpm::package::PackageType;
use fwpm::runtime::RealRuntime;
use fwpm::Config;
use std::path::PathBuf;

/// fwpm - package manager for embedded development
///
/// Installs libraries, development platforms and tools from the package
/// registry, from VCS remotes, from archive URLs or from local directories.
///
/// Examples:
///   fwpm install alice/blink@^1.2    # Latest 1.x release of alice/blink
///   fwpm install -t tool toolchain-gccarmnoneeabi
///   fwpm install https://github.com/bob/ws2812.git#v0.3.1
///   fwpm install symlink:///home/me/work/mylib
#[derive(Parser, Debug)]
#[command(author, version = env!("FWPM_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Core directory holding all storage roots (defaults to ~/.fwpm)
    #[arg(long = "core-dir", env = "FWPM_CORE_DIR", value_name = "PATH", global = true)]
    core_dir: Option<PathBuf>,

    /// Registry API URL
    #[arg(long = "registry-url", env = "FWPM_REGISTRY_URL", value_name = "URL", global = true)]
    registry_url: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Install packages with their dependencies
    Install(InstallArgs),

    /// Remove installed packages
    Uninstall(UninstallArgs),

    /// Update installed packages
    Update(UpdateArgs),

    /// Show which installed packages have newer releases
    Outdated(StorageArgs),

    /// List installed packages
    List(StorageArgs),

    /// Pack a package directory into a tarball
    Pack(PackArgs),
}

#[derive(clap::Args, Debug)]
struct StorageArgs {
    /// Kind of packages to operate on
    #[arg(short = 't', long = "type", default_value = "library", value_name = "TYPE")]
    pkg_type: PackageType,

    /// Storage root to use instead of the default one of the kind
    #[arg(short = 'd', long = "storage-dir", value_name = "PATH")]
    storage_dir: Option<PathBuf>,
}

impl From<&StorageArgs> for StorageOptions {
    fn from(args: &StorageArgs) -> Self {
        StorageOptions {
            pkg_type: args.pkg_type,
            storage_dir: args.storage_dir.clone(),
        }
    }
}

#[derive(clap::Args, Debug)]
struct InstallArgs {
    /// Package specifiers, e.g. "owner/name@^1.0" or an archive URL
    #[arg(value_name = "SPEC", required = true)]
    specs: Vec<String>,

    #[command(flatten)]
    storage: StorageArgs,

    #[arg(long = "skip-dependencies")]
    skip_dependencies: bool,

    /// Reinstall even if a matching package is installed
    #[arg(short = 'f', long)]
    force: bool,
}

#[derive(clap::Args, Debug)]
struct UninstallArgs {
    #[arg(value_name = "SPEC", required = true)]
    specs: Vec<String>,

    #[command(flatten)]
    storage: StorageArgs,

    /// Keep dependencies that were installed with the package
    #[arg(long = "skip-dependencies")]
    skip_dependencies: bool,
}

#[derive(clap::Args, Debug)]
struct UpdateArgs {
    /// Packages to update; all installed packages when omitted
    #[arg(value_name = "SPEC")]
    specs: Vec<String>,

    #[command(flatten)]
    storage: StorageArgs,

    #[arg(long = "skip-dependencies")]
    skip_dependencies: bool,
}

#[derive(clap::Args, Debug)]
struct PackArgs {
    /// Package directory or archive
    #[arg(value_name = "SOURCE", default_value = ".")]
    source: PathBuf,

    /// Output file or directory
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let runtime = RealRuntime;

    let config = Config::from_env(&runtime, cli.core_dir.clone(), cli.registry_url.clone())?;
    let cleanup_ctx = cleanup::new_shared();
    let cleanup_ctx_clone = cleanup_ctx.clone();
    let ctrl_c_handler = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, cleaning up...");
            cleanup::run(&cleanup_ctx_clone);
            std::process::exit(130);
        }
    });

    let result = run(runtime, &config, cli.command, cleanup_ctx).await;
    ctrl_c_handler.abort();
    result
}

async fn run(
    runtime: RealRuntime,
    config: &Config,
    command: Commands,
    cleanup_ctx: cleanup::SharedCleanupContext,
) -> Result<()> {
    match command {
        Commands::Install(args) => {
            let pm = commands::open_manager(runtime, config, &StorageOptions::from(&args.storage), cleanup_ctx)?;
            commands::install(&pm, &args.specs, args.skip_dependencies, args.force).await
        }
        Commands::Uninstall(args) => {
            let pm = commands::open_manager(runtime, config, &StorageOptions::from(&args.storage), cleanup_ctx)?;
            commands::uninstall(&pm, &args.specs, args.skip_dependencies)
        }
        Commands::Update(args) => {
            let pm = commands::open_manager(runtime, config, &StorageOptions::from(&args.storage), cleanup_ctx)?;
            commands::update(&pm, &args.specs, args.skip_dependencies).await
        }
        Commands::Outdated(args) => {
            let pm = commands::open_manager(runtime, config, &StorageOptions::from(&args), cleanup_ctx)?;
            commands::outdated(&pm).await
        }
        Commands::List(args) => {
            let pm = commands::open_manager(runtime, config, &StorageOptions::from(&args), cleanup_ctx)?;
            commands::list(&pm)
        }
        Commands::Pack(args) => {
            commands::pack(&runtime, &args.source, args.output.as_deref())?;
            Ok(())
        }
    }
}
