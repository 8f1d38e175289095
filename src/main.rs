//! Titan: a file-routed HTTP API framework with an integrated dev loop.

use clap::Parser;

use titan_server::cli::Cli;
use titan_server::options::{Command, Env};
use titan_server::utils::{green, red};
use titan_server::{compiler, config, manifest, route_scanner};

/// Global allocator: mimalloc for better allocation throughput under the
/// request/build workload this server drives.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("titan_server={default_level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let resolved = cli.resolve();
    let command = resolved.command;

    init_tracing(resolved.overrides.verbose);

    let project_root = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("{} {e}", red("[titan] failed to resolve the working directory:"));
            std::process::exit(1);
        }
    };

    let exit_code = match command {
        Command::Build => run_build(project_root, resolved).await,
        Command::Dev | Command::Start => run_server(project_root, command, resolved).await,
    };

    std::process::exit(exit_code);
}

async fn run_build(project_root: std::path::PathBuf, resolved: titan_server::cli::Resolved) -> i32 {
    let options = match config::load(&project_root, &resolved.overrides, Command::Build, Env::Prod) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{} {e}", red("[titan] config error:"));
            return 1;
        }
    };

    let output_root = project_root.join(&options.build.output_root);
    let routes_root = project_root.join(&options.build.routes_subtree);
    let output_ext = if cfg!(target_os = "windows") {
        "dll"
    } else if cfg!(target_os = "macos") {
        "dylib"
    } else {
        "so"
    };

    let descriptors = match route_scanner::scan(&routes_root, &output_root, output_ext, &options.build.global_prefix) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{} {e}", red("[titan] scan failed:"));
            return 1;
        }
    };

    let cache = compiler::CompilationCache::load(&output_root).await;
    let now_ms =
        std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0);

    if let Err(e) = compiler::compile(&options.build.builder, cache, &output_root, &descriptors, now_ms).await {
        eprintln!("{} {e}", red("[titan] build failed:"));
        return 1;
    }

    if let Err(e) = manifest::publish(&output_root, &descriptors).await {
        eprintln!("{} {e}", red("[titan] failed to publish manifest:"));
        return 1;
    }

    println!("{} {} routes built", green("[titan] build complete —"), descriptors.len());
    0
}

async fn run_server(project_root: std::path::PathBuf, command: Command, resolved: titan_server::cli::Resolved) -> i32 {
    let orchestrator = titan_server::orchestrator::Orchestrator::new(
        project_root,
        command,
        resolved.env,
        resolved.overrides,
        resolved.watch,
        resolved.tls,
    );

    match orchestrator.run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{} {e}", red("[titan] fatal error:"));
            1
        }
    }
}
