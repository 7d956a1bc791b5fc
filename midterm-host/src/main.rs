//! `midterm-host`: the long-lived daemon that owns every `Session`.
//! Restarting `midterm-gateway` never touches this process.

mod ipc;
mod logging;
mod run_as;

use std::sync::Arc;

use midterm_core::config::HostConfig;
use midterm_core::HostCore;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage() {
    println!("midterm-host {VERSION}");
    println!();
    println!("Usage: midterm-host [OPTIONS]");
    println!();
    println!("  (no flag)       run as a daemon bound to the local IPC endpoint");
    println!("  -v, --version   print version and exit");
    println!("  -h, --help      print this message and exit");
    println!();
    println!("Environment:");
    println!("  MIDTERM_HOST_SOCKET     override the IPC socket/pipe path");
    println!("  MIDTERM_IPC_WORKERS     non-streaming request worker pool size (default 4)");
    println!("  MIDTERM_SCROLLBACK_CAP_BYTES   per-session scrollback cap (default 2 MiB)");
    println!("  MIDTERM_SERVICE_MODE=1  log to the system service directory instead of ~/.midterm");
    println!("  MM_RUN_AS_USER, MM_RUN_AS_USER_SID, MM_RUN_AS_UID, MM_RUN_AS_GID");
    println!("                          de-elevation target for spawned shells");
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("--version") | Some("-v") => {
            println!("midterm-host {VERSION}");
            std::process::exit(0);
        }
        Some("--help") | Some("-h") => {
            print_usage();
            std::process::exit(0);
        }
        Some(other) => {
            eprintln!("midterm-host: unrecognized option '{other}'");
            print_usage();
            std::process::exit(1);
        }
        None => {}
    }

    if let Err(e) = logging::init("info") {
        eprintln!("midterm-host: failed to initialize logging: {e}");
    }

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("midterm-host: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = rt.block_on(run());
    std::process::exit(exit_code);
}

async fn run() -> i32 {
    let config = HostConfig::from_env();
    if config.run_as_target.is_set() {
        log::warn!(
            "run-as de-elevation target configured ({:?}) but cannot be applied -- every session.create will fail until these variables are unset",
            config.run_as_target
        );
    }

    let endpoint = ipc::transport::resolve_endpoint(config.socket_path_override.as_deref());
    let workers = config.ipc_workers;
    let host = HostCore::new(config);

    log::info!("midterm-host {VERSION} starting, endpoint={endpoint}");

    let shutdown_host = host.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("received interrupt, shutting down all sessions");
            shutdown_host.shutdown(std::time::Duration::from_secs(2)).await;
            std::process::exit(0);
        }
    });

    match ipc::serve(host, &endpoint, workers).await {
        Ok(()) => 0,
        Err(e) => {
            log::error!("ipc server failed: {e}");
            1
        }
    }
}
