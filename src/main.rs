use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info};
use structopt::StructOpt;

use openlink::cli::{self, Opts};
use openlink::coordinator::DebugCoordinator;
use openlink::file_loader;
use openlink::session::PodSession;
use openlink::{bringup, server};

fn main() -> ExitCode {
    let opts = Opts::from_args();
    init_logging(opts.verbose);

    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }
    pretty_env_logger::init();
}

fn run(opts: &Opts) -> Result<()> {
    let mut session = PodSession::open(opts.verbose).context("opening BDM pod")?;
    let chip = bringup::run(&mut session).context("target bring-up")?;
    info!("identified target as {} rev {}", chip.part, chip.revision);

    let loader_path = cli::resolve_flashloader_path(opts);
    let loader_image = file_loader::load_flashloader(&loader_path)
        .with_context(|| format!("loading flashloader image from {}", loader_path.display()))?;

    let mut coordinator = DebugCoordinator::new(session, chip, loader_image);
    coordinator.seed_register_cache().context("seeding register cache")?;

    if opts.erase {
        return run_erase(&mut coordinator);
    }
    if let Some(file) = &opts.program {
        return run_program(&mut coordinator, file, opts.base, opts.verify);
    }
    run_gdb(&mut coordinator, opts.port)
}

fn run_erase(coordinator: &mut DebugCoordinator) -> Result<()> {
    info!("mass-erasing flash");
    coordinator.mass_erase().context("mass erase")?;
    info!("mass erase complete");
    Ok(())
}

fn run_program(
    coordinator: &mut DebugCoordinator,
    file: &std::path::Path,
    base: Option<u32>,
    verify: bool,
) -> Result<()> {
    let image = file_loader::load(file, base).with_context(|| format!("loading {}", file.display()))?;
    info!(
        "programming {} bytes at 0x{:08x}{}",
        image.bytes.len(),
        image.min_addr,
        if verify { " (with verify)" } else { "" }
    );
    coordinator
        .program_file(image.min_addr, &image.bytes, verify)
        .context("programming flash")?;
    info!("programming complete");
    Ok(())
}

fn run_gdb(coordinator: &mut DebugCoordinator, port: u16) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("shutdown requested, finishing current packet and closing sockets");
        handler_flag.store(false, Ordering::SeqCst);
    })
    .context("installing SIGINT/SIGTERM handler")?;

    server::run(coordinator, port, &running)
}
