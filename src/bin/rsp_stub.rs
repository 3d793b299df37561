use std::fs::OpenOptions;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use clap_num::maybe_hex;

use riscv_dm_rsp_stub::libs::backend::{Backend, PollingBudget};
use riscv_dm_rsp_stub::libs::config::{Config, DmiSelector, DEFAULT_LISTEN};
use riscv_dm_rsp_stub::libs::dmi::{DmiTransport, MockDmi, TcpDmi};
use riscv_dm_rsp_stub::libs::elf_loader;
use riscv_dm_rsp_stub::libs::rsp_server::accept_loop;

/// Command-line surface for the RISC-V Debug Module / RSP bridge, §6.1.
#[derive(Parser, Debug)]
#[command(
    about = "Bridge a GDB Remote Serial Protocol client to a RISC-V Debug Module over DMI.",
    long_about = None,
    after_help = "Example usage: rsp-stub --dmi mock --listen 127.0.0.1:12727"
)]
struct Cli {
    #[arg(long = "listen", default_value = DEFAULT_LISTEN)]
    listen: String,

    #[arg(long = "dmi", default_value = "mock")]
    dmi: DmiSelector,

    #[arg(long = "xlen", default_value_t = 32, value_parser = maybe_hex::<u32>)]
    xlen: u32,

    #[arg(long = "elf")]
    elf: Option<PathBuf>,

    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,

    #[arg(long = "verbosity", default_value_t = 0)]
    verbosity: u8,

    #[arg(long = "busy-poll-sleep-us", value_parser = maybe_hex::<u64>)]
    busy_poll_sleep_us: Option<u64>,

    #[arg(long = "busy-poll-deadline-iters", value_parser = maybe_hex::<u32>)]
    busy_poll_deadline_iters: Option<u32>,

    #[arg(long = "resume-settle-delay-us", value_parser = maybe_hex::<u64>)]
    resume_settle_delay_us: Option<u64>,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Config {
            listen: cli.listen,
            dmi: cli.dmi,
            xlen: cli.xlen,
            elf: cli.elf,
            log_file: cli.log_file,
            verbosity: cli.verbosity,
            budget: Config::polling_budget(
                cli.busy_poll_sleep_us,
                cli.busy_poll_deadline_iters,
                cli.resume_settle_delay_us,
            ),
        }
    }
}

fn init_tracing(log_file: &Option<PathBuf>) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .expect("failed to open log file");
            builder.with_writer(move || file.try_clone().expect("failed to clone log file handle")).init();
        }
        None => builder.init(),
    }
}

fn run_with_backend<T: DmiTransport>(
    mut backend: Backend<T>,
    config: &Config,
    running: Arc<AtomicBool>,
) {
    backend.init().expect("back end init never fails");

    if let Some(path) = &config.elf {
        match elf_loader::load_file(&mut backend, path) {
            Ok(image) => tracing::info!(min=?image.min_addr, max=?image.max_addr, "ELF preloaded"),
            Err(e) => {
                tracing::error!(error = %e, "ELF preload failed");
                return;
            }
        }
    }

    if config.verbosity > 0 {
        if let Err(e) = backend.set_verbosity(config.verbosity as u32) {
            tracing::warn!(error = %e, "failed to set initial verbosity");
        }
    }

    let listener = match TcpListener::bind(&config.listen) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %config.listen, "failed to bind listen address");
            return;
        }
    };
    tracing::info!(addr = %config.listen, "listening");

    if let Err(e) = accept_loop(
        &listener,
        &mut backend,
        config.xlen,
        config.budget.busy_poll_deadline_iters,
        &running,
    ) {
        tracing::error!(error = %e, "accept loop ended with an error");
    }
}

fn main() {
    let cli = Cli::parse();
    let config: Config = cli.into();

    init_tracing(&config.log_file);

    let running = Arc::new(AtomicBool::new(true));
    ctrlc::set_handler({
        let running = running.clone();
        move || {
            tracing::info!("Keyboard interrupt received (ctrl+C), exiting");
            running.store(false, Ordering::SeqCst);
        }
    })
    .expect("error setting Ctrl-C handler");

    match &config.dmi {
        DmiSelector::Mock => {
            let backend = Backend::new(MockDmi::new(), config.xlen, config.budget);
            run_with_backend(backend, &config, running);
        }
        DmiSelector::Tcp(host_port) => match TcpDmi::connect(host_port) {
            Ok(dmi) => {
                let backend = Backend::new(dmi, config.xlen, config.budget);
                run_with_backend(backend, &config, running);
            }
            Err(e) => {
                tracing::error!(error = %e, endpoint = %host_port, "failed to connect to DMI proxy");
            }
        },
    }
}
