use std::{env, process::ExitCode};

use getopts::Options;
use statsd_collector::{Config, StatsdBuilder};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "statsd.toml";

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

fn opts() -> Options {
    let mut opts = Options::new();

    opts.optopt(
        "c",
        "config",
        "path to the configuration file, also looked up under /etc when relative (default: statsd.toml)",
        "PATH",
    );
    opts.optflag("", "check", "validate the configuration and exit");
    opts.optflag("h", "help", "print this help menu");

    opts
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let program = args.first().map_or("statsd-server", String::as_str);
    let opts = opts();

    let matches = match opts.parse(args.iter().skip(1)) {
        Ok(m) => m,
        Err(e) => {
            error!("Failed to parse command line args: {}", e);
            print_usage(program, &opts);
            return ExitCode::FAILURE;
        }
    };

    if matches.opt_present("help") {
        print_usage(program, &opts);
        return ExitCode::SUCCESS;
    }

    let path = matches.opt_str("config").unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_owned());
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration.");
            return ExitCode::FAILURE;
        }
    };

    let builder = match StatsdBuilder::from_config(config) {
        Ok(builder) => builder,
        Err(e) => {
            error!(error = %e, "Invalid configuration.");
            return ExitCode::FAILURE;
        }
    };

    if matches.opt_present("check") {
        info!(path, "Configuration is valid.");
        return ExitCode::SUCCESS;
    }

    let mut statsd = match builder.build() {
        Ok(statsd) => statsd,
        Err(e) => {
            error!(error = %e, "Failed to build collector.");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = statsd.start_all() {
        error!(error = %e, "Failed to start collector.");
        statsd.stop_all();
        return ExitCode::FAILURE;
    }

    if let Some(addr) = statsd.receiver_addr() {
        info!(%addr, "Collector running, press Ctrl-C to stop.");
    } else {
        info!("Collector running in local mode, press Ctrl-C to stop.");
    }

    let status = match wait_for_shutdown() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signals.");
            ExitCode::FAILURE
        }
    };

    statsd.stop_all();
    status
}

fn wait_for_shutdown() -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

    runtime.block_on(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut terminate = signal(SignalKind::terminate())?;
            tokio::select! {
                result = tokio::signal::ctrl_c() => result?,
                _ = terminate.recv() => {}
            }
        }

        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await?;

        info!("Shutdown signal received.");
        Ok(())
    })
}
