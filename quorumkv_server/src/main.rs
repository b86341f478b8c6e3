//! QuorumKV table server executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use quorumkv::{
    logger_init, logger_set_me, pf_error, pf_warn, QuorumKvError, ReplicaId,
    ServerConfig, TableServer,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening socket.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Client-facing API port.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 52700)]
    port: u16,

    /// Number of bucket lists of the local store; overrides `n_lists` in
    /// the config string if given.
    #[arg(short, long)]
    n_lists: Option<usize>,

    /// Path prefix of the persistence files ('<name>.log' etc.).
    #[arg(long)]
    name: String,

    /// Server ID, used as logging prefix.
    #[arg(short, long, default_value_t = 0)]
    id: ReplicaId,

    /// Server configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Remove previously persisted files before starting.
    #[arg(long, default_value_t = false)]
    fresh: bool,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(QuorumKvError)` on any error.
    fn sanitize(&self) -> Result<(), QuorumKvError> {
        if self.port <= 1024 {
            Err(QuorumKvError::msg(format!("invalid port {}", self.port)))
        } else if self.n_lists == Some(0) {
            Err(QuorumKvError::msg("invalid number of lists 0"))
        } else if self.name.is_empty() {
            Err(QuorumKvError::msg("empty persistence name"))
        } else if self.threads < 2 {
            Err(QuorumKvError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Applies command line flags that take precedence over the config string.
fn with_flag_overrides(
    mut config: ServerConfig,
    args: &CliArgs,
) -> ServerConfig {
    if let Some(n_lists) = args.n_lists {
        config.n_lists = n_lists;
    }
    config
}

/// Actual main function of QuorumKV server executable.
fn server_main() -> Result<(), QuorumKvError> {
    // read in and parse command line arguments
    let mut args = CliArgs::parse();
    args.sanitize()?;
    logger_set_me(format!("s{}", args.id));

    // parse optional config string if given, then apply flag overrides
    let config_str = if args.config.is_empty() {
        None
    } else {
        args.config = args.config.replace('+', "\n");
        Some(&args.config[..])
    };
    let config =
        with_flag_overrides(ServerConfig::parse(config_str)?, &args);

    let api_addr = SocketAddr::new(args.bind_ip.into(), args.port);

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-server")
            .build()?;

        // enter tokio runtime, setup the server, and start the main event
        // loop logic
        runtime.block_on(async move {
            let mut server = TableServer::new_and_setup(
                args.id, api_addr, &args.name, config, args.fresh,
            )
            .await?;

            server.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), QuorumKvError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of QuorumKV server executable.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        pf_warn!("server_main exited successfully");
        ExitCode::SUCCESS
    }
}
