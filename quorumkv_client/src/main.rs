//! QuorumKV interactive client executable.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;

use tokio::runtime::Builder;

use quorumkv::{
    logger_init, logger_set_me, pf_error, pf_warn, ClientId, QuorumConfig,
    QuorumKvError, QuorumTable,
};

mod repl;

use crate::repl::ClientRepl;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Client ID, folded into every timestamp this client assigns.
    /// Must be below 1000.
    #[arg(short, long, default_value_t = 0)]
    id: ClientId,

    /// Comma-separated list of table server addresses, e.g.,
    /// '127.0.0.1:52700,127.0.0.1:52701,127.0.0.1:52702'.
    #[arg(short, long)]
    servers: String,

    /// Client configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(servers)` on success
    /// or `Err(QuorumKvError)` on any error.
    fn sanitize(&self) -> Result<Vec<SocketAddr>, QuorumKvError> {
        if self.id >= 1000 {
            return Err(QuorumKvError::msg(format!(
                "invalid client ID {}",
                self.id
            )));
        }
        if self.threads < 2 {
            return Err(QuorumKvError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }

        let mut servers = Vec::new();
        let mut seen = HashSet::new();
        for s in self.servers.split(',').map(str::trim) {
            if s.is_empty() {
                continue;
            }
            let addr: SocketAddr = s.parse()?;
            if !seen.insert(addr) {
                return Err(QuorumKvError::msg(format!(
                    "duplicate server address {} given",
                    addr
                )));
            }
            servers.push(addr);
        }
        if servers.is_empty() {
            return Err(QuorumKvError::msg("no server addresses given"));
        }
        Ok(servers)
    }
}

/// Actual main function of QuorumKV client executable.
fn client_main() -> Result<(), QuorumKvError> {
    // read in and parse command line arguments
    let mut args = CliArgs::parse();
    let servers = args.sanitize()?;
    logger_set_me(format!("c{}", args.id));

    // parse optional config string if given
    let config_str = if args.config.is_empty() {
        None
    } else {
        args.config = args.config.replace('+', "\n");
        Some(&args.config[..])
    };
    let config = QuorumConfig::parse(config_str)?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-client")
        .build()?;

    // enter tokio runtime, connect to the replicas, and run the REPL loop
    runtime.block_on(async move {
        let table = QuorumTable::connect(&servers, args.id, &config).await?;
        let mut repl = ClientRepl::new(table);
        repl.run().await?;

        Ok::<(), QuorumKvError>(()) // give type hint for this async closure
    })
}

/// Main function of QuorumKV client executable.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        pf_warn!("client_main exited successfully");
        ExitCode::SUCCESS
    }
}
