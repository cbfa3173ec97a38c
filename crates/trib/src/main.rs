//! trib: command line front end.
//!
//! Every subcommand takes a seed `host:port`, discovers the cluster from it
//! and prints a report to stdout. Logs go to stderr.

use std::fmt::Display;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use trib::{ops, report, AdminError, NodeAddr, SignatureMode, TcpConnector, TribConfig};

#[derive(Parser)]
#[command(
    name = "trib",
    version,
    about = "check and repair sharded key-value clusters"
)]
struct Args {
    /// password sent with AUTH to every node
    #[arg(short = 'a', long, env = "TRIB_PASSWORD", global = true, hide_env_values = true)]
    password: Option<String>,

    /// read the password from a file instead
    #[arg(long, global = true)]
    password_file: Option<PathBuf>,

    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "TRIB_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// connect timeout per node, in milliseconds
    #[arg(long, global = true)]
    connect_timeout: Option<u64>,

    /// timeout per command, in milliseconds
    #[arg(long, global = true)]
    command_timeout: Option<u64>,

    /// how node views are compared when checking convergence
    #[arg(long, value_enum, global = true)]
    signature: Option<SignatureMode>,

    /// log debug details to stderr
    #[arg(short, long, env = "TRIB_VERBOSE", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// report slot coverage, open slots, replica and view problems
    Check {
        /// any node of the cluster, as host:port
        addr: String,
    },
    /// check, then repair what can be repaired safely
    Fix {
        addr: String,
        /// give up after this many milliseconds
        #[arg(long)]
        timeout: Option<u64>,
        /// give up after this many repair passes
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// keys, slots and replicas per master
    Info { addr: String },
    /// remove an empty node from the cluster and shut it down
    #[command(alias = "del")]
    DelNode { addr: String, node_id: String },
    /// run a command on every node
    Call {
        addr: String,
        /// command name followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.verbose { "trib=debug" } else { "trib=warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    if args.config_template {
        return match TribConfig::default().to_toml() {
            Ok(toml) => {
                print!("{toml}");
                ExitCode::SUCCESS
            }
            Err(e) => fail(format!("failed to generate config template: {e}")),
        };
    }

    let Some(command) = &args.command else {
        let _ = Args::command().print_help();
        return ExitCode::FAILURE;
    };

    let cfg = match build_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => return fail(e),
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => return fail(format!("failed to create runtime: {e}")),
    };
    match rt.block_on(run(command, &cfg)) {
        Ok(code) => code,
        Err(e) => fail(e),
    }
}

fn fail(msg: impl Display) -> ExitCode {
    eprintln!("{}", format!("error: {msg}").red());
    ExitCode::FAILURE
}

/// defaults → TOML file → env vars and flags
fn build_config(args: &Args) -> Result<TribConfig, AdminError> {
    let mut cfg = match &args.config {
        Some(path) => TribConfig::from_file(path)?,
        None => TribConfig::default(),
    };
    if let Some(password) = &args.password {
        cfg.password = password.clone();
    }
    if let Some(ms) = args.connect_timeout {
        cfg.connect_timeout_ms = ms;
    }
    if let Some(ms) = args.command_timeout {
        cfg.command_timeout_ms = ms;
    }
    if let Some(mode) = args.signature {
        cfg.signature = mode;
    }
    if let Some(path) = &args.password_file {
        cfg.load_password_file(path)?;
    }
    Ok(cfg)
}

async fn run(command: &Command, cfg: &TribConfig) -> Result<ExitCode, AdminError> {
    let connector = TcpConnector::new(cfg.connect_options());
    let per_node = Duration::from_millis(cfg.command_timeout_ms);

    let code = match command {
        Command::Check { addr } => {
            let seed: NodeAddr = addr.parse()?;
            let report = ops::check(&seed, &connector, cfg.signature).await?;
            print!("{}", report::render_check(&report));
            exit_code(report.is_clean())
        }
        Command::Fix {
            addr,
            timeout,
            max_attempts,
        } => {
            let seed: NodeAddr = addr.parse()?;
            let mut opts = cfg.repair_options();
            if let Some(ms) = timeout {
                opts.timeout = Duration::from_millis(*ms);
            }
            if let Some(n) = max_attempts {
                opts.max_attempts = *n;
            }
            let report = ops::fix(&seed, &connector, opts).await?;
            print!("{}", report::render_fix(&report));
            exit_code(report.outcome.is_done() && !report.outcome.needs_follow_up())
        }
        Command::Info { addr } => {
            let seed: NodeAddr = addr.parse()?;
            let report = ops::info(&seed, &connector, per_node).await?;
            print!("{}", report::render_info(&report));
            ExitCode::SUCCESS
        }
        Command::DelNode { addr, node_id } => {
            let seed: NodeAddr = addr.parse()?;
            let report = ops::del_node(&seed, &connector, node_id).await?;
            print!("{}", report::render_del_node(&report));
            ExitCode::SUCCESS
        }
        Command::Call { addr, args } => {
            let seed: NodeAddr = addr.parse()?;
            let report = ops::call(&seed, &connector, args, per_node).await?;
            print!("{}", report::render_call(&report));
            ExitCode::SUCCESS
        }
    };
    Ok(code)
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
