//! mpih command-line interface
//!
//! One binary, subcommand per operation. `init` runs the per-rank daemon;
//! everything else is a short-lived client of the local daemon's Unix
//! socket. `run` wraps the whole lifecycle: spawn a daemon, export the
//! `MPIH_*` environment, execute the user script, finalize.

use std::error::Error;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Command;
use std::rc::Rc;

use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::info;

use mpih::client;
use mpih::config::{self, DaemonConfig, LogTarget, Tuning};
use mpih::constants::{ENV_LOG, ENV_PIDFILE, ENV_RANK, ENV_SIZE, ENV_SOCKET};
use mpih::daemon::Daemon;
use mpih::logging;
use mpih::process::{self, DaemonLaunch, Fork};
use mpih::transport::{Transport, TransportError};

/// Message passing for shell scripts on HPC clusters
#[derive(Parser, Debug)]
#[command(name = "mpih", version)]
#[command(about = "Message passing for shell scripts on HPC clusters")]
struct Cli {
    /// Unix socket of the local daemon (default: $MPIH_SOCKET)
    #[arg(short = 's', long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Show progress messages (repeat for more detail)
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Initialize this rank and start the daemon
    Init(InitArgs),

    /// Run a script with a daemon and the MPIH_* environment set up
    Run {
        /// Script to execute
        script: PathBuf,
        /// Arguments passed through to the script
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<OsString>,
    },

    /// Stream data to a rank (from files, or stdin if none given)
    Send {
        /// Destination rank
        rank: i32,
        /// Input files, streamed in order
        files: Vec<PathBuf>,
    },

    /// Stream data from a rank to stdout
    Recv {
        /// Source rank
        rank: i32,
    },

    /// Print the rank of the current process
    Rank,

    /// Print the number of ranks in the current job
    Size,

    /// Shut down the daemon for this rank
    Finalize,

    /// Print version information
    Version,
}

#[derive(Args, Debug)]
struct InitArgs {
    /// Log destination: a file path, or `-` for stdout (with --foreground)
    #[arg(long, value_name = "PATH")]
    log: Option<String>,

    /// Readiness/pid file, written once the socket is bound
    /// (default: $MPIH_PIDFILE)
    #[arg(long, value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Do not fork into the background
    #[arg(long)]
    foreground: bool,

    /// TOML file with daemon tuning overrides
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("mpih: {}", e);
            std::process::exit(1);
        }
    }
}

fn dispatch(cli: Cli) -> Result<i32, Box<dyn Error>> {
    match cli.command {
        Cmd::Init(args) => cmd_init(cli.socket, cli.verbose, args).map(|_| 0),
        Cmd::Run { script, args } => cmd_run(cli.verbose, script, args),
        Cmd::Send { rank, files } => cmd_send(cli.socket, cli.verbose, rank, files).map(|_| 0),
        Cmd::Recv { rank } => cmd_recv(cli.socket, cli.verbose, rank).map(|_| 0),
        Cmd::Rank => cmd_query(cli.socket, cli.verbose, client::query_rank).map(|_| 0),
        Cmd::Size => cmd_query(cli.socket, cli.verbose, client::query_size).map(|_| 0),
        Cmd::Finalize => cmd_finalize(cli.socket, cli.verbose).map(|_| 0),
        Cmd::Version => {
            println!("mpih {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}

fn resolve_socket(flag: Option<PathBuf>) -> Result<PathBuf, config::ConfigError> {
    config::resolve_socket(flag, std::env::var_os(ENV_SOCKET))
}

// ---- daemon ---------------------------------------------------------------

fn cmd_init(
    socket_flag: Option<PathBuf>,
    verbose: u8,
    args: InitArgs,
) -> Result<(), Box<dyn Error>> {
    let socket_path = resolve_socket(socket_flag)?;
    let pid_file = config::resolve_optional(args.pid_file, std::env::var_os(ENV_PIDFILE));
    let tuning = match &args.config {
        Some(path) => Tuning::from_file(path)?,
        None => Tuning::default(),
    };
    let log = LogTarget::resolve(args.log.as_deref(), args.foreground);

    let config = DaemonConfig {
        socket_path,
        log,
        pid_file,
        foreground: args.foreground,
        verbose,
        tuning,
    };
    config.validate()?;

    if !config.foreground {
        if let Fork::Parent { .. } = process::background()? {
            return Ok(());
        }
    }

    let transport = create_transport()?;
    logging::init_daemon(&config.log, config.verbose, transport.rank())?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();

    let daemon = Daemon::new(config, transport)?;
    local.block_on(&rt, daemon.run())?;
    Ok(())
}

#[cfg(feature = "mpi")]
fn create_transport() -> Result<Rc<dyn Transport>, TransportError> {
    Ok(Rc::new(mpih::transport::MpiTransport::new()?))
}

#[cfg(not(feature = "mpi"))]
fn create_transport() -> Result<Rc<dyn Transport>, TransportError> {
    // built without MPI support: the job is this single rank
    Ok(Rc::new(mpih::transport::LoopbackFabric::new(1).transport(0)))
}

// ---- wrapper --------------------------------------------------------------

fn cmd_run(
    verbose: u8,
    script: PathBuf,
    args: Vec<OsString>,
) -> Result<i32, Box<dyn Error>> {
    logging::init_client(verbose);

    // private scratch dir for the daemon's socket, log and pid file;
    // removed once the job is done
    let dir = tempfile::Builder::new().prefix("mpih.").tempdir()?;
    let socket = dir.path().join("socket");
    let log = dir.path().join("log");
    let pid_file = dir.path().join("pid");

    let mut daemon = process::spawn_daemon(&DaemonLaunch {
        socket: socket.clone(),
        log: Some(log.clone()),
        pid_file,
        verbose: verbose.max(1),
    })?;

    let rank = client::query_rank(&socket)?;
    let size = client::query_size(&socket)?;
    info!("daemon ready, rank {}/{}", rank, size);

    let status = Command::new(&script)
        .args(&args)
        .env(ENV_SOCKET, &socket)
        .env(ENV_LOG, &log)
        .env(ENV_RANK, rank.to_string())
        .env(ENV_SIZE, size.to_string())
        .status();

    // shut the daemon down whether or not the script could be run
    let finalize_result = client::finalize(&socket);
    let _ = daemon.wait();
    let status = status?;
    finalize_result?;

    let code = match status.code() {
        Some(code) => code,
        // 128 + signal distinguishes signals from exit codes
        None => 128 + status.signal().unwrap_or(0),
    };
    Ok(code)
}

// ---- clients --------------------------------------------------------------

fn cmd_send(
    socket_flag: Option<PathBuf>,
    verbose: u8,
    rank: i32,
    files: Vec<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    logging::init_client(verbose);
    let socket = resolve_socket(socket_flag)?;

    let mut reader: Box<dyn Read> = if files.is_empty() {
        Box::new(io::stdin().lock())
    } else {
        let mut chained: Box<dyn Read> = Box::new(io::empty());
        for path in &files {
            let file = File::open(path)
                .map_err(|e| format!("`{}': {}", path.display(), e))?;
            chained = Box::new(chained.chain(file));
        }
        chained
    };

    client::send_stream(&socket, rank, &mut reader)?;
    Ok(())
}

fn cmd_recv(
    socket_flag: Option<PathBuf>,
    verbose: u8,
    rank: i32,
) -> Result<(), Box<dyn Error>> {
    logging::init_client(verbose);
    let socket = resolve_socket(socket_flag)?;

    let mut stdout = io::stdout().lock();
    client::recv_stream(&socket, rank, &mut stdout)?;
    Ok(())
}

fn cmd_query(
    socket_flag: Option<PathBuf>,
    verbose: u8,
    query: fn(&std::path::Path) -> Result<i32, client::ClientError>,
) -> Result<(), Box<dyn Error>> {
    logging::init_client(verbose);
    let socket = resolve_socket(socket_flag)?;
    println!("{}", query(&socket)?);
    Ok(())
}

fn cmd_finalize(socket_flag: Option<PathBuf>, verbose: u8) -> Result<(), Box<dyn Error>> {
    logging::init_client(verbose);
    let socket = resolve_socket(socket_flag)?;
    client::finalize(&socket)?;
    Ok(())
}
