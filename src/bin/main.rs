use std::{
    error::Error,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use nix::unistd::Uid;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wpkgd::{
    cli::{Cli, Commands, parse_args, verbosity_directive},
    config::load_config,
    error::BrokerError,
    executor::Executor,
    ipc,
    runtime::{self, RuntimeMode},
    server::ControlServer,
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    let euid = Uid::effective();

    let runtime_mode = if args.sys {
        if !euid.is_root() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "--sys requires root privileges",
            )
            .into());
        }
        RuntimeMode::System
    } else {
        RuntimeMode::User
    };
    runtime::init(runtime_mode);

    match &args.command {
        Commands::Serve { config } => {
            let config = Arc::new(load_config(config.as_deref())?);
            init_logging(&args, config.wpkg_verbosity);
            if euid.is_root() && runtime_mode == RuntimeMode::User {
                warn!("Running as root without --sys; state will be stored in userspace paths");
            }
            serve(config)?;
        }
        Commands::Execute { no_reboot, from_gpe } => {
            init_logging(&args, 1);
            let command = if *from_gpe {
                "ExecuteFromGPE"
            } else if *no_reboot {
                "ExecuteNoReboot"
            } else {
                "Execute"
            };
            run_client(command, args.debug)?;
        }
        Commands::Query => {
            init_logging(&args, 1);
            run_client("Query", args.debug)?;
        }
        Commands::Cancel => {
            init_logging(&args, 1);
            run_client("Cancel", args.debug)?;
        }
        Commands::SetNetworkUser { username, password } => {
            init_logging(&args, 1);
            run_client(&format!("SetNetworkUser {username} {password}"), args.debug)?;
        }
    }

    Ok(())
}

/// Runs the control daemon until a termination signal arrives.
fn serve(config: Arc<wpkgd::config::Config>) -> Result<(), BrokerError> {
    // Clear a stale marker from a crashed run before serving.
    config.set_running_state(false)?;

    let executor = Arc::new(Executor::with_defaults(Arc::clone(&config))?);
    let stop = Arc::new(AtomicBool::new(false));

    let stop_handle = Arc::clone(&stop);
    if let Err(err) = ctrlc::set_handler(move || {
        stop_handle.store(true, Ordering::SeqCst);
    }) {
        warn!("Failed to register the stop handler: {err}");
    }

    info!("Starting the wpkgd control daemon");
    let server = ControlServer::new(config, executor, stop);
    server.run()
}

/// Sends one command to the daemon and prints the returned frames. The
/// three-digit code prefix is stripped unless `--debug` is set.
fn run_client(command: &str, debug: bool) -> Result<(), BrokerError> {
    let socket = ipc::socket_path()?;
    let frames = match ipc::send_request(&socket, command) {
        Ok(frames) => frames,
        Err(err) => {
            eprintln!("wpkgd: {err}");
            std::process::exit(1);
        }
    };
    for frame in frames {
        if debug {
            println!("{frame}");
        } else {
            println!("{}", frame.payload);
        }
    }
    Ok(())
}

fn init_logging(args: &Cli, verbosity: u8) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(verbosity_directive(verbosity)))
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
