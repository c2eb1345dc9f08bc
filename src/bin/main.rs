use std::{
    error::Error,
    fs::{self, File, OpenOptions},
    io::{self, IsTerminal},
    os::unix::io::IntoRawFd,
    path::Path,
};

use chrono::Utc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use syncbeat::{
    cli::{Cli, Commands, parse_args},
    config::load_config,
    daemon::{Daemon, StopOutcome, install_shutdown_handler},
    status::StatusReport,
};

fn main() {
    let args = parse_args();
    init_logging(&args);

    if let Err(err) = run(args) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(args: Cli) -> Result<(), Box<dyn Error>> {
    match args.command {
        Commands::Start { config, foreground } => {
            let settings = load_config(&config)?;
            let daemon = Daemon::new(settings);

            if let Some(record) = daemon.running() {
                warn!("syncbeat already running (PID {}); not starting another", record.pid);
                print!(
                    "{}",
                    StatusReport::collect(daemon.settings(), Utc::now())
                        .render(io::stdout().is_terminal(), Utc::now())
                );
                return Ok(());
            }

            daemon.register_autostart()?;

            if !foreground {
                let log_path = daemon.settings().supervisor_log_path();
                println!("syncbeat starting in the background; logging to {}", log_path.display());
                daemonize(&log_path)?;
            }

            let shutdown = install_shutdown_handler()?;
            if let Err(err) = daemon.run_foreground(&shutdown) {
                error!("syncbeat exited with error: {err}");
                return Err(err.into());
            }
        }
        Commands::Status {
            config,
            json,
            no_color,
        } => {
            let settings = load_config(&config)?;
            let now = Utc::now();
            let report = StatusReport::collect(&settings, now);
            if json {
                println!("{}", report.to_json()?);
            } else {
                let color = !no_color && io::stdout().is_terminal();
                print!("{}", report.render(color, now));
            }
        }
        Commands::Stop { config, purge } => {
            let settings = load_config(&config)?;
            let daemon = Daemon::new(settings);
            match daemon.stop(purge)? {
                StopOutcome::Stopped { pid } => {
                    info!("Stopped syncbeat daemon (PID {pid})");
                    println!("syncbeat stopped");
                }
                StopOutcome::AlreadyStopped => println!("syncbeat already stopped"),
            }
        }
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Once detached, stderr is the supervisor log file.
    let ansi = !args.detaches() && io::stderr().is_terminal();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(ansi)
        .try_init();
}

/// Double-forks into the background with stdout and stderr appended to `log_path`.
fn daemonize(log_path: &Path) -> io::Result<()> {
    if let Some(dir) = log_path.parent() {
        fs::create_dir_all(dir)?;
    }
    let log = OpenOptions::new().create(true).append(true).open(log_path)?;

    if unsafe { libc::fork() } > 0 {
        std::process::exit(0);
    }

    unsafe {
        libc::setsid();
    }

    if unsafe { libc::fork() } > 0 {
        std::process::exit(0);
    }

    std::env::set_current_dir("/")?;
    let devnull = File::open("/dev/null")?.into_raw_fd();
    let log_fd = log.into_raw_fd();
    unsafe {
        let _ = libc::dup2(devnull, libc::STDIN_FILENO);
        let _ = libc::dup2(log_fd, libc::STDOUT_FILENO);
        let _ = libc::dup2(log_fd, libc::STDERR_FILENO);
        libc::close(devnull);
        libc::close(log_fd);
    }

    Ok(())
}
