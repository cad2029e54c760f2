use std::path::PathBuf;

use clap::Parser;
use log::info;

use rustyinit::{conf, config, logging, platform, supervisor};

#[derive(Parser, Debug)]
#[command(name = "rustyinit", about = "A small process-1 supervisor")]
struct CliArgs {
    /// Path to the daemon config, default /etc/rustyinit.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the service drop-in directory
    #[arg(long)]
    confdir: Option<PathBuf>,

    /// Override the target runlevel
    #[arg(short, long)]
    runlevel: Option<u8>,

    #[arg(long)]
    debug: bool,

    /// Load and report configuration, then exit
    #[arg(long)]
    dry_run: bool,
}

fn main() {
    let args = CliArgs::parse();

    let mut config = config::load_config(args.config.as_deref());
    if let Some(confdir) = args.confdir {
        config.confdir = confdir;
    }

    let cmdline = std::fs::read_to_string("/proc/cmdline").unwrap_or_default();
    let opts = conf::parse_cmdline(&cmdline);
    let debug = args.debug || opts.debug;

    if let Err(e) = logging::setup_logging(&config.log_level, debug) {
        eprintln!("Could not set up logging: {e}");
    }

    if nix::unistd::getpid().as_raw() == 1 {
        platform::setup_pid1_stdio(&config.console);
    } else {
        // supervised development run: still collect our grandchildren
        platform::become_subreaper();
    }

    info!("rustyinit {} coming up", env!("CARGO_PKG_VERSION"));

    let mut sup = supervisor::Supervisor::new(config);
    sup.debug = debug;
    sup.cmdlevel = args.runlevel.or(opts.cmdlevel);

    if args.dry_run {
        sup.load_services();
        info!("Loaded {} service(s), exiting (--dry-run)", sup.registry.len());
        return;
    }

    supervisor::run(sup)
}
