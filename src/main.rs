use anyhow::{Context, Result};
use clap::Parser;
use confique::Config as _;
use log::{error, info, LevelFilter};
use scope_daq::{fetch, open_scope, run_file_name, CancellationToken, CaptureOptions, Conf};
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

#[derive(Parser, Debug)]
#[command(version, about = "Capture oscilloscope waveforms to HDF5")]
struct Args {
    /// Output file; `<stem>_<NN>` is appended per run when more than one run
    output: PathBuf,

    #[arg(short, long, default_value = "scope.toml")]
    config: PathBuf,

    /// Events per run (overrides run_settings.events)
    #[arg(short = 'n', long)]
    events: Option<usize>,

    /// Number of runs (overrides run_settings.runs)
    #[arg(short, long)]
    runs: Option<usize>,
}

static CANCEL: OnceLock<CancellationToken> = OnceLock::new();

extern "C" fn on_sigint(_: libc::c_int) {
    if let Some(token) = CANCEL.get() {
        token.cancel();
    }
}

fn install_sigint(token: CancellationToken) {
    let _ = CANCEL.set(token);
    let handler = on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
    }
}

fn init_logging(log_file: Option<&str>) -> Result<()> {
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        LevelFilter::Info,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {path}"))?;
        loggers.push(WriteLogger::new(LevelFilter::Debug, Config::default(), file));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let conf = Conf::builder()
        .env()
        .file(&args.config)
        .load()
        .with_context(|| format!("loading {}", args.config.display()))?;
    init_logging(conf.run_settings.log_file.as_deref())?;

    let events = args.events.unwrap_or(conf.run_settings.events);
    let runs = args.runs.unwrap_or(conf.run_settings.runs).max(1);
    let options = CaptureOptions::from(&conf.run_settings);

    let cancel = CancellationToken::new();
    install_sigint(cancel.clone());

    for run in 0..runs {
        let path = run_file_name(&args.output, run, runs);
        info!("run {}/{} -> {}", run + 1, runs, path.display());

        let mut scope = open_scope(&conf.scope_settings)
            .with_context(|| format!("connecting to {}", conf.scope_settings.host))?;
        let result = fetch(scope.as_mut(), &path, events, &options, &cancel);
        scope.close();

        match result {
            Ok(summary) if summary.cancelled => {
                info!("stopped early, {} events kept", summary.events_written);
                break;
            }
            Ok(summary) => info!(
                "run {} done: {} events, {} retries",
                run + 1,
                summary.events_written,
                summary.retries
            ),
            Err(e) => {
                error!("run {} failed: {e}", run + 1);
                return Err(e).with_context(|| format!("capturing {}", path.display()));
            }
        }
    }
    Ok(())
}
