use anyhow::{ Context, Result };
use std::sync::atomic::{ AtomicBool, Ordering };
use tracing_log::LogTracer;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

pub struct LogInitializer;

impl LogInitializer {
    /// Install the global subscriber once; later calls are no-ops so
    /// embedders and tests can both call it freely.
    pub fn init() {
        if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = Self::configure() {
            eprintln!("failed to initialize logging: {err}");
        }
    }

    fn configure() -> Result<()> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let stdout_sub = fmt::Layer::new().with_writer(std::io::stdout).with_ansi(true);

        let collector = tracing_subscriber::registry().with(filter).with(stdout_sub);
        LogTracer::init().context("Set logger")?;
        tracing::subscriber::set_global_default(collector).context("Set tracing subscriber")
    }
}
