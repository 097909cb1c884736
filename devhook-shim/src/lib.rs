//! Hook library loaded into the host process.
//!
//! On Windows the library is injected as a DLL and rewrites the host
//! executable's import table; on Linux it is preloaded and exports the
//! libc entry points itself. Either way the first bootstrap call loads the
//! configuration, builds the handler chain and publishes the dispatcher
//! every intercepted call consults.

use anyhow::{Context, Result};
use devhook::{Config, Dispatcher, InitGuard, InitOutcome, InterfaceRegistry, Runtime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, reload};

#[cfg(windows)]
mod setupapi;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod win32;

#[cfg(unix)]
use unix as platform;
#[cfg(windows)]
use win32 as platform;

/// Filter directive that takes precedence over `RUST_LOG`.
pub const LOG_ENV: &str = "DEVHOOK_LOG";

static INIT: InitGuard = InitGuard::new();
static DISPATCHER: OnceLock<Dispatcher<platform::Device>> = OnceLock::new();
static RUNTIME: OnceLock<Runtime> = OnceLock::new();
static INTERFACES: OnceLock<InterfaceRegistry> = OnceLock::new();

static LOG_RELOAD: OnceLock<reload::Handle<EnvFilter, fmt::Formatter>> = OnceLock::new();
static FILTER_FROM_ENV: AtomicBool = AtomicBool::new(false);

// Runs at load time; only the attach hook is installed here
#[ctor::ctor]
fn init_shim() {
    init_logging();

    info!("devhook shim loaded (pid {})", std::process::id());

    if let Err(e) = platform::attach() {
        fatal(e.context("Failed to attach"));
    }
}

fn init_logging() {
    let from_env = std::env::var(LOG_ENV)
        .ok()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok());
    FILTER_FROM_ENV.store(from_env.is_some(), Ordering::Release);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(from_env.unwrap_or_else(|| EnvFilter::new("warn")))
        .with_target(false)
        .with_filter_reloading();
    let handle = builder.reload_handle();

    // The host may already have a subscriber of its own.
    if builder.try_init().is_ok() {
        let _ = LOG_RELOAD.set(handle);
    }
}

/// The config file's filter only applies when the environment set none.
fn apply_config_filter(config: &Config) {
    if FILTER_FROM_ENV.load(Ordering::Acquire) {
        return;
    }
    let (Some(directive), Some(handle)) = (config.log.filter.as_deref(), LOG_RELOAD.get()) else {
        return;
    };

    match EnvFilter::try_new(directive) {
        Ok(filter) => {
            if let Err(e) = handle.reload(filter) {
                warn!("Cannot apply log filter {:?}: {}", directive, e);
            }
        }
        Err(e) => warn!("Ignoring invalid log filter {:?}: {}", directive, e),
    }
}

/// Log and terminate. Used for every condition the host cannot survive.
fn fatal(e: anyhow::Error) -> ! {
    error!("devhook: {:#}", e);
    std::process::exit(1);
}

/// The dispatcher, once bootstrap has published it.
pub(crate) fn dispatcher() -> Option<&'static Dispatcher<platform::Device>> {
    DISPATCHER.get()
}

/// Emulated device interfaces, once bootstrap has published them.
#[cfg(windows)]
pub(crate) fn interfaces() -> Option<&'static InterfaceRegistry> {
    INTERFACES.get()
}

/// Run the heavy initialization exactly once. Other threads arriving while
/// it runs block until it is done; re-entrant calls made by the bootstrap
/// itself return immediately.
pub(crate) fn bootstrap() {
    let (outcome, _) = INIT.run_once(|| {
        info!("--- Begin devhook bootstrap ---");
        if let Err(e) = start() {
            fatal(e);
        }
        info!("--- End devhook bootstrap ---");
    });

    match outcome {
        InitOutcome::InProgress => debug!("Re-entrant call during bootstrap"),
        InitOutcome::Waited => debug!("Bootstrap finished on another thread"),
        InitOutcome::Ran | InitOutcome::AlreadyReady => {}
    }
}

/// Everything the hooks consult is published before the hooks that consult
/// it are installed.
fn start() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    apply_config_filter(&config);

    let runtime = Runtime::new(config)?;
    runtime.check_network();

    let handlers = runtime.handlers(runtime.io_backend()?);
    let device = platform::Device::new()?;

    if DISPATCHER.set(Dispatcher::new(device, handlers)).is_err() {
        anyhow::bail!("Dispatcher already published");
    }
    if INTERFACES
        .set(InterfaceRegistry::new(runtime.device_interfaces()))
        .is_err()
    {
        anyhow::bail!("Device interfaces already published");
    }
    if RUNTIME.set(runtime).is_err() {
        anyhow::bail!("Runtime already published");
    }

    platform::install_io_redirections()
}
