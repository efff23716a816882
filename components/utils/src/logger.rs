use snafu::{ResultExt, Whatever};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;

/// Initialize logging to stderr.
///
/// Logging is configured using either `default_log_level` or
/// `RUST_LOG` environment variable as default log level.
pub fn init_tracing_and_logging(
    service_name: &str,
    default_log_level: &str,
) -> Result<(), Whatever> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_log_level))
        .with_whatever_context(|e| format!("invalid log level {default_log_level:?}: {e}"))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_thread_names(true)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .with_whatever_context(|e| format!("failed to install subscriber: {e}"))?;
    tracing::info!(service = service_name, "logging started");

    replace_panic_hook_with_tracing_panic_hook().forget();

    Ok(())
}

/// Install a pretty printing subscriber for tests.
///
/// Safe to call from every test: only the first call installs anything.
pub fn install_fmt_log() {
    let stdout_log = tracing_subscriber::fmt::layer().pretty().with_test_writer();
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new("debug"))
        .with(stdout_log)
        .try_init();
}

/// Route panics through tracing.
///
/// When the returned guard is dropped the default hook is restored, so
/// long lived binaries call [`TracingPanicHookGuard::forget`].
#[must_use]
pub fn replace_panic_hook_with_tracing_panic_hook() -> TracingPanicHookGuard {
    std::panic::set_hook(Box::new(tracing_panic_hook));
    TracingPanicHookGuard { act: true }
}

/// Drop guard which restores the std panic hook on drop.
pub struct TracingPanicHookGuard {
    act: bool,
}

impl TracingPanicHookGuard {
    /// Make this hook guard not do anything when dropped.
    pub fn forget(&mut self) { self.act = false; }
}

impl Drop for TracingPanicHookGuard {
    fn drop(&mut self) {
        if self.act {
            let _ = std::panic::take_hook();
        }
    }
}

fn tracing_panic_hook(info: &std::panic::PanicInfo) {
    let msg = match info.payload().downcast_ref::<&'static str>() {
        Some(s) => *s,
        None => match info.payload().downcast_ref::<String>() {
            Some(s) => s.as_str(),
            None => "Box<dyn Any>",
        },
    };
    let thread = std::thread::current();
    let thread = thread.name().unwrap_or("<unnamed>");
    let location = info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_default();
    let backtrace = std::backtrace::Backtrace::capture();

    if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
        tracing::error!(%thread, %location, "{msg}\n\nStack backtrace:\n{backtrace}");
    } else {
        tracing::error!(%thread, %location, "{msg}");
    }

    // nobody is listening, fall back to stderr.
    tracing::dispatcher::get_default(|d| {
        if d.is::<tracing::subscriber::NoSubscriber>() {
            eprintln!("thread '{thread}' panicked at '{msg}', {location}");
        }
    });
}
