use once_cell::sync::OnceCell;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Console tracing for host-side binaries, plus an optional rolling file.
pub fn init() {
    let registry = tracing_subscriber::registry().with(fmt::layer().with_filter(default_filter()));
    match rolling_layer() {
        Some(file_layer) => {
            let _ = registry.with(file_layer).try_init();
        }
        None => {
            let _ = registry.try_init();
        }
    }
}

/// Tracing for plugin processes. Stdout carries the frame protocol, so logs
/// go to stderr where the supervisor forwards them.
pub fn init_plugin() {
    let stderr_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_filter(default_filter());
    let registry = tracing_subscriber::registry().with(stderr_layer);
    match rolling_layer() {
        Some(file_layer) => {
            let _ = registry.with(file_layer).try_init();
        }
        None => {
            let _ = registry.try_init();
        }
    }
}

fn rolling_layer<S>() -> Option<Box<dyn Layer<S> + Send + Sync + 'static>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if std::env::var("PLEXUS_LOG_ROLL").ok().as_deref() != Some("1") {
        return None;
    }
    let dir = std::env::var("PLEXUS_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let prefix = std::env::var("PLEXUS_LOG_PREFIX").unwrap_or_else(|_| "plexus".into());
    let rotation = std::env::var("PLEXUS_LOG_ROTATION").unwrap_or_else(|_| "daily".into());
    if std::fs::create_dir_all(&dir).is_err() {
        tracing::warn!(directory = %dir, "failed to create log directory");
    }
    let writer = match rotation.to_lowercase().as_str() {
        "hourly" => tracing_appender::rolling::hourly(&dir, &prefix),
        "minutely" => tracing_appender::rolling::minutely(&dir, &prefix),
        _ => tracing_appender::rolling::daily(&dir, &prefix),
    };
    let (nb, guard) = tracing_appender::non_blocking(writer);
    let _ = FILE_GUARD.set(guard);
    Some(
        fmt::layer()
            .with_ansi(false)
            .with_writer(nb)
            .with_filter(default_filter())
            .boxed(),
    )
}
