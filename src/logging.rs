//! Tracing subscriber setup for binaries and ad-hoc debugging.
//!
//! `NABLA_LOG` takes an `EnvFilter` directive (default `info`). With the
//! `trace` feature, `NABLA_TRACE=1` also writes a Chrome trace to
//! `trace.json`; keep the returned guard alive until exit so it is flushed.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "NABLA_LOG";

#[cfg(feature = "trace")]
pub type TraceGuard = tracing_chrome::FlushGuard;
#[cfg(not(feature = "trace"))]
pub type TraceGuard = ();

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Returns `None` if one was already set or
/// no trace file was requested.
pub fn init_tracing(default_level: &str) -> Option<TraceGuard> {
    let fmt = tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr);

    #[cfg(feature = "trace")]
    if std::env::var("NABLA_TRACE").ok().as_deref() == Some("1") {
        let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new().file("trace.json").build();
        let subscriber = tracing_subscriber::registry().with(filter(default_level)).with(fmt).with(chrome_layer);
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            return None;
        }
        return Some(guard);
    }

    let subscriber = tracing_subscriber::registry().with(filter(default_level)).with(fmt);
    let _ = tracing::subscriber::set_global_default(subscriber);
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let _ = init_tracing("warn");
        assert!(init_tracing("warn").is_none());
        tracing::info!("still logging");
    }
}
