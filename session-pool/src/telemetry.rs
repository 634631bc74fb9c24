//! Tracing subscriber setup.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a stderr subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `SESSION_POOL_LOG` picks the level
/// for this crate (`debug`, `warn`, `error`; default `info`).
/// `LOG_FORMAT=json` switches to JSON lines. Calling this again is a no-op.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(filter_directive(std::env::var("SESSION_POOL_LOG").ok().as_deref()))
    };

    let use_json = json_format(std::env::var("LOG_FORMAT").ok().as_deref());
    let json = use_json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let plain = (!use_json).then(|| fmt::layer().with_writer(std::io::stderr));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .try_init();
}

fn json_format(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.trim().eq_ignore_ascii_case("json"))
}

fn filter_directive(level: Option<&str>) -> String {
    let level = match level {
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("session_pool={level}")
}
