//! Routing of native backend log output into [`tracing`].

#[cfg(not(feature = "native_verbosity"))]
use tracing::info;
#[cfg(feature = "native_verbosity")]
use tracing::trace;
use tracing::{debug, error, warn};

/// The severity of a native log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NativeLogLevel {
    /// Debug output.
    Debug,
    /// Informational output.
    Info,
    /// A warning.
    Warn,
    /// An error.
    Error,
}

/// Forwards one line of native log output to [`tracing`] under the `native` target.
///
/// Backends should call this from whatever log hook their native library exposes. With the
/// `native_verbosity` feature enabled, debug and info output is demoted one level.
pub fn forward_native_log(level: NativeLogLevel, text: &str) {
    // native loggers emit lone newlines and dots as progress output
    if text.len() < 2 {
        return;
    }

    let text = text.strip_suffix('\n').unwrap_or(text);

    match level {
        #[cfg(feature = "native_verbosity")]
        NativeLogLevel::Debug => trace!(target: "native", "{text}"),
        #[cfg(feature = "native_verbosity")]
        NativeLogLevel::Info => debug!(target: "native", "{text}"),
        #[cfg(not(feature = "native_verbosity"))]
        NativeLogLevel::Debug => debug!(target: "native", "{text}"),
        #[cfg(not(feature = "native_verbosity"))]
        NativeLogLevel::Info => info!(target: "native", "{text}"),
        NativeLogLevel::Warn => warn!(target: "native", "{text}"),
        NativeLogLevel::Error => error!(target: "native", "{text}"),
    }
}
