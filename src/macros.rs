/// Emits a per-read/per-write trace event if `trace-more` is enabled.
#[cfg(feature = "trace-more")]
macro_rules! trace {
    ($($arg:tt)+) => (::tracing::trace!(target: "httpconn::io", $($arg)+));
}
/// Emits a per-read/per-write trace event if `trace-more` is enabled.
///
/// Without the feature, the arguments are not even evaluated.
#[cfg(not(feature = "trace-more"))]
macro_rules! trace {
    ($($arg:tt)+) => {};
}
pub(crate) use trace;
