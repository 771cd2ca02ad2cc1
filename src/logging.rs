//! Log records gated on the heap's `logging` switch.

/// `heap_log!(heap, debug, "...", args)` forwards to `log::debug!` unless the
/// heap was configured with logging off.
macro_rules! heap_log {
  ($heap:expr, $level:ident, $($arg:tt)+) => {
    if $heap.config.logging {
      log::$level!($($arg)+);
    }
  };
}
