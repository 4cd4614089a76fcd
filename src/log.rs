//! Thin wrappers over `tracing` so events compile away without the `logging` feature.
//!
//! A heap installed as the global allocator must not hand control to a subscriber that
//! allocates, so builds that do that disable the feature.

macro_rules! log_trace {
  ($($arg:tt)*) => {
    #[cfg(feature = "logging")]
    {
      tracing::trace!($($arg)*);
    }
  };
}

macro_rules! log_debug {
  ($($arg:tt)*) => {
    #[cfg(feature = "logging")]
    {
      tracing::debug!($($arg)*);
    }
  };
}

macro_rules! log_warn {
  ($($arg:tt)*) => {
    #[cfg(feature = "logging")]
    {
      tracing::warn!($($arg)*);
    }
  };
}

macro_rules! log_error {
  ($($arg:tt)*) => {
    #[cfg(feature = "logging")]
    {
      tracing::error!($($arg)*);
    }
  };
}

pub(crate) use {log_debug, log_error, log_trace, log_warn};
