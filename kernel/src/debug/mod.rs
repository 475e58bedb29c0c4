//! Diagnostics macros
//!
//! Kernel-wide logging goes through the `log` facade. The per-step walk and
//! dependency traces are compiled in only with the `debug-segwalk` and
//! `debug-depend` features.

/// Report an internal consistency violation and halt the kernel
///
/// Used only for corruption (e.g. a hazarded key found unprepared), never
/// for faults a user keeper can recover from.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => ({
        log::error!("kernel fatal: {}", format_args!($($arg)*));
        panic!("kernel fatal: {}", format_args!($($arg)*));
    });
}

/// Per-step segment walk trace
#[macro_export]
macro_rules! segwalk_trace {
    ($($arg:tt)*) => ({
        #[cfg(feature = "debug-segwalk")]
        log::trace!(target: "segwalk", $($arg)*);
    });
}

/// Dependency table trace
#[macro_export]
macro_rules! depend_trace {
    ($($arg:tt)*) => ({
        #[cfg(feature = "debug-depend")]
        log::trace!(target: "depend", $($arg)*);
    });
}
