// Scale a physical value linearly onto an unsigned word spanning
// `[min, max]`, clamping at both ends.
macro_rules! scaled {
    ($val:expr, $min:expr, $max:expr, $full:expr) => {
        match ((($val - $min) / ($max - $min)) * ($full as f64)).floor() {
            c if c < 0.0 => 0,
            c if c > ($full as f64) => $full,
            c => c as _
        }
    };
}

// Dump low-level link traffic when built with `debug_packets`
macro_rules! pktdbg {
    ($($arg:tt)*) => {
        if cfg!(feature="debug_packets") {
            tracing::trace!(target: "libpulser::packets", $($arg)*);
        }
    };
}
