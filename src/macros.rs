#![allow(unused_macros)]

// Crate-internal logging front. Arguments must be references or `Copy`
// values: with `tracing` disabled they are still evaluated as a tuple.

macro_rules! trace {
    ($($t:tt)*) => {
        emit!(trace, $($t)*)
    }
}

macro_rules! debug {
    ($($t:tt)*) => {
        emit!(debug, $($t)*)
    }
}

macro_rules! info {
    ($($t:tt)*) => {
        emit!(info, $($t)*)
    }
}

macro_rules! warn {
    ($($t:tt)*) => {
        emit!(warn, $($t)*)
    }
}

macro_rules! error {
    ($($t:tt)*) => {
        emit!(error, $($t)*)
    }
}

macro_rules! emit {
    ($level: ident, $($t:tt)*) => {{
        #[cfg(feature = "tracing")]
        tracing::$level!(target: "rswidevine_policy", $($t)*);
        #[cfg(not(feature = "tracing"))]
        { if false { let _ = ( $($t)* ); } };
    }}
}
