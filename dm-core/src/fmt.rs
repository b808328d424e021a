//! Logging shims.
//!
//! Statements route to `defmt` when the `defmt` feature is enabled and to
//! stdout when only `std` is enabled. With neither feature the arguments are
//! still evaluated by reference so call sites stay warning-free.

#![allow(unused_macros)]

macro_rules! info {
    ($s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            ::defmt::info!($s $(, $x)*);
            #[cfg(all(feature = "std", not(feature = "defmt")))]
            ::std::println!(concat!("dm: ", $s) $(, $x)*);
            #[cfg(not(any(feature = "std", feature = "defmt")))]
            let _ = ($( & $x ),*);
        }
    };
}

macro_rules! warn {
    ($s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            ::defmt::warn!($s $(, $x)*);
            #[cfg(all(feature = "std", not(feature = "defmt")))]
            ::std::println!(concat!("dm: warning: ", $s) $(, $x)*);
            #[cfg(not(any(feature = "std", feature = "defmt")))]
            let _ = ($( & $x ),*);
        }
    };
}

macro_rules! debug {
    ($s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            ::defmt::debug!($s $(, $x)*);
            #[cfg(all(feature = "std", not(feature = "defmt")))]
            ::std::println!(concat!("dm: debug: ", $s) $(, $x)*);
            #[cfg(not(any(feature = "std", feature = "defmt")))]
            let _ = ($( & $x ),*);
        }
    };
}
