pub(crate) use std::fmt::Debug;

pub(crate) use hashbrown::HashMap;

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        log::info!("[canopen] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        log::debug!("[canopen] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        log::warn!("[canopen] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        log::error!("[canopen] {}", format_args!($($arg)*))
    };
}
