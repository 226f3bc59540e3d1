// SPDX-License-Identifier: GPL-2.0

//! Daemon prelude - commonly used types and traits

pub use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
pub use std::string::{String, ToString};
pub use std::vec::Vec;

pub use crate::device::{Device, Property};
pub use crate::error::{Error, ExitKind, Result};
pub use crate::store::{DeviceStore, StoreEvent};
pub use crate::sync::{Arc, Mutex, RwLock};

/// Logging macros
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::logging::log_info(module_path!(), &format!($($arg)*)));
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => ($crate::logging::log_warning(module_path!(), &format!($($arg)*)));
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => ($crate::logging::log_error(module_path!(), &format!($($arg)*)));
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => ($crate::logging::log_debug(module_path!(), &format!($($arg)*)));
}
