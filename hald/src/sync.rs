// SPDX-License-Identifier: GPL-2.0

//! Synchronization primitives

// Re-export common synchronization types
pub use std::sync::mpsc::{channel, Receiver, Sender};
pub use std::sync::Arc;

pub use spin::Mutex;
pub use spin::RwLock;
