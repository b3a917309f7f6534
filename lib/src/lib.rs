#![no_std]

#[cfg(test)]
extern crate std;

pub mod cmdline;
pub mod cpu;
pub mod init_flag;
pub mod io;
pub mod klog;
pub mod ports;
pub mod spinlock;

pub use init_flag::{InitFlag, StateFlag};
pub use klog::{KlogLevel, klog_get_level, klog_register_backend, klog_set_level};
pub use ports::COM1;
pub use spinlock::{IrqMutex, IrqMutexGuard};
