#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod ioapic;
pub mod pic;
pub mod rtc;
