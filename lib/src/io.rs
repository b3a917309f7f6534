//! Typed x86 I/O ports.
//!
//! `Port<T>` is `Copy` and const-constructible so port tables can live in
//! `ports.rs` as plain constants. Accesses compile to `in`/`out` only on a
//! freestanding x86_64 build; elsewhere reads float high and writes vanish.

use core::marker::PhantomData;

pub trait PortValue: Copy {
    const FLOATING: Self;

    /// # Safety
    /// Port I/O.
    unsafe fn read_from(port: u16) -> Self;

    /// # Safety
    /// Port I/O.
    unsafe fn write_to(port: u16, value: Self);
}

macro_rules! port_value {
    ($ty:ty, $floating:expr) => {
        impl PortValue for $ty {
            const FLOATING: Self = $floating;

            #[inline(always)]
            unsafe fn read_from(port: u16) -> Self {
                #[cfg(all(target_arch = "x86_64", target_os = "none"))]
                {
                    let mut p = x86_64::instructions::port::Port::<$ty>::new(port);
                    unsafe { p.read() }
                }
                #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
                {
                    let _ = port;
                    Self::FLOATING
                }
            }

            #[inline(always)]
            unsafe fn write_to(port: u16, value: Self) {
                #[cfg(all(target_arch = "x86_64", target_os = "none"))]
                {
                    let mut p = x86_64::instructions::port::Port::<$ty>::new(port);
                    unsafe { p.write(value) }
                }
                #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
                {
                    let _ = (port, value);
                }
            }
        }
    };
}

port_value!(u8, 0xFF);
port_value!(u16, 0xFFFF);
port_value!(u32, 0xFFFF_FFFF);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Port<T> {
    port: u16,
    _marker: PhantomData<T>,
}

impl<T: PortValue> Port<T> {
    pub const fn new(port: u16) -> Self {
        Self {
            port,
            _marker: PhantomData,
        }
    }

    pub const fn number(&self) -> u16 {
        self.port
    }

    /// # Safety
    /// The port must belong to a device the caller owns.
    #[inline(always)]
    pub unsafe fn read(&self) -> T {
        unsafe { T::read_from(self.port) }
    }

    /// # Safety
    /// The port must belong to a device the caller owns.
    #[inline(always)]
    pub unsafe fn write(&self, value: T) {
        unsafe { T::write_to(self.port, value) }
    }

    /// Port at `self + offset`, for register blocks addressed from a base.
    pub const fn offset(&self, offset: u16) -> Self {
        Self::new(self.port + offset)
    }
}
