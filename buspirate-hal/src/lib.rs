//! `embedded-hal` implementations via a Bus Pirate device
//!
//! [`embedded-hal`](https://crates.io/crates/embedded-hal) is a hardware
//! abstraction layer for embedded systems. It is most commonly used in
//! applications destined to run on microcontrollers or other small computing
//! devices embedded inside products.
//!
//! This library implements the `embedded-hal` 0.2 SPI traits in terms of the
//! [Bus Pirate](http://dangerousprototypes.com/docs/Bus_Pirate), so that a
//! HAL device driver can talk to its hardware from a general-purpose
//! computer, with the Bus Pirate as the intermediary. That makes for a much
//! faster write/test cycle while developing the driver.
//!
//! The trait implementations wrap an already-initialized
//! `buspirate::spi::Spi`; clock mode, speed and chip-select handling are
//! whatever `Spi::init` set up. Like `buspirate` itself, this crate needs
//! `std`.

pub mod spi;

pub use spi::BusPirateSPI;
