//! A library to talk to the embedded controller of ThinkPad laptops and build tools to do so.
//!
//! The EC exposes battery, accelerometer and other readings through a
//! row-based mailbox protocol on I/O ports. [`thinkpad_ec`] implements that
//! protocol and the locking needed to share the EC between callers.

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate log;

#[cfg(feature = "cli")]
pub mod commandline;
pub mod config;
mod os_specific;
#[cfg(feature = "smbios")]
pub mod smbios;
pub mod thinkpad_ec;
#[cfg(feature = "cli")]
mod util;

pub mod built_info {
    // The file has been placed there by the build script.
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
