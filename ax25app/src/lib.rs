#![doc = include_str!("../README.md")]

pub mod error;
pub mod event_loop;
pub mod future;
pub mod interface;
pub mod kiss;
pub mod peer;
pub mod router;
pub mod signal;
pub mod station;

#[cfg(test)]
mod test_util;

// Protocol types callers need to address stations and inspect frames
pub use ax25core::address::{Address, Callsign, Path};
pub use ax25core::frame::{Ax25Frame, Control, FrameHeader};
