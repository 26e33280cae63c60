#![doc = include_str!("../README.md")]

pub mod address;
pub mod frame;
pub mod kiss;
