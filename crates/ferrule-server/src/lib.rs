#![doc = include_str!("../README.md")]

pub mod server;

pub use ferrule_core::{Error, Result};
