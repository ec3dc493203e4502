#![warn(rust_2018_idioms)]
#![allow(dead_code)]

#[cfg(feature = "marshal")]
pub mod marshal;

pub mod error;
pub mod util;
