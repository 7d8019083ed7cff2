#![allow(clippy::all)]

#[rustfmt::skip]
mod tsopb;
pub use self::tsopb::*;
