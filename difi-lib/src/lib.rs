#![doc = include_str!("../../README.md")]

mod error;

pub mod acquire;
pub mod channel;
pub mod dada;
pub mod frame;
pub mod pipeline;
pub mod progress;
pub mod source;
pub mod vita;

pub use error::{Error, Result};

mod prelude {
    pub use crate::error::{Error, Result};
}
