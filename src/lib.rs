pub mod archive;
pub mod component;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod digest;
pub mod error;
pub mod image;
pub mod logging;
pub mod reference;
pub mod store;
pub mod tool;
pub mod transport;
pub mod walker;

pub use error::{CtaError, Result};
