#![forbid(unsafe_code)]

pub mod accelerator;
pub mod error;
pub mod eval;
pub mod settings;
