#![forbid(unsafe_code)]

pub mod logger;
