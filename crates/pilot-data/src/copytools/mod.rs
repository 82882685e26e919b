//! Built-in transfer backends.

pub mod http;
pub mod mv;
pub mod objectstore;
