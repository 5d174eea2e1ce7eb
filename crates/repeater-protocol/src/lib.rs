//! Wire-level types for the UltraVNC repeater protocol (mode II).
//!
//! A freshly accepted connection announces itself with a single fixed-size
//! greeting block. This crate classifies that block; it performs no I/O.

mod greeting;

pub use greeting::{
    classify, GreetingError, Intent, Role, DEFAULT_BLOCK_LEN, DEFAULT_CLIENT_PORT,
    DEFAULT_SERVER_PORT, RFB_BANNER,
};
