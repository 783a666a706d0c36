//! Compile-time defaults
//!
//! Generated by build.rs from the library defaults, merged with the file
//! named by `COSCHED_CONFIG_RS` when that is set at build time.

include!(concat!(env!("OUT_DIR"), "/gen_config.rs"));
