//! The repub registry command line interface.

pub mod commands;
