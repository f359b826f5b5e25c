//! Command implementations for the mango CLI

pub mod down;
pub mod run;
