//! Foundation utilities shared by every renderer module

pub mod logging;
