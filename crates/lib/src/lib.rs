//! # Image based OS deployment
//!
//! This crate installs, resets and upgrades immutable operating systems
//! laid out as an active, a passive and a recovery image on dedicated
//! partitions.
//!
//! Every host interaction (commands, mounts, hooks, image pulls) goes
//! through a trait object bundled in [`config::Config`], so the actions
//! in [`action`] run unchanged against fakes.

pub mod action;
pub mod chroot;
mod cleanstack;
pub mod cli;
pub mod config;
pub mod constants;
pub mod cosign;
pub mod error;
pub mod extract;
mod grub;
pub mod hooks;
mod imager;
mod kernel;
pub mod luet;
pub mod partitioner;
pub mod probe;
mod reboot;
mod selinux;
pub mod source;
pub mod spec;

#[cfg(test)]
mod testutils;

pub use config::Interrupt;
pub use error::{exit_code, DeployError};
