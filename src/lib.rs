//! An impish little engine for prelinking and patching 64-bit Mach-O kernels.
//!
//! Given an in-memory `Darwin Kernel` image, this crate can inject kext
//! bundles into its prelinked-kext table, patch the vtables of C++-style
//! classes so that inherited symbols resolve correctly, and apply a
//! configurable list of binary patches gated on the running kernel version.
//!
//! The crate is organised leaves-first:
//!
//! - [`macho`] is a zero-copy, bounds-checked Mach-O reader.
//! - [`resolver`] answers name/value symbol queries across a kext and its
//!   dependencies.
//! - [`vtable`] rebuilds vtables the way a real linker would.
//! - [`expander`] rewrites a packed Mach-O into its in-memory layout.
//! - [`patch`] and [`quirks`] implement the generic find/replace engine and
//!   the library of named quirks built on top of it.
//! - [`orchestrator`] ties all of the above into a single entry point.
//!
//! Configuration ([`config`]) and storage ([`storage`]) are kept as thin,
//! swappable collaborators; nothing in the core borrows the filesystem.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod expander;
pub mod macho;
pub mod orchestrator;
pub mod patch;
pub mod quirks;
pub mod resolver;
pub mod storage;
pub mod version;
pub mod vtable;

pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, PrelinkedContext};
