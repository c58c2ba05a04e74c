//! Error types for osimage.

use std::path::PathBuf;

use thiserror::Error;

use crate::memory::Segment;

/// Result type alias using osimage's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when planning memory or editing kernel images.
#[derive(Error, Debug)]
pub enum Error {
    // Memory planner errors
    #[error("not enough space to allocate {size:#x} bytes")]
    NotEnoughSpace { size: u64 },

    #[error("segment {a} and {b} overlap in the physical space")]
    Overlap { a: Segment, b: Segment },

    #[error("memory map {path:?}: {cause}")]
    MapParse { path: PathBuf, cause: String },

    // Image codec errors
    #[error("bad {field}: got {got:#x}, want {want:#x}")]
    BadMagic {
        field: &'static str,
        got: u64,
        want: u64,
    },

    #[error("short read: wanted {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("new initramfs is {new} bytes, won't fit in {old} byte old one")]
    InitramfsTooBig { new: usize, old: usize },

    #[error("no initramfs found in kernel code")]
    MissingInitramfs,

    #[error("no kernel version string in image")]
    MissingVersion,

    #[error("malformed kernel version string: {0:?}")]
    BadVersion(String),

    // I/O and parser errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ELF parse error: {0}")]
    Elf(#[from] goblin::error::Error),
}
