//! # osimage
//!
//! A userland toolkit for loading and manipulating operating system
//! images.
//!
//! Two cores make up the crate: the memory planner, which models physical
//! RAM and lays out the segments a new kernel is loaded from, and the
//! bzImage codec, which parses and re-emits the Linux kernel container
//! byte-exactly.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use osimage::BzImage;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let data = std::fs::read("bzImage")?;
//!     let image = BzImage::parse(&data)?;
//!     println!("{}", image.kver()?);
//!     Ok(())
//! }
//! ```
//!
//! Planning memory for a kernel handoff:
//!
//! ```rust,no_run
//! use osimage::{Memory, Result};
//!
//! fn main() -> Result<()> {
//!     let mut mem = Memory::from_sysfs()?;
//!     mem.load_elf_segments(std::fs::File::open("vmlinux")?)?;
//!     let plan = mem.align_and_merge()?;
//!     for seg in &plan {
//!         println!("{}", seg);
//!     }
//!     Ok(())
//! }
//! ```

pub mod bzimage;
mod error;
pub mod memory;

// Re-exports
pub use bzimage::{BzImage, KernelDesc, LinuxHeader};
pub use error::{Error, Result};
pub use memory::{Memory, MemoryMap, Range, RangeType, Ranges, Segment, Segments, TypedRange};
