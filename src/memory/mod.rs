//! Memory planning for kernel handoff.
//!
//! This module models physical memory for loading a new operating system:
//! the firmware memory map says what is RAM and what is reserved, and the
//! segment plan says which buffers land at which physical addresses. The
//! planner finds free space, reserves it, and produces the page-aligned,
//! disjoint segment list the kernel-replacement syscall requires.

mod map;
mod range;
mod segment;

pub use map::{
    payload_param_bytes, MemoryMap, PayloadMemType, PayloadMemoryMapEntry, RangeType, TypedRange,
};
pub use range::{Range, Ranges, MAX_ADDR};
pub use segment::{align_up, BufRef, Segment, Segments};

use std::io::Read;
use std::sync::OnceLock;

use goblin::elf::{program_header, Elf};

use crate::error::{Error, Result};

/// Allocations steer clear of the first megabyte, where the BIOS and
/// legacy data structures live.
const M1: u64 = 1 << 20;

/// The host page size, queried once and cached.
pub fn host_page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 })
}

/// The physical memory model plus the plan of segments to load into it.
///
/// `phys` tells the loaded operating system what memory is usable as RAM
/// and what is reserved. `segments` holds the buffers bound to physical
/// ranges for the next kernel.
#[derive(Debug, Clone)]
pub struct Memory {
    pub phys: MemoryMap,
    pub segments: Segments,
    page_size: u64,
}

impl Memory {
    /// Create a planner over `phys` using the host page size.
    pub fn new(phys: MemoryMap) -> Self {
        Self::with_page_size(phys, host_page_size())
    }

    /// Create a planner with an explicit page size.
    pub fn with_page_size(phys: MemoryMap, page_size: u64) -> Self {
        Memory {
            phys,
            segments: Segments::new(),
            page_size,
        }
    }

    /// Create a planner from the firmware memory map in sysfs.
    pub fn from_sysfs() -> Result<Self> {
        Ok(Self::new(MemoryMap::from_sysfs()?))
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Unused regions of RAM, adjusted so every range starts at a page
    /// boundary.
    ///
    /// Takes all RAM-typed ranges of the memory map and subtracts every
    /// segment's physical range. A range whose aligned start reaches its
    /// end is omitted.
    pub fn available_ram(&self) -> Ranges {
        let mut ram = self.phys.filter_by_type(RangeType::Ram);
        for s in &self.segments {
            ram = ram.minus(s.phys);
        }

        ram.iter()
            .filter_map(|r| {
                let aligned = align_up(r.start, self.page_size);
                if aligned < r.end() {
                    Some(Range {
                        start: aligned,
                        size: r.size - (aligned - r.start),
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// Find a free region where `size` bytes can be stored by a later
    /// segment insertion. Allocates whole pages above the 1 MiB floor.
    pub fn find_space(&self, size: u64) -> Result<Range> {
        self.available_ram()
            .find_space_above(align_up(size, self.page_size), M1)
    }

    /// Reserve page-aligned `size` bytes of free RAM within `limit` and
    /// mark them reserved in the memory map.
    pub fn reserve_phys(&mut self, size: u64, limit: Range) -> Result<Range> {
        let r = self
            .available_ram()
            .find_space_in(align_up(size, self.page_size), limit)?;
        self.phys.insert(TypedRange {
            range: r,
            typ: RangeType::Reserved,
        });
        Ok(r)
    }

    /// Reserve room for `data` within `limit` and bind it there as a
    /// segment.
    pub fn add_phys_segment(&mut self, data: Vec<u8>, limit: Range) -> Result<Range> {
        let r = self.reserve_phys(data.len() as u64, limit)?;
        self.segments.insert(data, r);
        Ok(r)
    }

    /// Bind `data` to a newly found free region.
    pub fn add_kexec_segment(&mut self, data: Vec<u8>) -> Result<Range> {
        let r = self.find_space(data.len() as u64)?;
        self.segments.insert(data, r);
        Ok(r)
    }

    /// Read an ELF image from `r` and bind every loadable program segment
    /// to its physical address.
    ///
    /// A segment with `filesz == 0` binds an empty buffer; the loader
    /// zero-fills the whole range. A program header pointing past the end
    /// of the input fails with a short-read error.
    pub fn load_elf_segments(&mut self, mut r: impl Read) -> Result<()> {
        let mut data = Vec::new();
        r.read_to_end(&mut data)?;
        let elf = Elf::parse(&data)?;

        for ph in &elf.program_headers {
            if ph.p_type != program_header::PT_LOAD {
                continue;
            }

            // Only carry bytes if the segment has some; the syscall zeroes
            // the rest of the buffer (all of it if filesz is 0).
            let d = if ph.p_filesz == 0 {
                Vec::new()
            } else {
                let off = ph.p_offset as usize;
                let end = off + ph.p_filesz as usize;
                if end > data.len() {
                    return Err(Error::ShortRead {
                        expected: end,
                        got: data.len(),
                    });
                }
                data[off..end].to_vec()
            };
            self.segments.insert(
                d,
                Range {
                    start: ph.p_paddr,
                    size: ph.p_memsz,
                },
            );
        }
        Ok(())
    }

    /// The finished load plan: page-aligned, disjoint segments ready for
    /// the kernel-replacement syscall.
    pub fn align_and_merge(&self) -> Result<Segments> {
        self.segments.align_and_merge(self.page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 0x1000;

    fn r(start: u64, size: u64) -> Range {
        Range { start, size }
    }

    fn ram_map(regions: &[(u64, u64)]) -> MemoryMap {
        regions
            .iter()
            .map(|&(start, size)| TypedRange {
                range: r(start, size),
                typ: RangeType::Ram,
            })
            .collect()
    }

    /// A minimal ELF64 image: header, `phdrs` program headers, then
    /// `payload` as the file contents the headers point into.
    fn build_elf(phdrs: &[(u32, u64, u64, u64, u64)], payload: &[u8]) -> Vec<u8> {
        let phoff = 0x40u64;
        let data_off = phoff + 56 * phdrs.len() as u64;

        let mut elf = Vec::new();
        elf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        elf.extend_from_slice(&[0; 8]);
        elf.extend_from_slice(&2u16.to_le_bytes()); // e_type: EXEC
        elf.extend_from_slice(&0x3eu16.to_le_bytes()); // e_machine: x86-64
        elf.extend_from_slice(&1u32.to_le_bytes()); // e_version
        elf.extend_from_slice(&0u64.to_le_bytes()); // e_entry
        elf.extend_from_slice(&phoff.to_le_bytes()); // e_phoff
        elf.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        elf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        elf.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
        elf.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
        elf.extend_from_slice(&(phdrs.len() as u16).to_le_bytes()); // e_phnum
        elf.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
        elf.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        elf.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

        for &(p_type, offset, paddr, filesz, memsz) in phdrs {
            elf.extend_from_slice(&p_type.to_le_bytes());
            elf.extend_from_slice(&0u32.to_le_bytes()); // p_flags
            elf.extend_from_slice(&(data_off + offset).to_le_bytes());
            elf.extend_from_slice(&paddr.to_le_bytes()); // p_vaddr
            elf.extend_from_slice(&paddr.to_le_bytes());
            elf.extend_from_slice(&filesz.to_le_bytes());
            elf.extend_from_slice(&memsz.to_le_bytes());
            elf.extend_from_slice(&PAGE.to_le_bytes()); // p_align
        }
        elf.extend_from_slice(payload);
        elf
    }

    #[test]
    fn test_available_ram() {
        let mut m = Memory::with_page_size(ram_map(&[(0, 8192), (8192, 8000)]), PAGE);
        m.segments.insert(vec![1; 50], r(40, 50));
        m.segments.insert(vec![2; 100], r(8000, 2000));

        let got: Vec<Range> = m.available_ram().iter().copied().collect();
        assert_eq!(
            got,
            vec![r(0, 40), r(4096, 8000 - 4096), r(12288, 16192 - 12288)]
        );
    }

    #[test]
    fn test_available_ram_never_overlaps_segments() {
        let mut m = Memory::with_page_size(ram_map(&[(0, 0x10000), (0x20000, 0x8000)]), PAGE);
        m.segments.insert(vec![1; 0x900], r(0x4f0, 0x900));
        m.segments.insert(vec![2; 0x100], r(0x20ff0, 0x100));

        for avail in &m.available_ram() {
            for seg in &m.segments {
                assert!(avail.disjunct(seg.phys), "{} overlaps {}", avail, seg.phys);
            }
            assert_eq!(avail.start % PAGE, 0);
        }
    }

    #[test]
    fn test_find_space_respects_floor() {
        // Plenty of room below 1 MiB, a single free page above it.
        let m = Memory::with_page_size(ram_map(&[(0, M1), (M1 + 0x3000, 0x1000)]), PAGE);
        assert_eq!(m.find_space(0x800).unwrap(), r(M1 + 0x3000, 0x1000));

        let err = m.find_space(0x2000).unwrap_err();
        assert!(matches!(err, Error::NotEnoughSpace { size: 0x2000 }), "{err}");
    }

    #[test]
    fn test_reserve_phys_updates_map() {
        let mut m = Memory::with_page_size(ram_map(&[(0x100000, 0x100000)]), PAGE);
        let got = m.reserve_phys(0x1800, r(0x100000, 0x100000)).unwrap();
        assert_eq!(got, r(0x100000, 0x2000));

        let reserved: Vec<Range> = m
            .phys
            .filter_by_type(RangeType::Reserved)
            .iter()
            .copied()
            .collect();
        assert_eq!(reserved, vec![got]);
        // The reservation no longer counts as available.
        assert_eq!(
            m.available_ram().iter().copied().collect::<Vec<_>>(),
            vec![r(0x102000, 0xfe000)]
        );
    }

    #[test]
    fn test_add_kexec_segment() {
        let mut m = Memory::with_page_size(ram_map(&[(M1, 0x10000)]), PAGE);
        let got = m.add_kexec_segment(vec![7; 0x42]).unwrap();
        assert_eq!(got, r(M1, 0x1000));
        assert_eq!(m.segments.len(), 1);
        assert_eq!(m.segments.get_phys(r(M1, 0x42)).unwrap(), vec![7; 0x42]);

        // The next segment lands after the first.
        let next = m.add_kexec_segment(vec![8; 0x10]).unwrap();
        assert_eq!(next, r(M1 + 0x1000, 0x1000));
    }

    #[test]
    fn test_load_elf_segments() {
        let payload: Vec<u8> = (0u8..=255).collect();
        let elf = build_elf(
            &[
                (program_header::PT_LOAD, 0, 0x200000, 0x100, 0x2000),
                (program_header::PT_NOTE, 0, 0x999000, 0x10, 0x10),
                (program_header::PT_LOAD, 0x100, 0x300000, 0, 0x1000),
            ],
            &payload,
        );

        let mut m = Memory::with_page_size(ram_map(&[(M1, 0x1000000)]), PAGE);
        m.load_elf_segments(elf.as_slice()).unwrap();

        // The PT_NOTE header is skipped.
        assert_eq!(m.segments.len(), 2);
        let segs: Vec<Segment> = m.segments.iter().copied().collect();
        assert_eq!(segs[0].phys, r(0x200000, 0x2000));
        assert_eq!(m.segments.buf_bytes(&segs[0]), &payload[..0x100]);
        assert_eq!(segs[1].phys, r(0x300000, 0x1000));
        assert_eq!(segs[1].buf.size, 0);
    }

    #[test]
    fn test_load_elf_segments_truncated() {
        let elf = build_elf(
            &[(program_header::PT_LOAD, 0, 0x200000, 0x10000, 0x10000)],
            &[0xab; 0x20],
        );
        let mut m = Memory::with_page_size(ram_map(&[(M1, 0x1000000)]), PAGE);
        let err = m.load_elf_segments(elf.as_slice()).unwrap_err();
        assert!(matches!(err, Error::ShortRead { .. }), "{err}");
    }

    #[test]
    fn test_align_and_merge_facade() {
        let mut m = Memory::with_page_size(ram_map(&[(M1, 0x10000)]), PAGE);
        m.segments.insert(vec![1; 0x40], r(0x1040, 0x40));
        m.segments.insert(vec![2; 0x100], r(0x1100, 0x100));
        let plan = m.align_and_merge().unwrap();
        assert_eq!(plan.len(), 1);
        // The original plan is untouched.
        assert_eq!(m.segments.len(), 2);
    }
}
