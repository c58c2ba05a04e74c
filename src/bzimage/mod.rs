//! bzImage container codec.
//!
//! Parses the Linux bzImage format into its parts (setup header, real-mode
//! boot code, and the compressed protected-mode kernel) and re-emits them.
//! An unmodified image round-trips byte-for-byte. The embedded initramfs
//! can be replaced in place as long as the new archive fits the slot the
//! old one occupied.

mod header;

pub use header::{LinuxHeader, BOOT_SECTOR_MAGIC, HEADER_MAGIC, SETUP_HEADER_LEN};

use std::io;

use log::debug;
use serde::Serialize;

use crate::error::{Error, Result};

/// Load address of the protected-mode kernel payload.
const KERNEL_BASE: u64 = 0x10_0000;

/// The kernel version pointer is relative to the end of the boot sector.
const KVER_BASE: usize = 0x200;

/// Signatures of the compression formats a kernel payload can use.
const COMPRESSION_MAGICS: &[&[u8]] = &[
    &[0x1f, 0x8b],                                         // gzip
    &[0xfd, b'7', b'z', b'X', b'Z', 0x00],                 // xz
    &[0x5d, 0x00, 0x00],                                   // lzma
    &[0x89, b'L', b'Z', b'O', 0x00, 0x0d, 0x0a, 0x1a, 0x0a], // lzo
    &[b'B', b'Z', b'h'],                                   // bzip2
    &[0x02, 0x21, 0x4c, 0x18],                             // lz4
    &[0x28, 0xb5, 0x2f, 0xfd],                             // zstd
];

/// Magic that opens every record of a cpio "newc" archive.
const CPIO_MAGIC: &[u8] = b"070701";

/// File name of the final record of a cpio archive.
const CPIO_TRAILER: &[u8] = b"TRAILER!!!";

/// A parsed bzImage.
///
/// Owns a copy of the image bytes; mutate it only through the provided
/// editors, then re-emit with [`BzImage::to_bytes`].
#[derive(Debug, Clone)]
pub struct BzImage {
    pub header: LinuxHeader,
    /// The real-mode setup: bytes `[0, (setup_sects + 1) * 512)`.
    pub boot_code: Vec<u8>,
    /// Everything after the setup, containing the compressed kernel.
    pub kernel_code: Vec<u8>,
    /// Physical address the protected-mode kernel loads at.
    pub kernel_base: u64,
    /// Offset of the compressed payload inside `kernel_code`, found by its
    /// compression signature. Zero when no signature was found.
    pub kernel_offset: usize,
}

impl BzImage {
    /// Parse an image, copying its bytes.
    ///
    /// Verifies the boot-sector magic and the "HdrS" header magic, then
    /// splits the image at the setup boundary.
    pub fn parse(d: &[u8]) -> Result<Self> {
        let header = LinuxHeader::parse(d)?;
        if header.boot_sector_magic != BOOT_SECTOR_MAGIC {
            return Err(Error::BadMagic {
                field: "boot sector magic",
                got: header.boot_sector_magic as u64,
                want: BOOT_SECTOR_MAGIC as u64,
            });
        }
        if header.header_magic != HEADER_MAGIC {
            return Err(Error::BadMagic {
                field: "setup header magic",
                got: u32::from_be_bytes(header.header_magic) as u64,
                want: u32::from_be_bytes(HEADER_MAGIC) as u64,
            });
        }

        // Protocols before 2.00 left setup_sects zero, meaning four.
        let setup_sects = match header.setup_sects {
            0 => 4,
            n => n as usize,
        };
        let boot_len = (setup_sects + 1) * 512;
        if d.len() < boot_len {
            return Err(Error::ShortRead {
                expected: boot_len,
                got: d.len(),
            });
        }

        let boot_code = d[..boot_len].to_vec();
        let kernel_code = d[boot_len..].to_vec();
        let kernel_offset = find_compression_magic(&kernel_code).unwrap_or_else(|| {
            debug!("no compressed payload signature in kernel code");
            0
        });
        debug!(
            "boot code {:#x} bytes, kernel code {:#x} bytes, payload at {:#x}",
            boot_code.len(),
            kernel_code.len(),
            kernel_offset
        );

        Ok(BzImage {
            header,
            boot_code,
            kernel_code,
            kernel_base: KERNEL_BASE,
            kernel_offset,
        })
    }

    /// Re-emit the image. An unmodified image round-trips byte-for-byte.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.boot_code.len() + self.kernel_code.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.boot_code[SETUP_HEADER_LEN..]);
        out.extend_from_slice(&self.kernel_code);
        out
    }

    /// Print the setup header, one field per line, to `w`.
    pub fn dump<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
        self.header.dump(w)
    }

    /// Offset and capacity of the embedded initramfs inside `kernel_code`.
    ///
    /// The archive starts at the first cpio magic at or after the payload
    /// offset. Its capacity runs through the trailer record and the zero
    /// padding behind it, which is the room a replacement may use.
    pub fn initramfs_region(&self) -> Result<(usize, usize)> {
        let tail = &self.kernel_code[self.kernel_offset.min(self.kernel_code.len())..];
        let start =
            self.kernel_offset + find(tail, CPIO_MAGIC).ok_or(Error::MissingInitramfs)?;
        let trailer =
            find(&self.kernel_code[start..], CPIO_TRAILER).ok_or(Error::MissingInitramfs)?;

        let mut end = start + trailer + CPIO_TRAILER.len();
        while end < self.kernel_code.len() && self.kernel_code[end] == 0 {
            end += 1;
        }
        Ok((start, end - start))
    }

    /// Replace the embedded initramfs in place.
    ///
    /// The image is never grown, truncated, or relocated: a replacement
    /// larger than the existing slot fails, a smaller one is zero-padded
    /// to the slot's full capacity.
    pub fn replace_initramfs(&mut self, new: &[u8]) -> Result<()> {
        let (start, capacity) = self.initramfs_region()?;
        if new.len() > capacity {
            return Err(Error::InitramfsTooBig {
                new: new.len(),
                old: capacity,
            });
        }
        self.kernel_code[start..start + new.len()].copy_from_slice(new);
        self.kernel_code[start + new.len()..start + capacity].fill(0);
        Ok(())
    }

    /// The kernel version string, e.g.
    /// `4.12.7 (rminnich@uroot) #6 Fri Aug 10 14:47:18 PDT 2018`.
    ///
    /// Read from the boot code at the offset named by the header's
    /// `kver_addr` field, without the terminating NUL.
    pub fn kver(&self) -> Result<String> {
        if self.header.kver_addr == 0 {
            return Err(Error::MissingVersion);
        }
        let off = self.header.kver_addr as usize + KVER_BASE;
        if off >= self.boot_code.len() {
            return Err(Error::MissingVersion);
        }
        let tail = &self.boot_code[off..];
        let len = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
    }
}

/// Structured form of the kernel version string, shaped for JSON output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct KernelDesc {
    /// Release, e.g. `4.12.7`.
    pub release: String,
    /// Everything from the build counter on, e.g. `#6 Fri Aug 10 ...`.
    pub version: String,
    /// Who built the kernel, e.g. `rminnich@uroot`.
    pub builder: String,
    pub build_num: u64,
    /// Build date as `YYYY-MM-DDTHH:MM:SS`.
    pub build_time: String,
}

impl KernelDesc {
    /// Split a version string of the form
    /// `<release> (<builder>) #<num> <date>`.
    pub fn parse(ver: &str) -> Result<Self> {
        let bad = || Error::BadVersion(ver.to_string());

        let (release, rest) = ver.split_once(" (").ok_or_else(bad)?;
        let (builder, version) = rest.split_once(") ").ok_or_else(bad)?;
        let (num, date) = version
            .strip_prefix('#')
            .and_then(|v| v.split_once(' '))
            .ok_or_else(bad)?;
        let build_num = num.parse().map_err(|_| bad())?;
        let build_time = parse_build_date(date).ok_or_else(bad)?;

        Ok(KernelDesc {
            release: release.to_string(),
            version: version.to_string(),
            builder: builder.to_string(),
            build_num,
            build_time,
        })
    }
}

/// Convert `Fri Aug 10 14:47:18 PDT 2018` to `2018-08-10T14:47:18`. The
/// zone abbreviation is optional and dropped.
fn parse_build_date(date: &str) -> Option<String> {
    let fields: Vec<&str> = date.split_whitespace().collect();
    let (mon, day, time, year) = match fields.as_slice() {
        [_, mon, day, time, _zone, year] => (mon, day, time, year),
        [_, mon, day, time, year] => (mon, day, time, year),
        _ => return None,
    };

    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    let month = MONTHS.iter().position(|m| m == mon)? + 1;
    let day: u32 = day.parse().ok()?;
    let year: u32 = year.parse().ok()?;
    if time.split(':').count() != 3 || !time.split(':').all(|p| p.parse::<u32>().is_ok()) {
        return None;
    }
    Some(format!("{year:04}-{month:02}-{day:02}T{time}"))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// First offset in `d` where any known compression signature starts.
fn find_compression_magic(d: &[u8]) -> Option<usize> {
    COMPRESSION_MAGICS.iter().filter_map(|m| find(d, m)).min()
}
