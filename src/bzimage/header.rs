//! Setup-header codec for the bzImage boot protocol.
//!
//! The setup header is a rigid little-endian structure at the start of the
//! image: the legacy MBR stub followed by the boot-protocol fields. The
//! field table below is declared once and drives parsing, emission, and
//! the one-line-per-field dump, so the three can never drift apart.

use std::fmt::Write as _;
use std::io;

use crate::error::{Error, Result};

/// Total size of the setup header, MBR stub included.
pub const SETUP_HEADER_LEN: usize = 0x268;

/// Expected value of `boot_sector_magic`.
pub const BOOT_SECTOR_MAGIC: u16 = 0xaa55;

/// Expected value of `header_magic` ("HdrS").
pub const HEADER_MAGIC: [u8; 4] = *b"HdrS";

/// A fixed-width header field: how to decode, encode, and hex-print it.
trait Field: Sized {
    const WIDTH: usize;
    fn zero() -> Self;
    fn get(d: &[u8]) -> Self;
    fn put(&self, d: &mut [u8]);
    fn hex(&self) -> String;
}

macro_rules! int_field {
    ($($t:ty),*) => {$(
        impl Field for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn zero() -> Self {
                0
            }

            fn get(d: &[u8]) -> Self {
                <$t>::from_le_bytes(d[..Self::WIDTH].try_into().unwrap())
            }

            fn put(&self, d: &mut [u8]) {
                d[..Self::WIDTH].copy_from_slice(&self.to_le_bytes());
            }

            fn hex(&self) -> String {
                format!("{:#04x}", self)
            }
        }
    )*};
}

int_field!(u8, u16, u32, u64);

impl<const N: usize> Field for [u8; N] {
    const WIDTH: usize = N;

    fn zero() -> Self {
        [0; N]
    }

    fn get(d: &[u8]) -> Self {
        d[..N].try_into().unwrap()
    }

    fn put(&self, d: &mut [u8]) {
        d[..N].copy_from_slice(self);
    }

    fn hex(&self) -> String {
        let mut s = String::with_capacity(2 + 2 * N);
        s.push_str("0x");
        for b in self {
            let _ = write!(s, "{:02x}", b);
        }
        s
    }
}

macro_rules! linux_header {
    ($( $field:ident : $ty:ty = $off:literal, $disp:literal; )+) => {
        /// The bzImage setup header.
        ///
        /// Every field sits at a fixed offset from the start of the image
        /// and is encoded little-endian regardless of host byte order. The
        /// fields tile the first [`SETUP_HEADER_LEN`] bytes exactly, so an
        /// unmodified header re-emits byte-for-byte.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct LinuxHeader {
            $( pub $field: $ty, )+
        }

        impl LinuxHeader {
            /// An all-zero header, useful as a starting point for building
            /// images from scratch.
            pub fn zeroed() -> Self {
                LinuxHeader {
                    $( $field: <$ty as Field>::zero(), )+
                }
            }

            /// Decode a header from the leading bytes of `d`.
            pub fn parse(d: &[u8]) -> Result<Self> {
                if d.len() < SETUP_HEADER_LEN {
                    return Err(Error::ShortRead {
                        expected: SETUP_HEADER_LEN,
                        got: d.len(),
                    });
                }
                Ok(LinuxHeader {
                    $( $field: <$ty as Field>::get(&d[$off..]), )+
                })
            }

            /// Encode the header into the leading bytes of `d`.
            ///
            /// `d` must hold at least [`SETUP_HEADER_LEN`] bytes. Exact
            /// inverse of [`LinuxHeader::parse`].
            pub fn write_to(&self, d: &mut [u8]) {
                $( self.$field.put(&mut d[$off..]); )+
            }

            /// The header's wire encoding.
            pub fn to_bytes(&self) -> Vec<u8> {
                let mut out = vec![0u8; SETUP_HEADER_LEN];
                self.write_to(&mut out);
                out
            }

            /// Print one `Name:0xHEX` line per field, in wire order.
            ///
            /// Integers print with at least two hex digits; byte arrays as
            /// one contiguous hex string.
            pub fn dump<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
                $( writeln!(w, concat!($disp, ":{}"), self.$field.hex())?; )+
                Ok(())
            }
        }

        impl Default for LinuxHeader {
            fn default() -> Self {
                Self::zeroed()
            }
        }
    };
}

linux_header! {
    mbr_code:              [u8; 0xc0]  = 0x000, "MBRCode";
    ext_ramdisk_image:     u32         = 0x0c0, "ExtRamdiskImage";
    ext_ramdisk_size:      u32         = 0x0c4, "ExtRamdiskSize";
    ext_cmdline_ptr:       u32         = 0x0c8, "ExtCmdlinePtr";
    reserved:              [u8; 0x125] = 0x0cc, "O";
    setup_sects:           u8          = 0x1f1, "SetupSects";
    root_flags:            u16         = 0x1f2, "RootFlags";
    syssize:               u32         = 0x1f4, "Syssize";
    ram_size:              u16         = 0x1f8, "RAMSize";
    vid_mode:              u16         = 0x1fa, "Vidmode";
    root_dev:              u16         = 0x1fc, "RootDev";
    boot_sector_magic:     u16         = 0x1fe, "Bootsectormagic";
    jump:                  u16         = 0x200, "Jump";
    header_magic:          [u8; 4]     = 0x202, "HeaderMagic";
    protocol_version:      u16         = 0x206, "Protocolversion";
    real_mode_switch:      u32         = 0x208, "RealModeSwitch";
    start_sys:             u16         = 0x20c, "StartSys";
    kver_addr:             u16         = 0x20e, "Kveraddr";
    type_of_loader:        u8          = 0x210, "TypeOfLoader";
    loadflags:             u8          = 0x211, "Loadflags";
    setup_move_size:       u16         = 0x212, "Setupmovesize";
    code32_start:          u32         = 0x214, "Code32Start";
    ramdisk_image:         u32         = 0x218, "RamdiskImage";
    ramdisk_size:          u32         = 0x21c, "RamdiskSize";
    bootsect_kludge:       [u8; 4]     = 0x220, "BootSectKludge";
    heap_end_ptr:          u16         = 0x224, "Heapendptr";
    ext_loader_ver:        u8          = 0x226, "ExtLoaderVer";
    ext_loader_type:       u8          = 0x227, "ExtLoaderType";
    cmdline_ptr:           u32         = 0x228, "Cmdlineptr";
    initrd_addr_max:       u32         = 0x22c, "InitrdAddrMax";
    kernel_alignment:      u32         = 0x230, "Kernelalignment";
    relocatable_kernel:    u8          = 0x234, "RelocatableKernel";
    min_alignment:         u8          = 0x235, "MinAlignment";
    xload_flags:           u16         = 0x236, "XLoadFlags";
    cmdline_size:          u32         = 0x238, "CmdLineSize";
    hardware_subarch:      u32         = 0x23c, "HardwareSubArch";
    hardware_subarch_data: u64         = 0x240, "HardwareSubArchData";
    payload_offset:        u32         = 0x248, "PayloadOffset";
    payload_size:          u32         = 0x24c, "PayloadSize";
    setup_data:            u64         = 0x250, "SetupData";
    pref_address:          u64         = 0x258, "PrefAddress";
    init_size:             u32         = 0x260, "InitSize";
    handover_offset:       u32         = 0x264, "HandoverOffset";
}
