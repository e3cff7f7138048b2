/*!
 * Thread Context
 *
 * Register record exchanged by get/set context. Which register groups the
 * record carries is selected by `ContextFlags`; the caller-visible form is
 * a fixed-size little-endian byte record validated at the boundary.
 */

use crate::core::errors::{KernelError, KernelResult};
use crate::core::types::ProcessorMode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Register groups present in a context record
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ContextFlags(pub u32);

impl ContextFlags {
    /// Architecture tag every valid flag set carries
    pub const ARCH: ContextFlags = ContextFlags(0x0010_0000);
    pub const CONTROL: ContextFlags = ContextFlags(0x0010_0001);
    pub const INTEGER: ContextFlags = ContextFlags(0x0010_0002);
    pub const SEGMENTS: ContextFlags = ContextFlags(0x0010_0004);
    pub const FLOATING_POINT: ContextFlags = ContextFlags(0x0010_0008);
    pub const DEBUG_REGISTERS: ContextFlags = ContextFlags(0x0010_0010);
    pub const FULL: ContextFlags = ContextFlags(0x0010_000B);
    pub const ALL: ContextFlags = ContextFlags(0x0010_001F);

    #[inline]
    pub const fn contains(self, other: ContextFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn union(self, other: ContextFlags) -> ContextFlags {
        ContextFlags(self.0 | other.0)
    }

    /// Reject flag sets without the architecture tag or with unknown groups
    pub fn validate(self) -> KernelResult<()> {
        if !self.contains(Self::ARCH) {
            return Err(KernelError::InvalidParameter(format!(
                "context flags 0x{:08X} lack the architecture tag",
                self.0
            )));
        }
        if self.0 & !Self::ALL.0 != 0 {
            return Err(KernelError::InvalidParameter(format!(
                "context flags 0x{:08X} name unknown register groups",
                self.0
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ContextFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextFlags(0x{:08X})", self.0)
    }
}

/// User code selector forced on user-mode contexts
pub const USER_CS: u16 = 0x33;
/// User stack selector forced on user-mode contexts
pub const USER_SS: u16 = 0x2B;
/// Flag bits user code may change
const USER_EFLAGS_MASK: u32 = 0x0000_0DD5;
/// Interrupts stay enabled in user mode
const EFLAGS_IF: u32 = 0x0000_0200;
/// Highest user-mode address debug registers may point at
const HIGHEST_USER_ADDRESS: u64 = 0x0000_7FFF_FFFE_FFFF;
/// DR7 enable and condition bits user code may set
const USER_DR7_MASK: u64 = 0xFFFF_0155;

/// Register state of a thread
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub flags: ContextFlags,
    // CONTROL
    pub ip: u64,
    pub sp: u64,
    pub eflags: u32,
    pub seg_cs: u16,
    pub seg_ss: u16,
    // INTEGER
    pub gpr: [u64; 16],
    // SEGMENTS
    pub seg_ds: u16,
    pub seg_es: u16,
    pub seg_fs: u16,
    pub seg_gs: u16,
    // FLOATING_POINT
    pub fp_control: u16,
    pub fp_status: u16,
    pub xmm: [u128; 16],
    // DEBUG_REGISTERS: dr0..dr3, dr6, dr7
    pub dr: [u64; 6],
}

impl Default for Context {
    fn default() -> Self {
        Self {
            flags: ContextFlags::ALL,
            ip: 0,
            sp: 0,
            eflags: EFLAGS_IF,
            seg_cs: USER_CS,
            seg_ss: USER_SS,
            gpr: [0; 16],
            seg_ds: USER_SS,
            seg_es: USER_SS,
            seg_fs: 0x53,
            seg_gs: USER_SS,
            fp_control: 0x027F,
            fp_status: 0,
            xmm: [0; 16],
            dr: [0; 6],
        }
    }
}

impl Context {
    /// Size of the caller-visible record
    pub const RECORD_SIZE: usize = 4 + 4 + 8 + 8 + 2 + 2 + 16 * 8 + 4 * 2 + 2 + 2 + 16 * 16 + 6 * 8;

    /// Empty record requesting the groups in `flags`
    pub fn request(flags: ContextFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    /// Copy the groups named by `flags` out of a thread's live registers
    pub fn capture(frame: &Context, flags: ContextFlags) -> Context {
        let mut out = Context::request(flags);
        out.copy_groups(frame, flags);
        out
    }

    /// Write the groups this record carries into a thread's live registers
    pub fn apply_to(&self, frame: &mut Context, mode: ProcessorMode) {
        let mut incoming = self.clone();
        if mode == ProcessorMode::User {
            incoming.sanitize_for_user();
        }
        frame.copy_groups(&incoming, self.flags);
    }

    fn copy_groups(&mut self, src: &Context, flags: ContextFlags) {
        if flags.contains(ContextFlags::CONTROL) {
            self.ip = src.ip;
            self.sp = src.sp;
            self.eflags = src.eflags;
            self.seg_cs = src.seg_cs;
            self.seg_ss = src.seg_ss;
        }
        if flags.contains(ContextFlags::INTEGER) {
            self.gpr = src.gpr;
        }
        if flags.contains(ContextFlags::SEGMENTS) {
            self.seg_ds = src.seg_ds;
            self.seg_es = src.seg_es;
            self.seg_fs = src.seg_fs;
            self.seg_gs = src.seg_gs;
        }
        if flags.contains(ContextFlags::FLOATING_POINT) {
            self.fp_control = src.fp_control;
            self.fp_status = src.fp_status;
            self.xmm = src.xmm;
        }
        if flags.contains(ContextFlags::DEBUG_REGISTERS) {
            self.dr = src.dr;
        }
    }

    /// Strip anything user mode may not set
    fn sanitize_for_user(&mut self) {
        self.eflags = (self.eflags & USER_EFLAGS_MASK) | EFLAGS_IF;
        self.seg_cs = USER_CS;
        self.seg_ss = USER_SS;
        for dr in &mut self.dr[..4] {
            if *dr > HIGHEST_USER_ADDRESS {
                *dr = 0;
            }
        }
        self.dr[5] &= USER_DR7_MASK;
    }

    /// Encode as the caller-visible record
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::RECORD_SIZE);
        out.extend_from_slice(&self.flags.0.to_le_bytes());
        out.extend_from_slice(&self.eflags.to_le_bytes());
        out.extend_from_slice(&self.ip.to_le_bytes());
        out.extend_from_slice(&self.sp.to_le_bytes());
        out.extend_from_slice(&self.seg_cs.to_le_bytes());
        out.extend_from_slice(&self.seg_ss.to_le_bytes());
        for r in &self.gpr {
            out.extend_from_slice(&r.to_le_bytes());
        }
        for s in [self.seg_ds, self.seg_es, self.seg_fs, self.seg_gs] {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out.extend_from_slice(&self.fp_control.to_le_bytes());
        out.extend_from_slice(&self.fp_status.to_le_bytes());
        for x in &self.xmm {
            out.extend_from_slice(&x.to_le_bytes());
        }
        for d in &self.dr {
            out.extend_from_slice(&d.to_le_bytes());
        }
        out
    }

    /// Decode a caller-supplied record
    pub fn from_bytes(bytes: &[u8]) -> KernelResult<Context> {
        if bytes.len() != Self::RECORD_SIZE {
            return Err(KernelError::BufferValidation {
                reason: format!(
                    "context record is {} bytes, expected {}",
                    bytes.len(),
                    Self::RECORD_SIZE
                ),
            });
        }
        let mut reader = RecordReader { bytes, pos: 0 };
        let flags = ContextFlags(reader.u32());
        let eflags = reader.u32();
        let ip = reader.u64();
        let sp = reader.u64();
        let seg_cs = reader.u16();
        let seg_ss = reader.u16();
        let gpr = std::array::from_fn(|_| reader.u64());
        let seg_ds = reader.u16();
        let seg_es = reader.u16();
        let seg_fs = reader.u16();
        let seg_gs = reader.u16();
        let fp_control = reader.u16();
        let fp_status = reader.u16();
        let xmm = std::array::from_fn(|_| reader.u128());
        let dr = std::array::from_fn(|_| reader.u64());
        Ok(Context {
            flags,
            ip,
            sp,
            eflags,
            seg_cs,
            seg_ss,
            gpr,
            seg_ds,
            seg_es,
            seg_fs,
            seg_gs,
            fp_control,
            fp_status,
            xmm,
            dr,
        })
    }

    /// Copy the encoded record into a caller buffer of exactly the record size
    pub fn write_to(&self, buffer: &mut [u8]) -> KernelResult<()> {
        if buffer.len() != Self::RECORD_SIZE {
            return Err(KernelError::BufferValidation {
                reason: format!(
                    "context buffer is {} bytes, expected {}",
                    buffer.len(),
                    Self::RECORD_SIZE
                ),
            });
        }
        buffer.copy_from_slice(&self.to_bytes());
        Ok(())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("flags", &self.flags)
            .field("ip", &format_args!("0x{:X}", self.ip))
            .field("sp", &format_args!("0x{:X}", self.sp))
            .field("eflags", &format_args!("0x{:X}", self.eflags))
            .finish_non_exhaustive()
    }
}

/// Length was checked up front, so reads never run past the end
struct RecordReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl RecordReader<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }

    fn u128(&mut self) -> u128 {
        u128::from_le_bytes(self.take())
    }
}
