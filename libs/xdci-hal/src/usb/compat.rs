//! Register access primitives.
//!
//! Everything above this module talks to hardware through a [`RegisterBank`], so the same
//! driver code runs against real MMIO ([`PhysMmio`]) and against the reactive mock used by the
//! unit tests.

use core::sync::atomic::{compiler_fence, Ordering};

use super::DeviceError;

/// 32-bit register file addressed by byte offset from a base.
///
/// Reads and writes never fail and never retry; validation is the caller's job.
pub trait RegisterBank {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
    /// Base address of the bank, used for diagnostics only.
    fn base(&self) -> usize;
}

impl<T: RegisterBank + ?Sized> RegisterBank for &T {
    fn read32(&self, offset: usize) -> u32 { (**self).read32(offset) }

    fn write32(&self, offset: usize, value: u32) { (**self).write32(offset, value) }

    fn base(&self) -> usize { (**self).base() }
}

/// Volatile access to a physically mapped register window.
#[derive(Debug)]
pub struct PhysMmio {
    base: *mut u32,
}

impl PhysMmio {
    /// Wrap a mapped register window.
    ///
    /// # Safety
    ///
    /// `base` must point at the xDCI register window, mapped uncached, and stay valid for the
    /// lifetime of the returned object. Nothing else may hold a conflicting mapping.
    pub unsafe fn new(base: usize) -> Result<Self, DeviceError> {
        if base == 0 || base & 0x3 != 0 {
            return Err(DeviceError::InvalidParameter);
        }
        Ok(PhysMmio { base: base as *mut u32 })
    }
}

impl RegisterBank for PhysMmio {
    fn read32(&self, offset: usize) -> u32 {
        // prevent re-ordering
        compiler_fence(Ordering::SeqCst);
        unsafe { self.base.add(offset / 4).read_volatile() }
    }

    fn write32(&self, offset: usize, value: u32) {
        unsafe { self.base.add(offset / 4).write_volatile(value) };
        // Ensure the compiler doesn't re-order the write.
        compiler_fence(Ordering::SeqCst);
    }

    fn base(&self) -> usize { self.base as usize }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Register {
    /// Offset of this register in bytes from the bank base
    offset: usize,
    /// Mask of the implemented bits
    mask: u32,
}
impl Register {
    pub const fn new(offset: usize, mask: u32) -> Register { Register { offset, mask } }

    /// Select the `index`-th copy of a register replicated every `stride` bytes.
    pub const fn at(&self, index: usize, stride: usize) -> Register {
        Register { offset: self.offset + index * stride, mask: self.mask }
    }

    pub const fn offset(&self) -> usize { self.offset }

    pub const fn mask(&self) -> u32 { self.mask }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Field {
    /// A bitmask we use to AND to the value, unshifted.
    /// E.g. for a width of `3` bits, this mask would be 0b111.
    mask: u32,
    /// Offset of the first bit in this field
    offset: usize,
    /// A copy of the register address that this field
    /// is a member of. Ideally this is optimized out by the
    /// compiler.
    register: Register,
}
impl Field {
    /// Define a new CSR field with the given width at a specified
    /// offset from the start of the register.
    pub const fn new(width: usize, offset: usize, register: Register) -> Field {
        let mask = if width >= 32 { u32::MAX } else { (1u32 << width) - 1 };
        Field { mask, offset, register }
    }

    /// The same field inside the `index`-th copy of a replicated register.
    pub const fn at(&self, index: usize, stride: usize) -> Field {
        Field { mask: self.mask, offset: self.offset, register: self.register.at(index, stride) }
    }

    pub const fn offset(&self) -> usize { self.offset }

    pub const fn mask(&self) -> u32 { self.mask }

    pub const fn register(&self) -> Register { self.register }

    /// The field's bits in place, e.g. for OR-ing into a command word.
    pub const fn bits(&self) -> u32 { self.mask << self.offset }
}

/// Field-level accessor over a [`RegisterBank`].
#[derive(Debug)]
pub struct Csr<B> {
    bank: B,
}
impl<B: RegisterBank> Csr<B> {
    pub fn new(bank: B) -> Self { Csr { bank } }

    pub fn bank(&self) -> &B { &self.bank }

    /// Read the contents of this register
    pub fn r(&self, reg: Register) -> u32 { self.bank.read32(reg.offset()) & reg.mask() }

    /// Read a field from this CSR
    pub fn rf(&self, field: Field) -> u32 {
        (self.bank.read32(field.register().offset()) >> field.offset()) & field.mask()
    }

    /// Read-modify-write a given field in this CSR
    pub fn rmwf(&self, field: Field, value: u32) {
        let previous = self.bank.read32(field.register().offset()) & !field.bits();
        self.bank.write32(field.register().offset(), previous | ((value & field.mask()) << field.offset()));
    }

    /// Write a given field without reading it first
    pub fn wfo(&self, field: Field, value: u32) {
        self.bank.write32(field.register().offset(), (value & field.mask()) << field.offset());
    }

    /// Write the entire contents of a register without reading it first
    pub fn wo(&self, reg: Register, value: u32) { self.bank.write32(reg.offset(), value) }

    /// Zero a field from a provided value
    pub fn zf(&self, field: Field, value: u32) -> u32 { value & !field.bits() }

    /// Shift & mask a value to its final field position
    pub fn ms(&self, field: Field, value: u32) -> u32 { (value & field.mask()) << field.offset() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::mock::MockXdci;

    const TEST_REG: Register = Register::new(0x40, 0xFFFF_FFFF);
    const TEST_LO: Field = Field::new(4, 0, TEST_REG);
    const TEST_MID: Field = Field::new(7, 3, TEST_REG);
    const TEST_TOP: Field = Field::new(1, 31, TEST_REG);

    #[test]
    fn field_masks() {
        assert_eq!(TEST_LO.mask(), 0xF);
        assert_eq!(TEST_MID.bits(), 0x7F << 3);
        assert_eq!(TEST_TOP.bits(), 0x8000_0000);
        assert_eq!(Field::new(32, 0, TEST_REG).mask(), u32::MAX);
    }

    #[test]
    fn indexed_banks() {
        let r = TEST_REG.at(3, 16);
        assert_eq!(r.offset(), 0x40 + 48);
        assert_eq!(TEST_MID.at(2, 4).register().offset(), 0x48);
    }

    #[test]
    fn rmw_preserves_neighbors() {
        let mock = MockXdci::new();
        let csr = Csr::new(&mock);
        csr.wo(TEST_REG, 0xFFFF_FFFF);
        csr.rmwf(TEST_MID, 5);
        assert_eq!(csr.rf(TEST_MID), 5);
        assert_eq!(csr.r(TEST_REG), !(0x7F << 3) | (5 << 3));
        csr.wfo(TEST_TOP, 1);
        assert_eq!(csr.r(TEST_REG), 0x8000_0000);
        assert_eq!(csr.zf(TEST_TOP, 0x8000_0001), 1);
        assert_eq!(csr.ms(TEST_LO, 0x1F), 0xF);
    }

    #[test]
    fn null_base_rejected() {
        assert_eq!(unsafe { PhysMmio::new(0) }.err(), Some(DeviceError::InvalidParameter));
        assert_eq!(unsafe { PhysMmio::new(0x1002) }.err(), Some(DeviceError::InvalidParameter));
    }
}
