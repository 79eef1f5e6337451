#![forbid(unsafe_code)]
//! Fixed-width encoding helpers shared by the on-disk formats.

pub mod be {
    //! Big-endian integer access that checks bounds before every read.
    //!
    //! Decoders run over bytes that came off disk, so a short buffer is
    //! corruption rather than a programming error.

    use crate::types::{Result, StrataError};

    fn array_at<const N: usize>(src: &[u8], off: usize) -> Result<[u8; N]> {
        let end = off
            .checked_add(N)
            .ok_or(StrataError::Corruption("field offset overflow"))?;
        let slice = src
            .get(off..end)
            .ok_or(StrataError::Corruption("buffer truncated before field"))?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    /// Reads a `u16` at `off`.
    pub fn u16_at(src: &[u8], off: usize) -> Result<u16> {
        array_at::<2>(src, off).map(u16::from_be_bytes)
    }

    /// Reads a `u32` at `off`.
    pub fn u32_at(src: &[u8], off: usize) -> Result<u32> {
        array_at::<4>(src, off).map(u32::from_be_bytes)
    }

    /// Reads a `u64` at `off`.
    pub fn u64_at(src: &[u8], off: usize) -> Result<u64> {
        array_at::<8>(src, off).map(u64::from_be_bytes)
    }

    /// Writes a `u32` at `off`.
    pub fn put_u32(dst: &mut [u8], off: usize, v: u32) -> Result<()> {
        put(dst, off, &v.to_be_bytes())
    }

    /// Writes a `u64` at `off`.
    pub fn put_u64(dst: &mut [u8], off: usize, v: u64) -> Result<()> {
        put(dst, off, &v.to_be_bytes())
    }

    fn put(dst: &mut [u8], off: usize, bytes: &[u8]) -> Result<()> {
        let end = off
            .checked_add(bytes.len())
            .ok_or(StrataError::Invalid("field offset overflow"))?;
        let slot = dst
            .get_mut(off..end)
            .ok_or(StrataError::Invalid("destination too small for field"))?;
        slot.copy_from_slice(bytes);
        Ok(())
    }
}
