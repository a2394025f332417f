//! Binary codec helpers shared by the registry types.
//!
//! All multi-byte values are big-endian (network order), which is what
//! [`bytes::Buf`] and [`bytes::BufMut`] use by default. The `Buf::get_*`
//! methods panic on short input, so every read here checks the remaining
//! length first.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Fail with [`Error::Truncated`] unless `needed` bytes remain.
pub fn ensure_remaining(input: &impl Buf, needed: usize) -> Result<()> {
    let remaining = input.remaining();
    if remaining < needed {
        return Err(Error::Truncated { needed, remaining });
    }
    Ok(())
}

pub fn read_i8(input: &mut impl Buf) -> Result<i8> {
    ensure_remaining(&*input, 1)?;
    Ok(input.get_i8())
}

pub fn read_i16(input: &mut impl Buf) -> Result<i16> {
    ensure_remaining(&*input, 2)?;
    Ok(input.get_i16())
}

pub fn read_u16(input: &mut impl Buf) -> Result<u16> {
    ensure_remaining(&*input, 2)?;
    Ok(input.get_u16())
}

pub fn read_i64(input: &mut impl Buf) -> Result<i64> {
    ensure_remaining(&*input, 8)?;
    Ok(input.get_i64())
}

pub fn read_u64(input: &mut impl Buf) -> Result<u64> {
    ensure_remaining(&*input, 8)?;
    Ok(input.get_u64())
}

/// Upper bound on capacity reserved from a decoded count. A count prefix is
/// attacker-controlled; don't trust it for allocation.
pub const MAX_PREALLOC: usize = 256;

/// Read an int16 entry count, rejecting negative values.
pub fn read_count(input: &mut impl Buf) -> Result<usize> {
    let count = read_i16(input)?;
    if count < 0 {
        return Err(Error::InvalidCount(count));
    }
    Ok(count as usize)
}

/// Write an int16 entry count.
pub fn put_count(out: &mut impl BufMut, count: usize) -> Result<()> {
    let count = i16::try_from(count).map_err(|_| Error::TooManyEntries(count))?;
    out.put_i16(count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_reads_report_truncation() {
        let mut input: &[u8] = &[0x01];
        assert_eq!(
            read_i16(&mut input),
            Err(Error::Truncated { needed: 2, remaining: 1 })
        );
        // Nothing was consumed.
        assert_eq!(input.len(), 1);
    }

    #[test]
    fn negative_count_rejected() {
        let mut input: &[u8] = &[0xff, 0xfe];
        assert_eq!(read_count(&mut input), Err(Error::InvalidCount(-2)));
    }

    #[test]
    fn count_overflow_rejected() {
        let mut out = Vec::new();
        assert_eq!(
            put_count(&mut out, 40_000),
            Err(Error::TooManyEntries(40_000))
        );
        put_count(&mut out, 3).unwrap();
        assert_eq!(out, vec![0x00, 0x03]);
    }
}
