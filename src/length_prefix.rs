use anyhow::bail;
use bytes::{Buf, BufMut};

use crate::error::FrameError;

/// Longest length that is encoded in the single-byte short form
pub const MAX_SHORT_FORM_LEN: u64 = 0x7f;

const LONG_FORM_FLAG: u8 = 0x80;
const MAX_LENGTH_OF_LENGTH: usize = size_of::<u64>();


/// A length prefix as found at the front of a buffer: `prefix_len` is the number of bytes the
///  prefix itself occupies, `len` the length it announces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthPrefix {
    pub prefix_len: usize,
    pub len: u64,
}

pub fn serialized_len(len: usize) -> usize {
    let len = len as u64;
    if len <= MAX_SHORT_FORM_LEN {
        1
    }
    else {
        1 + num_length_bytes(len)
    }
}

fn num_length_bytes(len: u64) -> usize {
    (size_of::<u64>() - (len.leading_zeros() / 8) as usize).max(1)
}

pub fn put_length_prefix(buf: &mut impl BufMut, len: usize) {
    let len = len as u64;
    if len <= MAX_SHORT_FORM_LEN {
        buf.put_u8(len as u8);
        return;
    }

    let length_of_length = num_length_bytes(len);
    buf.put_u8(LONG_FORM_FLAG | length_of_length as u8);
    buf.put_uint(len, length_of_length);
}

/// Looks at the length prefix at the start of `buf` without consuming anything.
///
/// `Ok(None)` means that more bytes are needed to tell. A long form prefix with zero length
///  bytes is treated the same way rather than as an error, to tolerate truncated reads.
pub fn peek_length_prefix(buf: &[u8]) -> Result<Option<LengthPrefix>, FrameError> {
    let Some(&tag) = buf.first() else {
        return Ok(None);
    };

    if tag & LONG_FORM_FLAG == 0 {
        return Ok(Some(LengthPrefix { prefix_len: 1, len: tag as u64 }));
    }

    let length_of_length = (tag & !LONG_FORM_FLAG) as usize;
    if length_of_length == 0 {
        return Ok(None);
    }
    if length_of_length > MAX_LENGTH_OF_LENGTH {
        return Err(FrameError::LengthOfLengthTooLarge { length_of_length });
    }
    if buf.len() < 1 + length_of_length {
        return Ok(None);
    }

    let len = (&buf[1..1 + length_of_length]).get_uint(length_of_length);
    if len <= MAX_SHORT_FORM_LEN {
        return Err(FrameError::NonMinimalLength { len });
    }

    Ok(Some(LengthPrefix { prefix_len: 1 + length_of_length, len }))
}

/// Reads and consumes a length prefix for a field that must be completely present in `buf`
pub fn try_get_length_prefix(buf: &mut impl Buf) -> anyhow::Result<usize> {
    if !buf.has_remaining() {
        bail!("buffer underflow reading length prefix");
    }
    let tag = buf.get_u8();
    if tag & LONG_FORM_FLAG == 0 {
        return Ok(tag as usize);
    }

    let length_of_length = (tag & !LONG_FORM_FLAG) as usize;
    if length_of_length == 0 || length_of_length > MAX_LENGTH_OF_LENGTH {
        bail!("invalid length of length: {}", length_of_length);
    }
    if buf.remaining() < length_of_length {
        bail!("buffer underflow reading {} length bytes", length_of_length);
    }

    let len = buf.get_uint(length_of_length);
    if len <= MAX_SHORT_FORM_LEN {
        return Err(FrameError::NonMinimalLength { len }.into());
    }
    Ok(usize::try_from(len)?)
}
