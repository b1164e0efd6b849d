// Box headers: 32-bit size, 64-bit extended size, size-to-EOF.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use crate::Mp4Error;

/// Four-character box type code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub const fn new(code: &[u8; 4]) -> Self {
        FourCC(*code)
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Parsed box header.
#[derive(Debug, Clone, Copy)]
pub struct BoxHeader {
    /// Total box size including the header.
    pub size: u64,
    pub fourcc: FourCC,
    /// 8 for a compact header, 16 when the 64-bit size form is used.
    pub header_len: u64,
}

impl BoxHeader {
    /// Parses a header from the start of `data`.
    ///
    /// `remaining` bounds the size-to-EOF form (`size == 0`). Returns `None`
    /// when fewer than 8 bytes remain.
    pub fn parse(data: &[u8], remaining: u64) -> Result<Option<BoxHeader>, Mp4Error> {
        if data.len() < 8 {
            return Ok(None);
        }

        let size32 = BigEndian::read_u32(&data[0..4]);
        let fourcc = FourCC([data[4], data[5], data[6], data[7]]);

        let (size, header_len) = match size32 {
            0 => (remaining, 8),
            1 => {
                if data.len() < 16 {
                    return Ok(None);
                }
                (BigEndian::read_u64(&data[8..16]), 16)
            }
            n => (u64::from(n), 8),
        };

        if size < header_len {
            return Err(Mp4Error::parse(format!(
                "box `{fourcc}` shorter than its header ({size} bytes)"
            )));
        }

        Ok(Some(BoxHeader {
            size,
            fourcc,
            header_len,
        }))
    }
}

/// Appends a compact box header with a placeholder size, returning the
/// index to patch once the body is written.
pub(crate) fn begin_box(out: &mut Vec<u8>, fourcc: FourCC) -> usize {
    let start = out.len();
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(&fourcc.0);
    start
}

/// Patches the size of a box opened with [`begin_box`].
pub(crate) fn end_box(out: &mut Vec<u8>, start: usize) {
    let size = (out.len() - start) as u32;
    BigEndian::write_u32(&mut out[start..start + 4], size);
}

/// Appends a full-box version/flags word.
pub(crate) fn put_full_box(out: &mut Vec<u8>, version: u8, flags: u32) {
    out.push(version);
    out.push(((flags >> 16) & 0xff) as u8);
    out.push(((flags >> 8) & 0xff) as u8);
    out.push((flags & 0xff) as u8);
}

/// Reads a full-box version/flags word from the start of a body.
pub(crate) fn full_box(body: &[u8]) -> Result<(u8, u32, &[u8]), Mp4Error> {
    if body.len() < 4 {
        return Err(Mp4Error::parse("full box body shorter than version/flags"));
    }

    let version = body[0];
    let flags = u32::from(body[1]) << 16 | u32::from(body[2]) << 8 | u32::from(body[3]);

    Ok((version, flags, &body[4..]))
}
