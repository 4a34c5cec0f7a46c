use super::{Cell, CellType, Error, Result};
use bytes::{Buf, BufMut, Bytes};

// Cellvec wire layout: u16 cell count, then per cell a one-byte type tag
// (0 for null) and a u32-length-prefixed payload. Integers are little-endian.

const NULL_TAG: u8 = 0;

/// Serialized size of a cell row, without encoding it.
pub fn encoded_cells_len(cells: &[Cell]) -> usize {
    2 + cells.iter().map(|c| 1 + 4 + c.payload_len()).sum::<usize>()
}

pub fn encode_cells(cells: &[Cell]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_cells_len(cells));
    buf.put_u16_le(cells.len() as u16);
    for cell in cells {
        match cell {
            Cell::Null => {
                buf.put_u8(NULL_TAG);
                buf.put_u32_le(0);
            }
            Cell::Bool(v) => {
                buf.put_u8(CellType::Bool as u8);
                buf.put_u32_le(1);
                buf.put_u8(*v as u8);
            }
            Cell::Int32(v) => {
                buf.put_u8(CellType::Int32 as u8);
                buf.put_u32_le(4);
                buf.put_i32_le(*v);
            }
            Cell::Uint32(v) => {
                buf.put_u8(CellType::Uint32 as u8);
                buf.put_u32_le(4);
                buf.put_u32_le(*v);
            }
            Cell::Int64(v) => {
                buf.put_u8(CellType::Int64 as u8);
                buf.put_u32_le(8);
                buf.put_i64_le(*v);
            }
            Cell::Uint64(v) => {
                buf.put_u8(CellType::Uint64 as u8);
                buf.put_u32_le(8);
                buf.put_u64_le(*v);
            }
            Cell::Utf8(v) => {
                buf.put_u8(CellType::Utf8 as u8);
                buf.put_u32_le(v.len() as u32);
                buf.put_slice(v.as_bytes());
            }
            Cell::Bytes(v) => {
                buf.put_u8(CellType::Bytes as u8);
                buf.put_u32_le(v.len() as u32);
                buf.put_slice(v);
            }
            Cell::Timestamp(v) => {
                buf.put_u8(CellType::Timestamp as u8);
                buf.put_u32_le(8);
                buf.put_u64_le(*v);
            }
        }
    }
    buf
}

pub fn decode_cells(mut buf: &[u8]) -> Result<Vec<Cell>> {
    let total = buf.len();
    let truncated = |rem: &[u8]| Error::Truncated(total - rem.len());

    if buf.remaining() < 2 {
        return Err(truncated(buf));
    }
    let count = buf.get_u16_le() as usize;
    let mut cells = Vec::with_capacity(count);

    for _ in 0..count {
        if buf.remaining() < 5 {
            return Err(truncated(buf));
        }
        let tag = buf.get_u8();
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(truncated(buf));
        }
        let payload = &buf[..len];

        let cell = match tag {
            NULL_TAG => Cell::Null,
            tag => match CellType::from_tag(tag).ok_or(Error::UnknownTypeTag(tag))? {
                CellType::Bool => Cell::Bool(*payload.first().ok_or(Error::Truncated(0))? != 0),
                CellType::Int32 => Cell::Int32(i32::from_le_bytes(fixed(payload)?)),
                CellType::Uint32 => Cell::Uint32(u32::from_le_bytes(fixed(payload)?)),
                CellType::Int64 => Cell::Int64(i64::from_le_bytes(fixed(payload)?)),
                CellType::Uint64 => Cell::Uint64(u64::from_le_bytes(fixed(payload)?)),
                CellType::Utf8 => Cell::Utf8(
                    std::str::from_utf8(payload).map_err(|_| Error::InvalidUtf8)?.to_string(),
                ),
                CellType::Bytes => Cell::Bytes(Bytes::copy_from_slice(payload)),
                CellType::Timestamp => Cell::Timestamp(u64::from_le_bytes(fixed(payload)?)),
            },
        };
        cells.push(cell);
        buf.advance(len);
    }
    Ok(cells)
}

fn fixed<const N: usize>(payload: &[u8]) -> Result<[u8; N]> {
    payload.try_into().map_err(|_| Error::Truncated(0))
}
