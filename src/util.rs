use embedded_can::{ExtendedId, Frame, Id, StandardId};

use crate::error::TransportError;

/// Map a numeric COB-ID onto a CAN identifier, 11-bit when it fits.
pub fn cob_id_to_id(cob_id: u32) -> Result<Id, TransportError> {
    let id = if cob_id <= StandardId::MAX.as_raw() as u32 {
        StandardId::new(cob_id as u16).map(Id::Standard)
    } else {
        ExtendedId::new(cob_id).map(Id::Extended)
    };
    id.ok_or(TransportError::InvalidId(cob_id))
}

pub fn id_to_cob_id(id: Id) -> u32 {
    match id {
        Id::Standard(sid) => sid.as_raw() as u32,
        Id::Extended(eid) => eid.as_raw(),
    }
}

pub fn get_cob_id<F: Frame>(frame: &F) -> u32 {
    id_to_cob_id(frame.id())
}

pub fn create_frame<F: Frame>(cob_id: u32, data: &[u8]) -> Result<F, TransportError> {
    if data.len() > 8 {
        return Err(TransportError::PayloadTooLong(data.len()));
    }
    F::new(cob_id_to_id(cob_id)?, data).ok_or(TransportError::PayloadTooLong(data.len()))
}

pub fn create_remote_frame<F: Frame>(cob_id: u32, dlc: usize) -> Result<F, TransportError> {
    F::new_remote(cob_id_to_id(cob_id)?, dlc).ok_or(TransportError::PayloadTooLong(dlc))
}

/// Concatenate slices into one 8-byte frame payload, zero padded.
pub fn flatten(slices: &[&[u8]]) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (dst, src) in out.iter_mut().zip(slices.iter().flat_map(|s| s.iter())) {
        *dst = *src;
    }
    out
}

/// Little-endian bytes (at most 8) to an unsigned integer.
pub fn le_bytes_to_u64(data: &[u8]) -> u64 {
    data.iter().take(8).rev().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Interpret the low `bits` bits of `value` as a two's complement number.
pub fn sign_extend(value: u64, bits: usize) -> i64 {
    if bits == 0 || bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// Read `length` bits starting at bit `offset`, LSB first.
pub fn get_bits(data: &[u8], offset: usize, length: usize) -> u64 {
    let mut value = 0u64;
    for i in 0..length.min(64) {
        let bit = offset + i;
        let byte = data.get(bit / 8).copied().unwrap_or(0);
        if (byte >> (bit % 8)) & 1 == 1 {
            value |= 1 << i;
        }
    }
    value
}

/// Write the low `length` bits of `value` at bit `offset`, LSB first.
pub fn set_bits(data: &mut [u8], offset: usize, length: usize, value: u64) {
    for i in 0..length.min(64) {
        let bit = offset + i;
        let Some(byte) = data.get_mut(bit / 8) else { return };
        let mask = 1u8 << (bit % 8);
        if (value >> i) & 1 == 1 {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}
