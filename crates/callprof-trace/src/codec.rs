//! Binary snapshot codec with merge-on-decode.
//!
//! Format (all integers little-endian):
//!
//! ```text
//! snapshot   := u32 count, entry*
//! entry      := u64 address, statistics, callees, callers
//! statistics := u64 times_called, u32 max_reentrance, u64 inclusive_time,
//!               u64 exclusive_time, u64 max_call_time
//! callees    := u32 count, (u64 address, statistics)*
//! callers    := u32 count, (u64 address, u64 calls)*
//! ```
//!
//! Decoding into a non-empty map merges: counters are summed and maxima take
//! the larger value, recursively for callees and callers. Applying the same
//! buffer twice therefore doubles the counters and leaves the maxima alone.

use crate::stats::{
    Address, CalleeMap, CallerMap, DetailedStatistics, FunctionStatistics, StatisticsSnapshot,
    merge_snapshot,
};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use thiserror::Error;

/// Encoded size of [`FunctionStatistics`]
pub const STATISTICS_LEN: usize = 8 + 4 + 8 + 8 + 8;

/// Smallest possible encoded detailed entry (address, statistics, two empty maps)
const MIN_ENTRY_LEN: usize = 8 + STATISTICS_LEN + 4 + 4;
const CALLEE_LEN: usize = 8 + STATISTICS_LEN;
const CALLER_LEN: usize = 8 + 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Truncated input: needed {needed} bytes at offset {offset}, {remaining} remaining")]
    Truncated {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("Count {count} at offset {offset} implies more data than the {remaining} bytes remaining")]
    CountOverrun {
        offset: usize,
        count: u32,
        remaining: usize,
    },

    #[error("Value overflows its fixed width for address 0x{address:x}")]
    Overflow { address: Address },

    #[error("Duplicate address 0x{address:x} in one map")]
    DuplicateKey { address: Address },

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Map of {0} entries does not fit a u32 count")]
    CountOverflow(usize),

    #[error("Encoded snapshot would be {len} bytes, limit is {limit}")]
    TooLarge { len: usize, limit: usize },
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode a snapshot into a new buffer
pub fn encode_snapshot(snapshot: &StatisticsSnapshot) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(encoded_len(snapshot));
    encode_into(snapshot, &mut out)?;
    Ok(out)
}

/// Encode a snapshot whose encoding must not exceed `limit` bytes.
///
/// The size is checked before anything is written.
pub fn encode_limited(snapshot: &StatisticsSnapshot, limit: usize) -> Result<Vec<u8>, EncodeError> {
    let len = encoded_len(snapshot);
    if len > limit {
        return Err(EncodeError::TooLarge { len, limit });
    }
    encode_snapshot(snapshot)
}

/// Append the encoding of a snapshot to `out`
pub fn encode_into(snapshot: &StatisticsSnapshot, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    put_count(out, snapshot.len())?;
    for (&address, entry) in snapshot {
        put_u64(out, address);
        put_statistics(out, &entry.stats);
        encode_callees(&entry.callees, out)?;
        encode_callers(&entry.callers, out)?;
    }
    Ok(())
}

/// Append the encoding of a callee map to `out`
pub fn encode_callees(callees: &CalleeMap, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    put_count(out, callees.len())?;
    for (&address, stats) in callees {
        put_u64(out, address);
        put_statistics(out, stats);
    }
    Ok(())
}

/// Append the encoding of a caller map to `out`
pub fn encode_callers(callers: &CallerMap, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    put_count(out, callers.len())?;
    for (&address, &calls) in callers {
        put_u64(out, address);
        put_u64(out, calls);
    }
    Ok(())
}

/// Exact encoded size of a snapshot
pub fn encoded_len(snapshot: &StatisticsSnapshot) -> usize {
    4 + snapshot
        .values()
        .map(|e| MIN_ENTRY_LEN + e.callees.len() * CALLEE_LEN + e.callers.len() * CALLER_LEN)
        .sum::<usize>()
}

fn put_statistics(out: &mut Vec<u8>, stats: &FunctionStatistics) {
    put_u64(out, stats.times_called);
    put_u32(out, stats.max_reentrance);
    put_u64(out, stats.inclusive_time);
    put_u64(out, stats.exclusive_time);
    put_u64(out, stats.max_call_time);
}

fn put_count(out: &mut Vec<u8>, count: usize) -> Result<(), EncodeError> {
    let count = u32::try_from(count).map_err(|_| EncodeError::CountOverflow(count))?;
    put_u32(out, count);
    Ok(())
}

#[inline]
pub(crate) fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode a buffer into a fresh snapshot
pub fn decode_snapshot(bytes: &[u8]) -> Result<StatisticsSnapshot, DecodeError> {
    let mut reader = Reader::new(bytes);
    let snapshot = read_snapshot(&mut reader)?;
    reader.finish()?;
    Ok(snapshot)
}

/// Decode a buffer and merge it into `target`.
///
/// The buffer is parsed completely and the merge is checked for overflow
/// before anything is written, so on error `target` is left unchanged.
pub fn decode_into(bytes: &[u8], target: &mut StatisticsSnapshot) -> Result<(), DecodeError> {
    let decoded = decode_snapshot(bytes)?;
    check_merge(target, &decoded)?;
    for (address, entry) in decoded {
        match target.entry(address) {
            Entry::Occupied(mut slot) => slot.get_mut().merge(&entry),
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
    }
    Ok(())
}

/// Merge an already decoded snapshot into `target`, all or nothing.
///
/// Fails with [`DecodeError::Overflow`] where a summed counter would
/// overflow; `target` is unchanged in that case.
pub fn merge_checked(
    target: &mut StatisticsSnapshot,
    source: &StatisticsSnapshot,
) -> Result<(), DecodeError> {
    check_merge(target, source)?;
    merge_snapshot(target, source);
    Ok(())
}

/// Verify that merging `source` into `target` cannot overflow any counter
fn check_merge(target: &StatisticsSnapshot, source: &StatisticsSnapshot) -> Result<(), DecodeError> {
    for (&address, entry) in source {
        let Some(existing) = target.get(&address) else {
            continue;
        };
        existing
            .stats
            .checked_merge(&entry.stats)
            .ok_or(DecodeError::Overflow { address })?;
        for (callee, stats) in &entry.callees {
            if let Some(current) = existing.callees.get(callee) {
                current
                    .checked_merge(stats)
                    .ok_or(DecodeError::Overflow { address: *callee })?;
            }
        }
        for (caller, calls) in &entry.callers {
            if let Some(current) = existing.callers.get(caller) {
                current
                    .checked_add(*calls)
                    .ok_or(DecodeError::Overflow { address: *caller })?;
            }
        }
    }
    Ok(())
}

fn read_snapshot(reader: &mut Reader<'_>) -> Result<StatisticsSnapshot, DecodeError> {
    let count = reader.count(MIN_ENTRY_LEN)?;
    let mut snapshot = HashMap::with_capacity(count);
    for _ in 0..count {
        let address = reader.u64()?;
        let stats = read_statistics(reader)?;
        let callees = read_callees(reader)?;
        let callers = read_callers(reader)?;
        let entry = DetailedStatistics {
            stats,
            callees,
            callers,
        };
        if snapshot.insert(address, entry).is_some() {
            return Err(DecodeError::DuplicateKey { address });
        }
    }
    Ok(snapshot)
}

fn read_callees(reader: &mut Reader<'_>) -> Result<CalleeMap, DecodeError> {
    let count = reader.count(CALLEE_LEN)?;
    let mut callees = HashMap::with_capacity(count);
    for _ in 0..count {
        let address = reader.u64()?;
        let stats = read_statistics(reader)?;
        if callees.insert(address, stats).is_some() {
            return Err(DecodeError::DuplicateKey { address });
        }
    }
    Ok(callees)
}

fn read_callers(reader: &mut Reader<'_>) -> Result<CallerMap, DecodeError> {
    let count = reader.count(CALLER_LEN)?;
    let mut callers = HashMap::with_capacity(count);
    for _ in 0..count {
        let address = reader.u64()?;
        let calls = reader.u64()?;
        if callers.insert(address, calls).is_some() {
            return Err(DecodeError::DuplicateKey { address });
        }
    }
    Ok(callers)
}

fn read_statistics(reader: &mut Reader<'_>) -> Result<FunctionStatistics, DecodeError> {
    Ok(FunctionStatistics {
        times_called: reader.u64()?,
        max_reentrance: reader.u32()?,
        inclusive_time: reader.u64()?,
        exclusive_time: reader.u64()?,
        max_call_time: reader.u64()?,
    })
}

/// Bounds-checked little-endian reader over a byte slice
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::Truncated {
                offset: self.offset,
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, DecodeError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    /// Read an element count and check it against the bytes left
    fn count(&mut self, min_element_len: usize) -> Result<usize, DecodeError> {
        let offset = self.offset;
        let count = self.u32()?;
        let needed = (count as usize).checked_mul(min_element_len);
        match needed {
            Some(needed) if needed <= self.remaining() => Ok(count as usize),
            _ => Err(DecodeError::CountOverrun {
                offset,
                count,
                remaining: self.remaining(),
            }),
        }
    }

    pub(crate) fn finish(&self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}
