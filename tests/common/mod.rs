//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use digest::Digest;
use sha1::Sha1;

use spool::{AioEventHandler, AioReader, AioResult, AioWriter, BufferEventQueue, WaiterRef};

/// Drives `reader` into `writer` from an event queue, hashing the
/// pulled stream. Returns the number of bytes pulled and the SHA-1 of
/// the stream.
pub fn copy_hashed(
    reader: &mut dyn AioReader,
    writer: &mut dyn AioWriter,
) -> Result<(u64, [u8; 20]), String> {
    let events = BufferEventQueue::new();
    let handler = Arc::clone(&events) as Arc<dyn AioEventHandler>;
    let mut hasher = Sha1::new();
    let mut pulled = 0u64;

    loop {
        match reader.get_buffer(WaiterRef::Events(&handler)) {
            (AioResult::Wait, _) => {
                events.next();
            }
            (AioResult::Error, _) => return Err(format!("reader '{}' failed", reader.name())),
            (AioResult::Ok, None) => break,
            (AioResult::Ok, Some(lease)) => {
                hasher.update(lease.readable());
                pulled += lease.len() as u64;
                match writer.add_buffer(lease, WaiterRef::Events(&handler)) {
                    AioResult::Ok => {}
                    AioResult::Wait => {
                        events.next();
                    }
                    AioResult::Error => {
                        return Err(format!("writer '{}' failed", writer.name()));
                    }
                }
            }
        }
    }

    loop {
        match writer.finalize(WaiterRef::Events(&handler)) {
            AioResult::Ok => return Ok((pulled, hasher.finalize().into())),
            AioResult::Wait => {
                events.next();
            }
            AioResult::Error => return Err(format!("writer '{}' failed finalize", writer.name())),
        }
    }
}

/// Deterministic pseudo-random test payload.
pub fn test_data(len: usize) -> Vec<u8> {
    let mut state = 0x9e37_79b9_7f4a_7c15u64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

/// SHA-1 of `data` in one shot.
pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}
