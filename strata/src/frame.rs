use crate::interface::Interface;
use crate::pool::PoolShared;
use crate::wire::PacketType;
use bedrock::auth::AuthLevel;
use bedrock::error::{Error, Result};
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;

/// Transport address of the peer a frame arrived from or is destined to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddr {
    Unspecified,
    Udp(SocketAddr),
}

/// Metadata stamped on a received frame by the delivering interface.
#[derive(Clone)]
pub struct RxMeta {
    /// Interface the frame arrived on; responses go back out through it.
    pub interface: Arc<dyn Interface>,
    pub auth: AuthLevel,
    pub packet_type: PacketType,
    pub peer: PeerAddr,
}

/// Metadata stamped on a frame queued for transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxMeta {
    /// Authentication the transport must apply on the way out.
    pub auth: AuthLevel,
    /// Transport-level type tag, carried in front of the payload.
    pub type_tag: u8,
    pub flags: u8,
    pub peer: PeerAddr,
}

/// Typed user-metadata carried inline with every frame.
#[derive(Clone)]
pub enum Metadata {
    None,
    Rx(RxMeta),
    Tx(TxMeta),
}

/// A fixed-capacity contiguous byte region with a movable start (`head`)
/// and size (`len`). The head cursor provides prepend headroom so payloads
/// can be written at offset zero and transport headers revealed later
/// without copying; the region past `head + len` is append tailroom.
///
/// Frames allocated from a [`crate::pool::FramePool`] return their storage
/// to the pool when dropped. Ownership is moved, never aliased: a frame
/// handed to [`Interface::queue`] must not be touched again.
pub struct Frame {
    storage: Box<[u8]>,
    head: usize,
    len: usize,
    meta: Metadata,
    pool: Option<Arc<PoolShared>>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("head", &self.head)
            .field("len", &self.len)
            .field("capacity", &self.storage.len())
            .finish()
    }
}

impl Frame {
    /// Standalone frame, not associated with any pool.
    #[inline]
    pub fn new(capacity: usize) -> Frame {
        Frame::with_reserve(capacity, 0)
    }

    /// Standalone frame with the start pushed forward by `reserve` bytes.
    #[inline]
    pub fn with_reserve(capacity: usize, reserve: usize) -> Frame {
        if reserve > capacity {
            panic!("Reserve {} exceeds frame capacity {}", reserve, capacity);
        }

        Frame {
            storage: vec![0u8; capacity].into_boxed_slice(),
            head: reserve,
            len: 0,
            meta: Metadata::None,
            pool: None,
        }
    }

    /// Wrap pool storage into a frame. Used by the pool allocator only.
    #[inline]
    pub(crate) fn from_storage(storage: Box<[u8]>, reserve: usize, pool: Arc<PoolShared>) -> Frame {
        if reserve > storage.len() {
            panic!("Reserve {} exceeds frame capacity {}", reserve, storage.len());
        }

        Frame {
            storage,
            head: reserve,
            len: 0,
            meta: Metadata::None,
            pool: Some(pool),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Current payload size.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes available in front of the payload for `prepend`.
    #[inline]
    pub fn headroom(&self) -> usize {
        self.head
    }

    /// Bytes available past the payload for `append`.
    #[inline]
    pub fn tailroom(&self) -> usize {
        self.storage.len() - self.head - self.len
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.storage[self.head..self.head + self.len]
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.head..self.head + self.len]
    }

    /// Push the start cursor forward, growing the headroom. Only valid on
    /// an empty frame, before any payload has been written.
    #[inline]
    pub fn reserve(&mut self, count: usize) -> Result<()> {
        if self.len != 0 {
            panic!("Reserve is only valid on an empty frame");
        }

        if count > self.tailroom() {
            return Err(Error::NoMemory);
        }

        self.head += count;
        Ok(())
    }

    /// Extend the payload into the tailroom, returning the newly revealed
    /// region for the caller to fill.
    #[inline]
    pub fn append(&mut self, count: usize) -> Result<&mut [u8]> {
        if count > self.tailroom() {
            return Err(Error::NoMemory);
        }

        let start = self.head + self.len;
        self.len += count;
        Ok(&mut self.storage[start..start + count])
    }

    /// Append a copy of `data` to the payload.
    #[inline]
    pub fn extend_from_slice(&mut self, data: &[u8]) -> Result<()> {
        self.append(data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Move the start cursor back, revealing `count` bytes of header room
    /// in front of the current payload.
    #[inline]
    pub fn prepend(&mut self, count: usize) -> Result<&mut [u8]> {
        if count > self.head {
            return Err(Error::NoMemory);
        }

        self.head -= count;
        self.len += count;
        Ok(&mut self.storage[self.head..self.head + count])
    }

    /// Advance the start cursor past `count` consumed payload bytes.
    #[inline]
    pub fn consume(&mut self, count: usize) -> Result<()> {
        if count > self.len {
            return Err(Error::InvalidArgument);
        }

        self.head += count;
        self.len -= count;
        Ok(())
    }

    /// Shrink the payload to at most `len` bytes.
    #[inline]
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }

    #[inline]
    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    #[inline]
    pub fn set_meta(&mut self, meta: Metadata) {
        self.meta = meta;
    }

    #[inline]
    pub fn rx_meta(&self) -> Option<&RxMeta> {
        match &self.meta {
            Metadata::Rx(meta) => Some(meta),
            _ => None,
        }
    }

    #[inline]
    pub fn tx_meta(&self) -> Option<&TxMeta> {
        match &self.meta {
            Metadata::Tx(meta) => Some(meta),
            _ => None,
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.reclaim(mem::take(&mut self.storage));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_payload() {
        let mut frame = Frame::new(16);

        frame.extend_from_slice(&[1, 2, 3]).unwrap();

        assert_eq!(frame.len(), 3);
        assert_eq!(frame.payload(), &[1, 2, 3]);
        assert_eq!(frame.tailroom(), 13);
        assert_eq!(frame.headroom(), 0);
    }

    #[test]
    fn test_append_overrun() {
        let mut frame = Frame::new(4);

        assert_eq!(frame.extend_from_slice(&[0; 5]).unwrap_err(), Error::NoMemory);
        assert_eq!(frame.len(), 0);
    }

    #[test]
    fn test_reserve_and_prepend() {
        let mut frame = Frame::with_reserve(16, 4);

        frame.extend_from_slice(&[9, 9]).unwrap();

        let header = frame.prepend(4).unwrap();
        header.copy_from_slice(&[1, 2, 3, 4]);

        assert_eq!(frame.payload(), &[1, 2, 3, 4, 9, 9]);
        assert_eq!(frame.headroom(), 0);
    }

    #[test]
    fn test_prepend_insufficient_headroom() {
        let mut frame = Frame::with_reserve(16, 2);

        assert_eq!(frame.prepend(3).unwrap_err(), Error::NoMemory);
    }

    #[test]
    fn test_consume() {
        let mut frame = Frame::new(8);

        frame.extend_from_slice(&[1, 2, 3, 4]).unwrap();
        frame.consume(2).unwrap();

        assert_eq!(frame.payload(), &[3, 4]);
        assert_eq!(frame.consume(3).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn test_truncate() {
        let mut frame = Frame::new(8);

        frame.extend_from_slice(&[1, 2, 3, 4]).unwrap();
        frame.truncate(1);

        assert_eq!(frame.payload(), &[1]);

        // Growing via truncate is not possible.
        frame.truncate(10);
        assert_eq!(frame.len(), 1);
    }

    #[test]
    #[should_panic(expected = "Reserve 10 exceeds frame capacity 4")]
    fn test_reserve_exceeds_capacity() {
        let _ = Frame::with_reserve(4, 10);
    }
}
