//! Single producer, single consumer byte rings between the two processors.
//!
//! Every record is a [RecordHeader] followed by the payload. The write offset is only ever
//! stored by the producer and the read offset only by the consumer, so no lock is needed.
//! If a record doesn't fit between the write offset and the end of the buffer, the producer
//! writes [RecordHeader::WRAP] at the write offset and places the record at the start instead.
//! To make that always possible, the write offset never advances to a point, where fewer than
//! [RecordHeader::LENGTH] bytes remain until the end of the buffer. At least one byte always
//! stays unused, so that a full ring can be told apart from an empty one.

use core::{cell::UnsafeCell, ptr, slice};

use bitfield_struct::bitfield;
use portable_atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::sync::Doorbell;

#[bitfield(u32)]
pub struct RecordHeader {
    #[bits(16)]
    pub length: u16,
    /// Wrapping per ring sequence number, only used for diagnostics.
    #[bits(8)]
    pub sequence: u8,
    #[bits(8)]
    pub __: u8,
}
impl RecordHeader {
    pub const LENGTH: usize = 4;
    /// Written at the current offset, if the next record starts at the beginning of the buffer.
    pub const WRAP: u32 = u32::MAX;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RingError {
    /// There is currently not enough space. This is transient.
    Full,
    /// The record would never fit into this ring.
    TooLarge,
    /// The ring can't be reset, while a producer or consumer is attached.
    InUse,
}
pub type RingResult<T> = Result<T, RingError>;

/// Counters maintained by the producer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RingCounters {
    pub packets: u32,
    pub bytes: u32,
    pub dropped_packets: u32,
    pub dropped_bytes: u32,
}

/// A ring buffer of `N` bytes.
pub struct RingChannel<const N: usize> {
    buffer: UnsafeCell<[u8; N]>,
    write_offset: AtomicUsize,
    read_offset: AtomicUsize,
    producer_attached: AtomicBool,
    consumer_attached: AtomicBool,
    packets: AtomicU32,
    bytes: AtomicU32,
    dropped_packets: AtomicU32,
    dropped_bytes: AtomicU32,
    doorbell: Doorbell,
}
// The buffer is only ever accessed in regions exclusively owned by either the producer or the
// consumer, with the offsets establishing the ownership.
unsafe impl<const N: usize> Sync for RingChannel<N> {}
impl<const N: usize> RingChannel<N> {
    const CAPACITY_CHECK: () = assert!(
        N >= 4 * RecordHeader::LENGTH && N <= u16::MAX as usize,
        "Ring capacity out of range."
    );
    /// The largest payload, that could ever be reserved.
    pub const MAX_PAYLOAD: usize = N - 2 * RecordHeader::LENGTH - 1;

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_CHECK;
        Self {
            buffer: UnsafeCell::new([0u8; N]),
            write_offset: AtomicUsize::new(0),
            read_offset: AtomicUsize::new(0),
            producer_attached: AtomicBool::new(false),
            consumer_attached: AtomicBool::new(false),
            packets: AtomicU32::new(0),
            bytes: AtomicU32::new(0),
            dropped_packets: AtomicU32::new(0),
            dropped_bytes: AtomicU32::new(0),
            doorbell: Doorbell::new(),
        }
    }
    pub const fn capacity(&self) -> usize {
        N
    }
    /// Attach the producer. There can only be one at a time.
    pub fn producer(&self) -> Option<RingProducer<'_, N>> {
        (!self.producer_attached.swap(true, Ordering::Acquire)).then(|| RingProducer {
            ring: self,
            sequence: 0,
        })
    }
    /// Attach the consumer. There can only be one at a time.
    pub fn consumer(&self) -> Option<RingConsumer<'_, N>> {
        (!self.consumer_attached.swap(true, Ordering::Acquire)).then(|| RingConsumer { ring: self })
    }
    /// The number of bytes between the read and write offset, including skipped space at the
    /// end of the buffer.
    pub fn bytes_used(&self) -> usize {
        let write_offset = self.write_offset.load(Ordering::Acquire);
        let read_offset = self.read_offset.load(Ordering::Acquire);
        (write_offset + N - read_offset) % N
    }
    pub fn is_empty(&self) -> bool {
        self.bytes_used() == 0
    }
    pub fn counters(&self) -> RingCounters {
        RingCounters {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            dropped_packets: self.dropped_packets.load(Ordering::Relaxed),
            dropped_bytes: self.dropped_bytes.load(Ordering::Relaxed),
        }
    }
    /// Empty the ring and clear the counters.
    pub fn reset(&self) -> RingResult<()> {
        if self.producer_attached.load(Ordering::Acquire)
            || self.consumer_attached.load(Ordering::Acquire)
        {
            return Err(RingError::InUse);
        }
        self.write_offset.store(0, Ordering::Relaxed);
        self.read_offset.store(0, Ordering::Relaxed);
        for counter in [
            &self.packets,
            &self.bytes,
            &self.dropped_packets,
            &self.dropped_bytes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.doorbell.reset();
        Ok(())
    }
    fn base(&self) -> *mut u8 {
        self.buffer.get() as *mut u8
    }
    /// SAFETY: `offset..offset + 4` must be owned by the caller.
    unsafe fn read_header(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; RecordHeader::LENGTH];
        ptr::copy_nonoverlapping(self.base().add(offset), bytes.as_mut_ptr(), bytes.len());
        u32::from_le_bytes(bytes)
    }
    /// SAFETY: `offset..offset + 4` must be owned by the caller.
    unsafe fn write_header(&self, offset: usize, header: u32) {
        let bytes = header.to_le_bytes();
        ptr::copy_nonoverlapping(bytes.as_ptr(), self.base().add(offset), bytes.len());
    }
}
impl<const N: usize> Default for RingChannel<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The writing end of a [RingChannel].
pub struct RingProducer<'a, const N: usize> {
    ring: &'a RingChannel<N>,
    sequence: u8,
}
impl<'a, const N: usize> RingProducer<'a, N> {
    /// Reserve space for a record with a payload of `length` bytes.
    ///
    /// Nothing becomes visible to the consumer until the grant is committed.
    pub fn try_reserve(&mut self, length: usize) -> RingResult<WriteGrant<'_, 'a, N>> {
        if length > RingChannel::<N>::MAX_PAYLOAD {
            return Err(RingError::TooLarge);
        }
        let total = RecordHeader::LENGTH + length;
        let write_offset = self.ring.write_offset.load(Ordering::Relaxed);
        let read_offset = self.ring.read_offset.load(Ordering::Acquire);

        let (offset, wraps) = if write_offset >= read_offset {
            if write_offset + total + RecordHeader::LENGTH <= N {
                (write_offset, false)
            } else if total < read_offset {
                (0, true)
            } else {
                return Err(RingError::Full);
            }
        } else if write_offset + total < read_offset {
            (write_offset, false)
        } else {
            return Err(RingError::Full);
        };
        Ok(WriteGrant {
            producer: self,
            offset,
            length,
            wrap_at: wraps.then_some(write_offset),
        })
    }
    /// Copy `payload` into the ring as one record.
    ///
    /// If the ring is full, the record is dropped and the drop counters are incremented.
    pub fn push(&mut self, payload: &[u8]) -> RingResult<()> {
        self.push_with(payload.len(), |buffer| buffer.copy_from_slice(payload))
    }
    /// Reserve `length` bytes, let `f` fill them and commit the record.
    pub fn push_with(&mut self, length: usize, f: impl FnOnce(&mut [u8])) -> RingResult<()> {
        match self.try_reserve(length) {
            Ok(mut grant) => {
                f(grant.buffer_mut());
                grant.commit();
                Ok(())
            }
            Err(err) => {
                self.record_drop(length);
                Err(err)
            }
        }
    }
    /// Account for a record, that was dropped instead of written.
    pub fn record_drop(&self, length: usize) {
        self.ring.dropped_packets.fetch_add(1, Ordering::Relaxed);
        self.ring
            .dropped_bytes
            .fetch_add(length as u32, Ordering::Relaxed);
        trace!("Ring full, dropped record of {} bytes.", length);
    }
    pub fn ring(&self) -> &'a RingChannel<N> {
        self.ring
    }
}
impl<const N: usize> Drop for RingProducer<'_, N> {
    fn drop(&mut self) {
        self.ring.producer_attached.store(false, Ordering::Release);
    }
}

/// Space reserved for one record. Dropping this without committing abandons the record.
pub struct WriteGrant<'p, 'a, const N: usize> {
    producer: &'p mut RingProducer<'a, N>,
    offset: usize,
    length: usize,
    wrap_at: Option<usize>,
}
impl<const N: usize> WriteGrant<'_, '_, N> {
    /// Offset of the record header in the ring.
    pub fn offset(&self) -> usize {
        self.offset
    }
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        // SAFETY: The reservation lies outside of the region the consumer may read, until
        // the write offset is advanced in commit.
        unsafe {
            slice::from_raw_parts_mut(
                self.producer
                    .ring
                    .base()
                    .add(self.offset + RecordHeader::LENGTH),
                self.length,
            )
        }
    }
    /// Publish the record to the consumer.
    pub fn commit(self) {
        let ring = self.producer.ring;
        let sequence = self.producer.sequence;
        self.producer.sequence = sequence.wrapping_add(1);
        let header = RecordHeader::new()
            .with_length(self.length as u16)
            .with_sequence(sequence);
        unsafe {
            if let Some(wrap_at) = self.wrap_at {
                ring.write_header(wrap_at, RecordHeader::WRAP);
            }
            ring.write_header(self.offset, header.into_bits());
        }
        ring.write_offset.store(
            self.offset + RecordHeader::LENGTH + self.length,
            Ordering::Release,
        );
        ring.packets.fetch_add(1, Ordering::Relaxed);
        ring.bytes.fetch_add(self.length as u32, Ordering::Relaxed);
        ring.doorbell.ring();
    }
}

/// The reading end of a [RingChannel].
pub struct RingConsumer<'a, const N: usize> {
    ring: &'a RingChannel<N>,
}
impl<'a, const N: usize> RingConsumer<'a, N> {
    /// Take the oldest record out of the ring.
    ///
    /// The space is handed back to the producer once the [ReadGrant] is dropped.
    pub fn try_pop(&mut self) -> Option<ReadGrant<'_, 'a, N>> {
        let write_offset = self.ring.write_offset.load(Ordering::Acquire);
        let mut read_offset = self.ring.read_offset.load(Ordering::Relaxed);
        if read_offset == write_offset {
            return None;
        }
        // SAFETY: Everything between the read and write offset belongs to us.
        let mut header = unsafe { self.ring.read_header(read_offset) };
        if header == RecordHeader::WRAP {
            read_offset = 0;
            self.ring.read_offset.store(0, Ordering::Release);
            if write_offset == 0 {
                return None;
            }
            header = unsafe { self.ring.read_header(0) };
        }
        let header = RecordHeader::from_bits(header);
        Some(ReadGrant {
            consumer: self,
            offset: read_offset,
            length: header.length() as usize,
            sequence: header.sequence(),
        })
    }
    /// Wait until there is at least one record in the ring.
    pub async fn wait_for_data(&self) {
        while self.ring.is_empty() {
            self.ring.doorbell.wait().await;
        }
    }
    pub fn ring(&self) -> &'a RingChannel<N> {
        self.ring
    }
}
impl<const N: usize> Drop for RingConsumer<'_, N> {
    fn drop(&mut self) {
        self.ring.consumer_attached.store(false, Ordering::Release);
    }
}

/// A record popped from the ring.
pub struct ReadGrant<'c, 'a, const N: usize> {
    consumer: &'c mut RingConsumer<'a, N>,
    offset: usize,
    length: usize,
    sequence: u8,
}
impl<const N: usize> ReadGrant<'_, '_, N> {
    pub fn offset(&self) -> usize {
        self.offset
    }
    pub fn len(&self) -> usize {
        self.length
    }
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
    pub fn sequence(&self) -> u8 {
        self.sequence
    }
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: The record lies between the read and write offset.
        unsafe {
            slice::from_raw_parts(
                self.consumer
                    .ring
                    .base()
                    .add(self.offset + RecordHeader::LENGTH),
                self.length,
            )
        }
    }
}
impl<const N: usize> Drop for ReadGrant<'_, '_, N> {
    fn drop(&mut self) {
        self.consumer.ring.read_offset.store(
            self.offset + RecordHeader::LENGTH + self.length,
            Ordering::Release,
        );
    }
}
