//! Wait-free single-producer/single-consumer packet ring
//!
//! The ring lives in a caller-supplied [`Region`]: a [`ControlBlock`] with
//! the two offsets, plus a data area of `capacity` bytes. Packets are a
//! 4-byte little-endian header (`packet_id: u16`, `payload_len: u16`)
//! followed by the payload, written contiguously and split in two copies
//! when they cross the end of the data area.
//!
//! The producer publishes `write_offset` with `Release` after copying the
//! bytes; the consumer loads it with `Acquire` before reading them, and the
//! same pairing runs the other way for `read_offset`. One byte of capacity
//! is never filled so that `read == write` always means empty.

use crate::region::{Region, REGION_ALIGN};
use crate::{Error, Result};
use std::fmt;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Packet id reserved as a no-op marker; regular traffic never uses it
pub const PACKET_ID_SKIP: u16 = 0;

/// Largest payload a single packet can carry
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Producer-owned half of the control block
#[repr(C, align(64))]
pub struct ProducerHalf {
    write_offset: AtomicU32,
}

/// Consumer-owned half of the control block
#[repr(C, align(64))]
pub struct ConsumerHalf {
    read_offset: AtomicU32,
    /// Written once by the owner, read-only afterwards
    capacity: AtomicU32,
}

/// Ring offsets, each half on its own cache line
#[repr(C)]
pub struct ControlBlock {
    producer: ProducerHalf,
    consumer: ConsumerHalf,
}

const _: () = assert!(size_of::<ControlBlock>() == 128);
const _: () = assert!(std::mem::offset_of!(ControlBlock, consumer) == 64);

impl ControlBlock {
    /// Size of the control block in bytes
    pub const SIZE: usize = size_of::<Self>();
}

/// Fixed-size header in front of every payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    pub id: u16,
    pub payload_len: u16,
}

impl PacketHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 4;

    /// Create a header for `payload_len` bytes tagged `id`
    pub fn new(id: u16, payload_len: u16) -> Self {
        Self { id, payload_len }
    }

    /// Payload length as a byte count
    pub fn payload_size(&self) -> usize {
        self.payload_len as usize
    }

    fn encode(&self) -> [u8; Self::SIZE] {
        let id = self.id.to_le_bytes();
        let len = self.payload_len.to_le_bytes();
        [id[0], id[1], len[0], len[1]]
    }

    fn decode(bytes: [u8; Self::SIZE]) -> Self {
        Self {
            id: u16::from_le_bytes([bytes[0], bytes[1]]),
            payload_len: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }
}

/// One end's view of a ring channel
///
/// `push` and `pop` take `&mut self`: within a process a view has one
/// producer and one consumer by construction, and several producer threads
/// must share a single view behind a lock. The other process is trusted to
/// follow the same discipline.
pub struct RingChannel {
    control: NonNull<ControlBlock>,
    data: NonNull<u8>,
    capacity: u32,
    _region: Arc<dyn Region>,
}

// Safety: the pointers target memory kept alive by `_region`, and all
// cross-thread access goes through the atomic offsets
unsafe impl Send for RingChannel {}

impl fmt::Debug for RingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingChannel")
            .field("capacity", &self.capacity)
            .field("used_bytes", &self.used_bytes())
            .finish()
    }
}

impl RingChannel {
    /// Attach to a ring that occupies a whole region: control block first, data after
    pub fn create<R: Region + 'static>(region: Arc<R>, is_owner: bool) -> Result<Self> {
        let len = region.len();
        if len <= ControlBlock::SIZE {
            return Err(Error::Layout(format!(
                "region of {} bytes cannot hold a {}-byte control block and data",
                len,
                ControlBlock::SIZE
            )));
        }
        Self::create_split(region, 0, ControlBlock::SIZE, len - ControlBlock::SIZE, is_owner)
    }

    /// Attach to a ring whose control block and data live at separate offsets of one region
    pub fn create_split<R: Region + 'static>(
        region: Arc<R>,
        control_offset: usize,
        data_offset: usize,
        data_len: usize,
        is_owner: bool,
    ) -> Result<Self> {
        let region: Arc<dyn Region> = region;
        let base = region.as_ptr();
        let region_len = region.len();

        if base as usize % REGION_ALIGN != 0 {
            return Err(Error::Layout(format!(
                "region base {:p} is not {}-byte aligned",
                base, REGION_ALIGN
            )));
        }
        if control_offset % align_of::<ControlBlock>() != 0 {
            return Err(Error::Layout(format!(
                "control block offset {} is not {}-byte aligned",
                control_offset,
                align_of::<ControlBlock>()
            )));
        }
        let control_end = control_offset
            .checked_add(ControlBlock::SIZE)
            .filter(|&end| end <= region_len)
            .ok_or_else(|| {
                Error::Layout(format!(
                    "control block at {} exceeds region of {} bytes",
                    control_offset, region_len
                ))
            })?;
        let data_end = data_offset
            .checked_add(data_len)
            .filter(|&end| end <= region_len)
            .ok_or_else(|| {
                Error::Layout(format!(
                    "data area {}+{} exceeds region of {} bytes",
                    data_offset, data_len, region_len
                ))
            })?;
        if data_offset < control_end && control_offset < data_end {
            return Err(Error::Layout("data area overlaps the control block".to_string()));
        }
        if data_len == 0 {
            return Err(Error::Layout("data area is empty".to_string()));
        }
        let capacity = u32::try_from(data_len)
            .map_err(|_| Error::Layout(format!("data area of {} bytes exceeds u32", data_len)))?;

        // Safety: offsets were bounds-checked against the region above
        let (control, data) = unsafe {
            (
                NonNull::new_unchecked(base.add(control_offset) as *mut ControlBlock),
                NonNull::new_unchecked(base.add(data_offset)),
            )
        };

        let ring = Self {
            control,
            data,
            capacity,
            _region: region,
        };

        let block = ring.control();
        if is_owner {
            block.consumer.capacity.store(capacity, Ordering::Relaxed);
            block.producer.write_offset.store(0, Ordering::Release);
            block.consumer.read_offset.store(0, Ordering::Release);
        } else {
            let stored = block.consumer.capacity.load(Ordering::Acquire);
            if stored != capacity {
                return Err(Error::Layout(format!(
                    "capacity mismatch: control block says {}, region gives {}",
                    stored, capacity
                )));
            }
        }

        Ok(ring)
    }

    /// Get data capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Bytes currently queued, headers included
    pub fn used_bytes(&self) -> usize {
        let block = self.control();
        let write = block.producer.write_offset.load(Ordering::Acquire) as usize;
        let read = block.consumer.read_offset.load(Ordering::Acquire) as usize;
        if write >= read {
            write - read
        } else {
            self.capacity() - read + write
        }
    }

    /// Bytes a push may still use, header included, before the ring is full
    pub fn free_bytes(&self) -> usize {
        self.capacity().saturating_sub(self.used_bytes() + 1)
    }

    /// Whether no packet is waiting
    pub fn is_empty(&self) -> bool {
        let block = self.control();
        block.producer.write_offset.load(Ordering::Acquire)
            == block.consumer.read_offset.load(Ordering::Acquire)
    }

    /// Append one packet
    ///
    /// Fails with [`Error::PayloadTooLarge`] or [`Error::RingFull`]; a rejected
    /// push leaves the ring untouched.
    pub fn push(&mut self, packet_id: u16, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let total = PacketHeader::SIZE + payload.len();
        let cap = self.capacity();

        let block = self.control();
        let read = block.consumer.read_offset.load(Ordering::Acquire) as usize;
        let write = block.producer.write_offset.load(Ordering::Relaxed) as usize;
        if read >= cap || write >= cap {
            return Err(Error::Layout(format!(
                "corrupted offsets: read {}, write {}, capacity {}",
                read, write, cap
            )));
        }

        let free = if read <= write { cap - write + read } else { read - write };
        if free <= total {
            return Err(Error::RingFull {
                required: total,
                free: free - 1,
            });
        }

        let header = PacketHeader::new(packet_id, payload.len() as u16);
        self.write_wrapped(write, &header.encode());

        let data_offset = (write + PacketHeader::SIZE) % cap;
        if !payload.is_empty() {
            self.write_wrapped(data_offset, payload);
        }

        let new_write = (data_offset + payload.len()) % cap;
        self.control()
            .producer
            .write_offset
            .store(new_write as u32, Ordering::Release);
        Ok(())
    }

    /// Take the oldest packet, copying its payload into `out`
    ///
    /// Returns `Ok(None)` when empty. If `out` is shorter than the payload the
    /// packet stays queued and [`Error::BufferTooSmall`] reports its size.
    pub fn pop(&mut self, out: &mut [u8]) -> Result<Option<PacketHeader>> {
        let cap = self.capacity();

        let block = self.control();
        let write = block.producer.write_offset.load(Ordering::Acquire) as usize;
        let read = block.consumer.read_offset.load(Ordering::Relaxed) as usize;
        if read == write {
            return Ok(None);
        }
        if read >= cap || write >= cap {
            return Err(Error::Layout(format!(
                "corrupted offsets: read {}, write {}, capacity {}",
                read, write, cap
            )));
        }

        let used = if write > read { write - read } else { cap - read + write };
        if used < PacketHeader::SIZE {
            return Err(Error::Layout(format!("{} queued bytes cannot hold a packet header", used)));
        }

        let mut raw = [0u8; PacketHeader::SIZE];
        self.read_wrapped(read, &mut raw);
        let header = PacketHeader::decode(raw);
        let size = header.payload_size();

        if PacketHeader::SIZE + size > used {
            return Err(Error::Layout(format!(
                "packet claims {} payload bytes but only {} are queued",
                size,
                used - PacketHeader::SIZE
            )));
        }
        if size > out.len() {
            return Err(Error::BufferTooSmall { required: size });
        }

        let data_offset = (read + PacketHeader::SIZE) % cap;
        if size > 0 {
            self.read_wrapped(data_offset, &mut out[..size]);
        }

        let new_read = (data_offset + size) % cap;
        self.control()
            .consumer
            .read_offset
            .store(new_read as u32, Ordering::Release);
        Ok(Some(header))
    }

    fn control(&self) -> &ControlBlock {
        // Safety: points into the live region, validated at attach time
        unsafe { self.control.as_ref() }
    }

    fn write_wrapped(&mut self, offset: usize, src: &[u8]) {
        let cap = self.capacity();
        let dst = self.data.as_ptr();
        unsafe {
            if offset + src.len() <= cap {
                ptr::copy_nonoverlapping(src.as_ptr(), dst.add(offset), src.len());
            } else {
                let first = cap - offset;
                ptr::copy_nonoverlapping(src.as_ptr(), dst.add(offset), first);
                ptr::copy_nonoverlapping(src.as_ptr().add(first), dst, src.len() - first);
            }
        }
    }

    fn read_wrapped(&self, offset: usize, dst: &mut [u8]) {
        let cap = self.capacity();
        let src = self.data.as_ptr() as *const u8;
        unsafe {
            if offset + dst.len() <= cap {
                ptr::copy_nonoverlapping(src.add(offset), dst.as_mut_ptr(), dst.len());
            } else {
                let first = cap - offset;
                ptr::copy_nonoverlapping(src.add(offset), dst.as_mut_ptr(), first);
                ptr::copy_nonoverlapping(src, dst.as_mut_ptr().add(first), dst.len() - first);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    fn ring_pair(capacity: usize) -> (RingChannel, RingChannel) {
        let region = Arc::new(HeapRegion::new(ControlBlock::SIZE + capacity).unwrap());
        let producer = RingChannel::create(region.clone(), true).unwrap();
        let consumer = RingChannel::create(region, false).unwrap();
        (producer, consumer)
    }

    #[test]
    fn test_push_pop() {
        let (mut producer, mut consumer) = ring_pair(1024);
        producer.push(1, b"Hello RingBuffer").unwrap();

        let mut buf = [0u8; 128];
        let header = consumer.pop(&mut buf).unwrap().unwrap();
        assert_eq!(header.id, 1);
        assert_eq!(&buf[..header.payload_size()], b"Hello RingBuffer");
        assert!(consumer.is_empty());
        assert!(consumer.pop(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_empty_payload() {
        let (mut producer, mut consumer) = ring_pair(64);
        producer.push(9, &[]).unwrap();
        let header = consumer.pop(&mut []).unwrap().unwrap();
        assert_eq!(header, PacketHeader::new(9, 0));
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_max_payload_round_trip() {
        let (mut producer, mut consumer) = ring_pair(MAX_PAYLOAD_SIZE + 64);
        let payload: Vec<u8> = (0..MAX_PAYLOAD_SIZE).map(|i| (i % 251) as u8).collect();
        producer.push(3, &payload).unwrap();

        let mut buf = vec![0u8; MAX_PAYLOAD_SIZE];
        let header = consumer.pop(&mut buf).unwrap().unwrap();
        assert_eq!(header.payload_size(), MAX_PAYLOAD_SIZE);
        assert_eq!(buf, payload);
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_payload_too_large() {
        let (mut producer, consumer) = ring_pair(MAX_PAYLOAD_SIZE * 2);
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let err = producer.push(1, &payload).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { size, .. } if size == MAX_PAYLOAD_SIZE + 1));
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_wrap_around() {
        let region = Arc::new(HeapRegion::new(ControlBlock::SIZE + 100).unwrap());
        let mut rb = RingChannel::create(region, true).unwrap();

        let mut out = [0u8; 100];
        rb.push(1, &[0xFF; 80]).unwrap();
        assert_eq!(rb.pop(&mut out).unwrap().unwrap().payload_size(), 80);

        // read and write now sit at 84; 44 bytes must split at the end
        rb.push(2, &[0xAA; 40]).unwrap();
        let header = rb.pop(&mut out).unwrap().unwrap();
        assert_eq!(header.id, 2);
        assert_eq!(header.payload_size(), 40);
        assert!(out[..40].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_header_split_across_end() {
        let region = Arc::new(HeapRegion::new(ControlBlock::SIZE + 64).unwrap());
        let mut rb = RingChannel::create(region, true).unwrap();
        let mut out = [0u8; 64];

        // leave write at 62 so the header itself wraps
        rb.push(1, &[1; 58]).unwrap();
        rb.pop(&mut out).unwrap();
        rb.push(0x0102, &[7, 8, 9]).unwrap();
        let header = rb.pop(&mut out).unwrap().unwrap();
        assert_eq!(header, PacketHeader::new(0x0102, 3));
        assert_eq!(&out[..3], &[7, 8, 9]);
    }

    #[test]
    fn test_fifo_across_many_wraps() {
        let (mut producer, mut consumer) = ring_pair(97);
        let mut out = [0u8; 64];
        let mut next_expected = 0u16;

        for id in 0..500u16 {
            let payload: Vec<u8> = (0..(id % 37) as u8).map(|b| b ^ id as u8).collect();
            while let Err(Error::RingFull { .. }) = producer.push(id, &payload) {
                let header = consumer.pop(&mut out).unwrap().unwrap();
                assert_eq!(header.id, next_expected);
                next_expected += 1;
            }
        }
        while let Some(header) = consumer.pop(&mut out).unwrap() {
            let expected: Vec<u8> = (0..(header.id % 37) as u8).map(|b| b ^ header.id as u8).collect();
            assert_eq!(header.id, next_expected);
            assert_eq!(&out[..header.payload_size()], &expected[..]);
            next_expected += 1;
        }
        assert_eq!(next_expected, 500);
    }

    #[test]
    fn test_full_ring_keeps_one_byte_free() {
        let (mut producer, mut consumer) = ring_pair(32);

        // 4 + 27 = 31 bytes fills the ring up to the reserved byte
        let err = producer.push(1, &[0u8; 28]).unwrap_err();
        assert!(matches!(err, Error::RingFull { required: 32, free: 31 }));
        producer.push(1, &[0x11; 27]).unwrap();
        assert_eq!(producer.used_bytes(), 31);
        assert_eq!(producer.free_bytes(), 0);

        // nothing fits now, not even an empty packet
        assert!(producer.push(2, &[]).unwrap_err().is_retryable());

        let mut out = [0u8; 32];
        let header = consumer.pop(&mut out).unwrap().unwrap();
        assert_eq!(header.payload_size(), 27);
        assert!(out[..27].iter().all(|&b| b == 0x11));
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_rejected_push_does_not_corrupt() {
        let (mut producer, mut consumer) = ring_pair(40);
        producer.push(1, b"first").unwrap();
        producer.push(2, b"second").unwrap();
        assert!(producer.push(3, &[0xEE; 30]).is_err());

        let mut out = [0u8; 40];
        let h = consumer.pop(&mut out).unwrap().unwrap();
        assert_eq!((h.id, &out[..h.payload_size()]), (1, &b"first"[..]));
        let h = consumer.pop(&mut out).unwrap().unwrap();
        assert_eq!((h.id, &out[..h.payload_size()]), (2, &b"second"[..]));
        assert!(consumer.pop(&mut out).unwrap().is_none());
    }

    #[test]
    fn test_short_buffer_keeps_packet() {
        let (mut producer, mut consumer) = ring_pair(256);
        producer.push(5, &[0x42; 100]).unwrap();
        let used = consumer.used_bytes();

        let mut small = [0u8; 10];
        let err = consumer.pop(&mut small).unwrap_err();
        assert!(matches!(err, Error::BufferTooSmall { required: 100 }));
        assert_eq!(consumer.used_bytes(), used);

        let mut big = [0u8; 100];
        let header = consumer.pop(&mut big).unwrap().unwrap();
        assert_eq!(header, PacketHeader::new(5, 100));
        assert!(big.iter().all(|&b| b == 0x42));
    }

    #[test]
    fn test_header_is_little_endian() {
        let region = Arc::new(HeapRegion::new(ControlBlock::SIZE + 64).unwrap());
        let mut rb = RingChannel::create(region.clone(), true).unwrap();
        rb.push(0x0107, &[0xAB, 0xCD]).unwrap();

        let data = unsafe { std::slice::from_raw_parts(region.as_ptr().add(ControlBlock::SIZE), 6) };
        assert_eq!(data, &[0x07, 0x01, 0x02, 0x00, 0xAB, 0xCD]);
    }

    #[test]
    fn test_forged_length_is_rejected() {
        let region = Arc::new(HeapRegion::new(ControlBlock::SIZE + 64).unwrap());
        let mut producer = RingChannel::create(region.clone(), true).unwrap();
        let mut consumer = RingChannel::create(region.clone(), false).unwrap();
        producer.push(1, b"abc").unwrap();

        // Rewrite payload_len to claim far more than was queued
        unsafe {
            let len = region.as_ptr().add(ControlBlock::SIZE + 2);
            *len = 0xFF;
            *len.add(1) = 0x00;
        }
        let mut out = vec![0u8; 65536];
        assert!(matches!(consumer.pop(&mut out), Err(Error::Layout(_))));
    }

    #[test]
    fn test_capacity_mismatch_on_attach() {
        let region = Arc::new(HeapRegion::new(512).unwrap());
        RingChannel::create_split(region.clone(), 0, 128, 256, true).unwrap();
        let err = RingChannel::create_split(region.clone(), 0, 128, 200, false).err().unwrap();
        assert!(matches!(err, Error::Layout(_)));
        assert!(RingChannel::create_split(region, 0, 128, 256, false).is_ok());
    }

    #[test]
    fn test_region_too_small() {
        let region = Arc::new(HeapRegion::new(ControlBlock::SIZE).unwrap());
        assert!(matches!(RingChannel::create(region, true), Err(Error::Layout(_))));
    }

    #[test]
    fn test_split_bounds_checked() {
        let region = Arc::new(HeapRegion::new(512).unwrap());
        assert!(RingChannel::create_split(region.clone(), 0, 400, 200, true).is_err());
        assert!(RingChannel::create_split(region.clone(), 32, 256, 64, true).is_err());
        assert!(RingChannel::create_split(region, 0, 64, 128, true).is_err());
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let (mut producer, mut consumer) = ring_pair(4096);
        const COUNT: u32 = 20_000;

        let writer = std::thread::spawn(move || {
            for i in 0..COUNT {
                let payload = i.to_le_bytes().repeat((i % 8) as usize + 1);
                loop {
                    match producer.push((i % 1000) as u16 + 1, &payload) {
                        Ok(()) => break,
                        Err(e) if e.is_retryable() => std::thread::yield_now(),
                        Err(e) => panic!("push failed: {}", e),
                    }
                }
            }
        });

        let mut out = [0u8; 64];
        let mut i = 0u32;
        while i < COUNT {
            match consumer.pop(&mut out).unwrap() {
                Some(header) => {
                    let expected = i.to_le_bytes().repeat((i % 8) as usize + 1);
                    assert_eq!(header.id, (i % 1000) as u16 + 1);
                    assert_eq!(&out[..header.payload_size()], &expected[..]);
                    i += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        writer.join().unwrap();
        assert!(consumer.is_empty());
    }
}
