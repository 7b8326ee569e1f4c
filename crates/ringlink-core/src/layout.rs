//! Duplex channel layout inside one shared memory block
//!
//! ```text
//!   0  magic, version, total_size        (padded to 64)
//!  64  control block, manager -> node    (128)
//! 192  control block, node -> manager    (128)
//! 320  data offset/size for both rings   (padded to 64)
//! 384  manager -> node data | node -> manager data
//! ```

use crate::region::{Region, REGION_ALIGN};
use crate::ring::{ControlBlock, RingChannel};
use crate::{Error, Result};
use std::mem::{offset_of, size_of};
use std::ptr;
use std::sync::Arc;

const MAGIC: u32 = 0x4941_4950; // "IAIP"
const VERSION: u32 = 1;

/// Block identification, written once by the manager
#[repr(C, align(64))]
struct LayoutMeta {
    magic: u32,
    version: u32,
    total_size: u64,
}

/// Where each ring's data lives, relative to the block start
#[repr(C, align(64))]
struct DataRegions {
    to_node_offset: u64,
    to_node_size: u64,
    to_manager_offset: u64,
    to_manager_size: u64,
}

/// Header at the start of a shared channel block
///
/// Only ever accessed through a pointer into the mapped block; the two
/// processes agree on this layout bit for bit.
#[repr(C, align(64))]
pub struct SharedChannelLayout {
    meta: LayoutMeta,
    to_node_control: ControlBlock,
    to_manager_control: ControlBlock,
    regions: DataRegions,
}

const _: () = assert!(size_of::<SharedChannelLayout>() % 64 == 0);
const _: () = assert!(size_of::<SharedChannelLayout>() == 384);
const _: () = assert!(offset_of!(SharedChannelLayout, to_node_control) == 64);
const _: () = assert!(offset_of!(SharedChannelLayout, to_manager_control) == 192);
const _: () = assert!(offset_of!(SharedChannelLayout, regions) == 320);

/// Both rings of a duplex channel, seen from one side
pub struct DuplexChannel {
    /// Ring this side writes
    pub outbound: RingChannel,
    /// Ring this side reads
    pub inbound: RingChannel,
}

impl SharedChannelLayout {
    /// Magic number stamped by the manager
    pub const MAGIC: u32 = MAGIC;
    /// Format version
    pub const VERSION: u32 = VERSION;

    /// Size of the header in bytes
    pub const fn header_size() -> usize {
        size_of::<Self>()
    }

    /// Smallest block that leaves a non-empty data area for both rings
    pub const fn min_block_size() -> usize {
        Self::header_size() + 2 * REGION_ALIGN
    }

    /// Initialize a fresh block and attach as the manager
    pub fn format<R: Region + 'static>(region: Arc<R>) -> Result<DuplexChannel> {
        let base = region.as_ptr();
        let total = region.len();
        check_alignment(base)?;
        if total < Self::min_block_size() {
            return Err(Error::Layout(format!(
                "shared block of {} bytes is smaller than the minimum {}",
                total,
                Self::min_block_size()
            )));
        }

        let header = Self::header_size();
        let mut half = (total - header) / 2;
        half -= half % REGION_ALIGN;

        let layout = base as *mut SharedChannelLayout;
        // Safety: the region is aligned and larger than the header; the peer
        // does not read the header until the descriptor is handed over
        unsafe {
            ptr::addr_of_mut!((*layout).meta.magic).write(MAGIC);
            ptr::addr_of_mut!((*layout).meta.version).write(VERSION);
            ptr::addr_of_mut!((*layout).meta.total_size).write(total as u64);
            ptr::addr_of_mut!((*layout).regions.to_node_offset).write(header as u64);
            ptr::addr_of_mut!((*layout).regions.to_node_size).write(half as u64);
            ptr::addr_of_mut!((*layout).regions.to_manager_offset).write((header + half) as u64);
            ptr::addr_of_mut!((*layout).regions.to_manager_size).write(half as u64);
        }

        let outbound = RingChannel::create_split(
            region.clone(),
            offset_of!(SharedChannelLayout, to_node_control),
            header,
            half,
            true,
        )?;
        let inbound = RingChannel::create_split(
            region,
            offset_of!(SharedChannelLayout, to_manager_control),
            header + half,
            half,
            true,
        )?;

        Ok(DuplexChannel { outbound, inbound })
    }

    /// Validate a block formatted by the manager and attach as the node
    ///
    /// `expected_size` is the block size the manager announced.
    pub fn attach<R: Region + 'static>(region: Arc<R>, expected_size: usize) -> Result<DuplexChannel> {
        let base = region.as_ptr();
        let len = region.len();
        check_alignment(base)?;
        if len < Self::header_size() {
            return Err(Error::Layout(format!(
                "shared block of {} bytes cannot hold the {}-byte header",
                len,
                Self::header_size()
            )));
        }

        let layout = base as *const SharedChannelLayout;
        // Safety: aligned and in bounds; plain reads of fields the manager
        // finished writing before spawning this process
        let (meta, regions) = unsafe {
            (
                LayoutMeta {
                    magic: ptr::addr_of!((*layout).meta.magic).read(),
                    version: ptr::addr_of!((*layout).meta.version).read(),
                    total_size: ptr::addr_of!((*layout).meta.total_size).read(),
                },
                DataRegions {
                    to_node_offset: ptr::addr_of!((*layout).regions.to_node_offset).read(),
                    to_node_size: ptr::addr_of!((*layout).regions.to_node_size).read(),
                    to_manager_offset: ptr::addr_of!((*layout).regions.to_manager_offset).read(),
                    to_manager_size: ptr::addr_of!((*layout).regions.to_manager_size).read(),
                },
            )
        };

        if meta.magic != MAGIC {
            return Err(Error::ProtocolMismatch(format!(
                "invalid header signature 0x{:08X}",
                meta.magic
            )));
        }
        if meta.version != VERSION {
            return Err(Error::ProtocolMismatch(format!(
                "version mismatch: expected {}, got {}",
                VERSION, meta.version
            )));
        }
        if meta.total_size != expected_size as u64 || meta.total_size > len as u64 {
            return Err(Error::Layout(format!(
                "block size mismatch: header says {}, expected {}, mapped {}",
                meta.total_size, expected_size, len
            )));
        }

        let to_node = checked_span(regions.to_node_offset, regions.to_node_size, len)?;
        let to_manager = checked_span(regions.to_manager_offset, regions.to_manager_size, len)?;

        let outbound = RingChannel::create_split(
            region.clone(),
            offset_of!(SharedChannelLayout, to_manager_control),
            to_manager.0,
            to_manager.1,
            false,
        )?;
        let inbound = RingChannel::create_split(
            region,
            offset_of!(SharedChannelLayout, to_node_control),
            to_node.0,
            to_node.1,
            false,
        )?;

        Ok(DuplexChannel { outbound, inbound })
    }
}

fn check_alignment(base: *mut u8) -> Result<()> {
    if base as usize % REGION_ALIGN != 0 {
        return Err(Error::Layout(format!(
            "shared block at {:p} is not {}-byte aligned",
            base, REGION_ALIGN
        )));
    }
    Ok(())
}

/// Convert a recorded (offset, size) pair into a span inside the data area
fn checked_span(offset: u64, size: u64, len: usize) -> Result<(usize, usize)> {
    let header = SharedChannelLayout::header_size() as u64;
    let end = offset.checked_add(size);
    match end {
        Some(end)
            if offset >= header
                && offset % REGION_ALIGN as u64 == 0
                && size > 0
                && end <= len as u64 =>
        {
            Ok((offset as usize, size as usize))
        }
        _ => Err(Error::Layout(format!(
            "data region {}+{} is outside the {}-byte block",
            offset, size, len
        ))),
    }
}
