//! The send buffer holds application data from the moment it is written until the peer
//!  acknowledges it. Data is stored in MSS sized blocks, each block becoming one data packet.
//!
//! Blocks form a ring with three cursors:
//!
//! ```ascii
//!   first                  curr                    last
//!     |  sent, not acked     |  not sent yet         |  free
//!     v                      v                       v
//!  ...[b][b][b][b][b][b][b][b][b][b][b][b][b][b][b][b][ ][ ][ ]...
//! ```
//!
//! `first` is the oldest unacknowledged block, `curr` the next block to be sent for the first
//!  time, and `last` the next free block. When a write does not fit, the buffer grows by a
//!  whole chunk of blocks; it never shrinks.

use std::cmp::min;
use std::io;
use std::io::Read;
use std::sync::Mutex;
use std::time::Duration;
use anyhow::anyhow;
use bytes::Bytes;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::config::EffectiveSendBufferConfig;
use crate::msg_no::{MsgFlags, MsgNoField};
use crate::seq_no::MsgNo;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SendPacket {
    pub data: Bytes,
    pub msg_no: MsgNoField,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SendReadResult {
    Data(SendPacket),
    /// The message's time to live elapsed. It must not be retransmitted, and the caller should
    ///  tell the peer to drop it.
    Expired {
        msg_no: MsgNo,
        /// number of blocks from the requested offset to the end of the message
        msg_len: usize,
    },
    NoData,
}

struct Block {
    chunk: usize,
    offset: usize,
    len: usize,
    msg_no: MsgNoField,
    origin_time: Instant,
    /// `None` means the block never expires
    ttl: Option<Duration>,
}

impl Block {
    fn is_expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(self.origin_time).as_millis() > ttl.as_millis(),
            None => false,
        }
    }
}

struct SendBufferInner {
    config: EffectiveSendBufferConfig,
    chunks: Vec<Vec<u8>>,
    blocks: Vec<Block>,
    first: usize,
    curr: usize,
    last: usize,
    /// number of blocks between `first` and `last`
    count: usize,
    next_msg_no: MsgNo,
}

impl SendBufferInner {
    fn next_pos(&self, pos: usize) -> usize {
        (pos + 1) % self.blocks.len()
    }

    fn block_data(&self, pos: usize) -> &[u8] {
        let block = &self.blocks[pos];
        &self.chunks[block.chunk][block.offset..block.offset + block.len]
    }

    /// Allocates a new chunk and an equal number of blocks. The blocks are placed behind the
    ///  free region of the ring, so all occupied blocks keep their order.
    fn increase(&mut self) -> anyhow::Result<()> {
        let num_new_blocks = self.config.blocks_per_chunk;
        let chunk_len = num_new_blocks.checked_mul(self.config.mss)
            .ok_or_else(|| anyhow!("send buffer chunk of {} blocks with {} bytes each is too big", num_new_blocks, self.config.mss))?;

        let mut chunk = Vec::new();
        chunk.try_reserve_exact(chunk_len)
            .map_err(|e| anyhow!("unable to allocate {} bytes to grow the send buffer: {}", chunk_len, e))?;
        self.chunks.try_reserve(1)
            .map_err(|e| anyhow!("unable to grow the send buffer's chunk list: {}", e))?;
        self.blocks.try_reserve(num_new_blocks)
            .map_err(|e| anyhow!("unable to allocate {} send buffer blocks: {}", num_new_blocks, e))?;
        chunk.resize(chunk_len, 0);

        let old_capacity = self.blocks.len();
        if old_capacity > 0 {
            self.blocks.rotate_left(self.first);
            self.curr = (self.curr + old_capacity - self.first) % old_capacity;
            self.last = (self.last + old_capacity - self.first) % old_capacity;
            self.first = 0;
        }

        let chunk_idx = self.chunks.len();
        self.chunks.push(chunk);

        let now = Instant::now();
        for i in 0..num_new_blocks {
            self.blocks.push(Block {
                chunk: chunk_idx,
                offset: i * self.config.mss,
                len: 0,
                msg_no: MsgNoField::default(),
                origin_time: now,
                ttl: None,
            });
        }

        debug!("send buffer grew from {} to {} blocks", old_capacity, self.blocks.len());
        Ok(())
    }

    /// Grows the ring until `num_blocks` more blocks fit. The block list is reserved for the
    ///  final size up front, so a request that can never be satisfied fails before any chunk
    ///  is allocated.
    fn ensure_space(&mut self, num_blocks: usize) -> anyhow::Result<()> {
        let required = num_blocks.checked_add(self.count + 1)
            .ok_or_else(|| anyhow!("a message of {} blocks does not fit into the send buffer", num_blocks))?;
        if required <= self.blocks.len() {
            return Ok(());
        }

        self.blocks.try_reserve(required - self.blocks.len())
            .map_err(|e| anyhow!("unable to grow the send buffer to {} blocks: {}", required, e))?;
        while required > self.blocks.len() {
            self.increase()?;
        }
        Ok(())
    }

    fn append_message(&mut self, data: &[u8], ttl: Option<Duration>, in_order: bool) -> anyhow::Result<()> {
        let mss = self.config.mss;
        let num_blocks = data.len().div_ceil(mss);
        self.ensure_space(num_blocks)?;

        let base_flags = if in_order { MsgFlags::IN_ORDER } else { MsgFlags::empty() };
        let now = Instant::now();

        let mut pos = self.last;
        for (i, payload) in data.chunks(mss).enumerate() {
            let mut flags = base_flags;
            if i == 0 {
                flags |= MsgFlags::FIRST;
            }
            if i == num_blocks - 1 {
                flags |= MsgFlags::LAST;
            }

            let block = &mut self.blocks[pos];
            block.len = payload.len();
            block.msg_no = MsgNoField::new(self.next_msg_no, flags);
            block.origin_time = now;
            block.ttl = ttl;
            let (chunk, offset) = (block.chunk, block.offset);
            self.chunks[chunk][offset..offset + payload.len()].copy_from_slice(payload);

            pos = self.next_pos(pos);
        }
        self.last = pos;
        self.count += num_blocks;

        trace!("added message #{} with {} bytes in {} blocks", self.next_msg_no, data.len(), num_blocks);
        self.next_msg_no = self.next_msg_no.incr();
        Ok(())
    }
}

/// Fills `buf` from `reader` as far as possible. Returns the number of bytes read, and whether
///  the reader may have more data.
fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> (usize, bool) {
    let mut num_read = 0;
    while num_read < buf.len() {
        match reader.read(&mut buf[num_read..]) {
            Ok(0) => return (num_read, false),
            Ok(n) => num_read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("stopped reading message data: {}", e);
                return (num_read, false);
            }
        }
    }
    (num_read, true)
}

pub struct SendBuffer {
    inner: Mutex<SendBufferInner>,
    space_freed: Notify,
}

impl SendBuffer {
    pub fn new(config: EffectiveSendBufferConfig) -> anyhow::Result<SendBuffer> {
        let mut inner = SendBufferInner {
            config,
            chunks: Vec::new(),
            blocks: Vec::new(),
            first: 0,
            curr: 0,
            last: 0,
            count: 0,
            next_msg_no: MsgNo::FIRST,
        };
        inner.increase()?;

        Ok(SendBuffer {
            inner: Mutex::new(inner),
            space_freed: Notify::new(),
        })
    }

    /// Adds a message, splitting it into MSS sized blocks. `ttl` is the time after which the
    ///  message is no longer retransmitted, `None` for no limit.
    ///
    /// The buffer grows as needed. If growing fails, the message is not added and the buffer
    ///  remains usable.
    pub fn add_buffer(&self, data: &[u8], ttl: Option<Duration>, in_order: bool) -> anyhow::Result<()> {
        self.inner.lock().unwrap()
            .append_message(data, ttl, in_order)
    }

    /// Reads up to `len` bytes from `reader` and adds them as a single in-order message without
    ///  time limit. Reading stops early at end of input or on a read error, and the message
    ///  contains what was read up to that point.
    ///
    /// Space for `len` bytes is reserved before anything is read, so if the buffer can not grow,
    ///  the reader is left untouched. Returns the number of bytes that were added.
    pub fn add_buffer_from_reader(&self, mut reader: impl Read, len: usize) -> anyhow::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        let mss = inner.config.mss;
        let num_blocks = len.div_ceil(mss);
        inner.ensure_space(num_blocks)?;

        let msg_no = inner.next_msg_no;
        let now = Instant::now();

        let mut pos = inner.last;
        let mut last_filled = None;
        let mut num_filled = 0;
        let mut num_bytes = 0;
        for i in 0..num_blocks {
            let block = &mut inner.blocks[pos];
            let payload_len = min(mss, len - i * mss);
            let (num_read, more) = read_fully(&mut reader, &mut inner.chunks[block.chunk][block.offset..block.offset + payload_len]);
            if num_read == 0 {
                break;
            }

            let flags = if i == 0 { MsgFlags::IN_ORDER | MsgFlags::FIRST } else { MsgFlags::IN_ORDER };
            block.len = num_read;
            block.msg_no = MsgNoField::new(msg_no, flags);
            block.origin_time = now;
            block.ttl = None;

            last_filled = Some(pos);
            num_filled += 1;
            num_bytes += num_read;
            pos = (pos + 1) % inner.blocks.len();

            if !more {
                break;
            }
        }

        if let Some(last_pos) = last_filled {
            let block = &mut inner.blocks[last_pos];
            block.msg_no = block.msg_no.with_flags(MsgFlags::LAST);
        }
        inner.last = pos;
        inner.count += num_filled;

        trace!("added message #{} with {} bytes from a reader in {} blocks", msg_no, num_bytes, num_filled);
        inner.next_msg_no = msg_no.incr();
        Ok(num_bytes)
    }

    /// Returns the next block that was never sent, advancing the 'current' cursor
    pub fn read_data(&self) -> Option<SendPacket> {
        let mut inner = self.inner.lock().unwrap();
        if inner.curr == inner.last {
            return None;
        }

        let pos = inner.curr;
        let packet = SendPacket {
            data: Bytes::copy_from_slice(inner.block_data(pos)),
            msg_no: inner.blocks[pos].msg_no,
        };
        inner.curr = inner.next_pos(pos);
        Some(packet)
    }

    /// Reads the block `offset` blocks after the oldest unacknowledged block, for
    ///  retransmission.
    ///
    /// If the block's message expired, the rest of the message is reported instead, and the
    ///  'current' cursor is moved past it if it was inside the message so the remaining blocks
    ///  are never sent.
    pub fn read_data_at(&self, offset: usize) -> SendReadResult {
        let mut inner = self.inner.lock().unwrap();
        if offset >= inner.count {
            return SendReadResult::NoData;
        }

        let pos = (inner.first + offset) % inner.blocks.len();
        if !inner.blocks[pos].is_expired(Instant::now()) {
            return SendReadResult::Data(SendPacket {
                data: Bytes::copy_from_slice(inner.block_data(pos)),
                msg_no: inner.blocks[pos].msg_no,
            });
        }

        let msg_no = inner.blocks[pos].msg_no.msg_no();
        let mut msg_len = 1;
        let mut move_curr = inner.curr == pos;

        let mut p = inner.next_pos(pos);
        while p != inner.last && inner.blocks[p].msg_no.msg_no() == msg_no {
            if p == inner.curr {
                move_curr = true;
            }
            p = inner.next_pos(p);
            msg_len += 1;
        }
        if move_curr {
            inner.curr = p;
        }

        debug!("message #{} expired, skipping {} blocks", msg_no, msg_len);
        SendReadResult::Expired { msg_no, msg_len }
    }

    /// Retires the `offset` oldest blocks after the peer acknowledged them
    pub fn ack_data(&self, offset: usize) {
        {
            let mut inner = self.inner.lock().unwrap();
            debug_assert!(offset <= inner.count, "acknowledging {} blocks with only {} in the buffer", offset, inner.count);
            let offset = if offset > inner.count {
                warn!("acknowledging {} blocks with only {} in the buffer - ignoring the excess", offset, inner.count);
                inner.count
            }
            else {
                offset
            };

            inner.first = (inner.first + offset) % inner.blocks.len();
            inner.count -= offset;
        }
        self.space_freed.notify_waiters();
    }

    /// Returns a future that completes on the next `ack_data()` call. The future is registered
    ///  when this function returns, so an acknowledgement between the call and the first poll
    ///  is not missed.
    pub fn wait_for_space(&self) -> Notified<'_> {
        self.space_freed.notified()
    }

    /// number of blocks holding unacknowledged data
    pub fn curr_buf_size(&self) -> usize {
        self.inner.lock().unwrap().count
    }

    /// total number of blocks
    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().blocks.len()
    }

    /// number of blocks that were never sent
    pub fn unsent_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        (inner.last + inner.blocks.len() - inner.curr) % inner.blocks.len()
    }
}
