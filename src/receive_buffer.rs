use std::cmp::min;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, trace};
use crate::config::EffectiveReceiveBufferConfig;
use crate::msg_no::PacketBoundary;
use crate::seq_no::MsgNo;
use crate::unit_pool::{PooledUnits, Unit, UnitId, UnitPool, UnitState};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DepositResult {
    Stored,
    /// The slot is already occupied, typically because the packet was retransmitted. The unit
    ///  was not taken, the caller should reuse it.
    Duplicate,
}

/// A deliverable message located by a scan: the ring positions of its first and last unit, and
///  whether its span reaches into the unacknowledged region.
struct MsgSpan {
    head: usize,
    tail: usize,
    passed_ack: bool,
}

struct ReceiveBufferInner {
    slots: Vec<Option<UnitId>>,

    /// next slot to be read by the application
    start_pos: usize,
    /// slots from here on are not acknowledged yet
    last_ack_pos: usize,
    /// Furthest offset (relative to `last_ack_pos`) at which a unit was deposited. This is a
    ///  high-water mark, there may be any number of empty slots below it.
    max_pos: usize,
    /// number of bytes of the unit at `start_pos` that were consumed by a byte-mode read
    notch: usize,
}

impl ReceiveBufferInner {
    fn size(&self) -> usize {
        self.slots.len()
    }

    fn next_pos(&self, pos: usize) -> usize {
        (pos + 1) % self.size()
    }

    fn data_size(&self) -> usize {
        (self.last_ack_pos + self.size() - self.start_pos) % self.size()
    }

    fn occupied_unit<'a>(&self, units: &'a PooledUnits, pos: usize) -> Option<&'a Unit> {
        self.slots[pos]
            .map(|id| units.get(id))
            .filter(|unit| unit.state() == UnitState::Occupied)
    }

    fn release_slot(&mut self, units: &mut PooledUnits, pos: usize) {
        if let Some(id) = self.slots[pos].take() {
            units.release(id);
        }
    }

    /// A unit at `pos` starts a message that can be delivered if nothing is missing from it
    ///  up to its last packet or up to the ack boundary, whichever comes first.
    fn is_deliverable_head(&self, units: &PooledUnits, pos: usize) -> bool {
        match self.occupied_unit(units, pos) {
            Some(unit) if unit.packet().msg_no.boundary().is_head() => {}
            _ => return false,
        }

        let mut i = pos;
        while i != self.last_ack_pos {
            match self.occupied_unit(units, i) {
                None => return false,
                Some(unit) if unit.packet().msg_no.boundary().is_tail() => return true,
                Some(_) => {}
            }
            i = self.next_pos(i);
        }
        true
    }

    fn consume_bytes(&mut self, units: &mut PooledUnits, len: usize, mut sink: impl FnMut(&[u8]) -> bool) -> usize {
        let mut remaining = len;
        let mut p = self.start_pos;

        while p != self.last_ack_pos && remaining > 0 {
            let Some(id) = self.slots[p] else {
                p = self.next_pos(p);
                self.notch = 0;
                continue;
            };

            let payload = &units.get(id).packet().payload;
            let available = payload.len().saturating_sub(self.notch);
            let n = min(available, remaining);
            if !sink(&payload[self.notch..self.notch + n]) {
                break;
            }
            remaining -= n;

            if n == available {
                self.release_slot(units, p);
                p = self.next_pos(p);
                self.notch = 0;
            }
            else {
                self.notch += n;
            }
        }

        self.start_pos = p;
        len - remaining
    }

    /// Finds the next message that can be delivered, discarding undeliverable units at the
    ///  start of the buffer on the way.
    fn scan_msg(&mut self, units: &mut PooledUnits) -> Option<MsgSpan> {
        if self.start_pos == self.last_ack_pos && self.max_pos == 0 {
            return None;
        }

        while self.start_pos != self.last_ack_pos {
            if self.slots[self.start_pos].is_some() {
                if self.is_deliverable_head(units, self.start_pos) {
                    break;
                }
                trace!("discarding undeliverable unit at slot {}", self.start_pos);
                self.release_slot(units, self.start_pos);
            }
            self.start_pos = self.next_pos(self.start_pos);
        }

        let mut head = None;
        let mut q = self.start_pos;
        let mut passed_ack = self.start_pos == self.last_ack_pos;
        let mut found = false;

        let num_candidates = min(self.max_pos + self.data_size(), self.size() - 1);
        for _ in 0..=num_candidates {
            match self.occupied_unit(units, q) {
                Some(unit) => {
                    let complete = match unit.packet().msg_no.boundary() {
                        PacketBoundary::Solo => {
                            head = Some(q);
                            true
                        }
                        PacketBoundary::First => {
                            head = Some(q);
                            false
                        }
                        PacketBoundary::Last => head.is_some(),
                        PacketBoundary::Middle => false,
                    };

                    // an in-order message must not overtake earlier messages that may still be
                    //  incomplete, so it waits until it is acknowledged
                    if complete && (!passed_ack || !unit.packet().msg_no.is_in_order()) {
                        found = true;
                        break;
                    }
                }
                None => head = None,
            }

            q = self.next_pos(q);
            if q == self.last_ack_pos {
                passed_ack = true;
            }
        }

        match head {
            Some(head) if found => Some(MsgSpan { head, tail: q, passed_ack }),
            Some(head) if self.next_pos(q) == head => {
                debug!("message at slot {} is bigger than the receive buffer, delivering it partially", head);
                Some(MsgSpan { head, tail: q, passed_ack })
            }
            _ => None,
        }
    }
}

/// The receive buffer is a ring of slots referencing units in the unit pool. Packets are
///  deposited at an offset from the ack boundary, and the application reads them either as a
///  byte stream or as messages.
///
/// ```ascii
///        start_pos              last_ack_pos            last_ack_pos + max_pos
///            |  acknowledged         |  not acknowledged         |
///            v                       v                           v
///  ...[ ][ ][u][u][u][u][u][u][u][u][u][ ][u][u][ ][ ][u][ ][ ][u][ ][ ]...
/// ```
///
/// One slot is always kept empty to tell a full ring from an empty one.
pub struct ReceiveBuffer {
    unit_pool: Arc<UnitPool>,
    inner: Mutex<ReceiveBufferInner>,
    data_acked: Notify,
}

impl ReceiveBuffer {
    pub fn new(config: EffectiveReceiveBufferConfig, unit_pool: Arc<UnitPool>) -> ReceiveBuffer {
        ReceiveBuffer {
            unit_pool,
            inner: Mutex::new(ReceiveBufferInner {
                slots: vec![None; config.num_slots],
                start_pos: 0,
                last_ack_pos: 0,
                max_pos: 0,
                notch: 0,
            }),
            data_acked: Notify::new(),
        }
    }

    /// Deposits a unit `offset` slots after the ack boundary. Mapping a packet's sequence
    ///  number to the offset is the caller's job.
    pub fn add_data(&self, unit: UnitId, offset: usize) -> DepositResult {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(offset < inner.size(), "offset {} is outside a ring of {} slots", offset, inner.size());

        let pos = (inner.last_ack_pos + offset) % inner.size();
        if inner.slots[pos].is_some() {
            debug!("duplicate packet at offset {}", offset);
            return DepositResult::Duplicate;
        }

        inner.slots[pos] = Some(unit);
        self.unit_pool.units().mark_occupied(unit);
        if offset > inner.max_pos {
            inner.max_pos = offset;
        }
        DepositResult::Stored
    }

    /// Copies acknowledged data into `dst` as a byte stream, ignoring message boundaries.
    ///  Fully consumed units go back to the pool, a partially consumed unit is continued on the
    ///  next call.
    ///
    /// Returns the number of bytes copied.
    pub fn read_buffer(&self, dst: &mut [u8]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut units = self.unit_pool.units();

        let mut copied = 0;
        inner.consume_bytes(&mut units, dst.len(), |chunk| {
            dst[copied..copied + chunk.len()].copy_from_slice(chunk);
            copied += chunk.len();
            true
        })
    }

    /// Same as `read_buffer`, writing up to `len` bytes to `writer`. A failed write stops the
    ///  copy, and the data of the failed write stays in the buffer.
    pub fn read_buffer_to_writer(&self, mut writer: impl Write, len: usize) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut units = self.unit_pool.units();

        inner.consume_bytes(&mut units, len, |chunk| match writer.write_all(chunk) {
            Ok(()) => true,
            Err(e) => {
                debug!("stopped writing received data: {}", e);
                false
            }
        })
    }

    /// Moves the ack boundary `len` slots forward
    pub fn ack_data(&self, len: usize) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.last_ack_pos = (inner.last_ack_pos + len) % inner.size();
            inner.max_pos = inner.max_pos.saturating_sub(len);
        }
        self.data_acked.notify_waiters();
    }

    /// Returns a future that completes on the next `ack_data()` call. The future is registered
    ///  when this function returns.
    pub fn wait_for_data(&self) -> Notified<'_> {
        self.data_acked.notified()
    }

    /// Marks all units of a message as dropped. They are never delivered, and they are returned
    ///  to the pool by the next scan.
    pub fn drop_msg(&self, msg_no: MsgNo) {
        let mut inner = self.inner.lock().unwrap();
        let mut units = self.unit_pool.units();

        let num_slots = min(inner.data_size() + inner.max_pos + 1, inner.size());
        let mut num_dropped = 0;
        let mut p = inner.start_pos;
        for _ in 0..num_slots {
            if let Some(id) = inner.slots[p] {
                if units.get(id).packet().msg_no.msg_no() == msg_no {
                    units.set_state(id, UnitState::Dropped);
                    num_dropped += 1;
                }
            }
            p = inner.next_pos(p);
        }
        debug!("dropped message #{}: {} units", msg_no, num_dropped);
    }

    /// Copies the next deliverable message into `dst`. If `dst` is too small, the message is
    ///  truncated, but it is still removed from the buffer in its entirety.
    ///
    /// Returns the number of bytes copied, 0 if there is no deliverable message.
    pub fn read_msg(&self, dst: &mut [u8]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut units = self.unit_pool.units();

        let Some(span) = inner.scan_msg(&mut units) else {
            return 0;
        };

        let span_len = (span.tail + inner.size() - span.head) % inner.size() + 1;
        let mut copied = 0;
        let mut p = span.head;
        for _ in 0..span_len {
            if let Some(id) = inner.slots[p] {
                let payload = &units.get(id).packet().payload;
                let n = min(payload.len(), dst.len() - copied);
                dst[copied..copied + n].copy_from_slice(&payload[..n]);
                copied += n;

                if span.passed_ack {
                    units.set_state(id, UnitState::ReadPendingAck);
                }
                else {
                    inner.release_slot(&mut units, p);
                }
            }
            p = inner.next_pos(p);
        }

        if !span.passed_ack {
            inner.start_pos = inner.next_pos(span.tail);
        }
        trace!("delivered message of {} slots, {} bytes", span_len, copied);
        copied
    }

    /// Checks if a message can be delivered. This discards undeliverable units at the start of
    ///  the buffer like `read_msg` does.
    pub fn rcv_msg_available(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let mut units = self.unit_pool.units();
        inner.scan_msg(&mut units).is_some()
    }

    /// number of slots available for new packets
    pub fn avail_buf_size(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.size() - inner.data_size() - 1
    }

    /// number of acknowledged slots not read yet
    pub fn rcv_data_size(&self) -> usize {
        self.inner.lock().unwrap().data_size()
    }
}

impl Drop for ReceiveBuffer {
    fn drop(&mut self) {
        let inner = self.inner.get_mut()
            .unwrap_or_else(|e| e.into_inner());
        let mut units = self.unit_pool.units();

        for slot in inner.slots.iter_mut() {
            if let Some(id) = slot.take() {
                units.release(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use tokio::time;
    use crate::config::EffectiveUnitPoolConfig;
    use crate::msg_no::{MsgFlags, MsgNoField};
    use super::*;

    fn setup(num_slots: usize) -> (Arc<UnitPool>, ReceiveBuffer) {
        let pool = Arc::new(UnitPool::new(EffectiveUnitPoolConfig {
            mss: 16,
            increment: 16,
            max_units: 64,
        }));
        let buffer = ReceiveBuffer::new(EffectiveReceiveBufferConfig { num_slots }, pool.clone());
        (pool, buffer)
    }

    fn deposit(pool: &UnitPool, buffer: &ReceiveBuffer, offset: usize, msg_no: u32, flags: MsgFlags, payload: &[u8]) -> DepositResult {
        let id = {
            let mut units = pool.units();
            let id = units.next_avail_unit().unwrap();
            let packet = units.get_mut(id).packet_mut();
            packet.msg_no = MsgNoField::new(MsgNo::from_raw(msg_no), flags);
            packet.payload.clear();
            packet.payload.extend_from_slice(payload);
            id
        };
        buffer.add_data(id, offset)
    }

    /// deposits a message as consecutive packets starting at `offset`, one packet per payload
    fn deposit_msg(pool: &UnitPool, buffer: &ReceiveBuffer, offset: usize, msg_no: u32, in_order: bool, payloads: &[&[u8]]) {
        let base = if in_order { MsgFlags::IN_ORDER } else { MsgFlags::empty() };
        for (i, payload) in payloads.iter().enumerate() {
            let mut flags = base;
            if i == 0 {
                flags |= MsgFlags::FIRST;
            }
            if i == payloads.len() - 1 {
                flags |= MsgFlags::LAST;
            }
            assert_eq!(deposit(pool, buffer, offset + i, msg_no, flags, payload), DepositResult::Stored);
        }
    }

    fn assert_capacity_invariant(buffer: &ReceiveBuffer, num_slots: usize) {
        assert_eq!(buffer.avail_buf_size() + buffer.rcv_data_size(), num_slots - 1);
    }

    #[test]
    fn test_capacity_accounting() {
        let (pool, buffer) = setup(8);
        assert_eq!(buffer.avail_buf_size(), 7);
        assert_eq!(buffer.rcv_data_size(), 0);

        deposit_msg(&pool, &buffer, 0, 1, false, &[b"a", b"b", b"c"]);
        assert_capacity_invariant(&buffer, 8);

        buffer.ack_data(3);
        assert_eq!(buffer.rcv_data_size(), 3);
        assert_capacity_invariant(&buffer, 8);

        let mut dst = [0u8; 2];
        assert_eq!(buffer.read_buffer(&mut dst), 2);
        assert_eq!(buffer.rcv_data_size(), 1);
        assert_capacity_invariant(&buffer, 8);

        // wrap around the end of the ring
        deposit_msg(&pool, &buffer, 0, 2, false, &[b"d", b"e", b"f", b"g", b"h", b"i"]);
        buffer.ack_data(6);
        assert_eq!(buffer.rcv_data_size(), 7);
        assert_eq!(buffer.avail_buf_size(), 0);
        assert_capacity_invariant(&buffer, 8);
    }

    #[test]
    fn test_duplicate_deposit() {
        let (pool, buffer) = setup(8);
        assert_eq!(deposit(&pool, &buffer, 2, 1, MsgFlags::FIRST | MsgFlags::LAST, b"x"), DepositResult::Stored);
        assert_eq!(deposit(&pool, &buffer, 2, 1, MsgFlags::FIRST | MsgFlags::LAST, b"x"), DepositResult::Duplicate);
        assert_eq!(pool.units().occupied_count(), 1);
    }

    #[rstest]
    #[case::acked_in_order(true, true)]
    #[case::acked_unordered(true, false)]
    #[case::unacked_unordered(false, false)]
    fn test_read_msg_delivers_intact_message_once(#[case] acked: bool, #[case] in_order: bool) {
        let (pool, buffer) = setup(8);
        deposit_msg(&pool, &buffer, 0, 1, in_order, &[b"abc", b"def", b"gh"]);
        if acked {
            buffer.ack_data(3);
        }

        assert!(buffer.rcv_msg_available());
        let mut dst = [0u8; 100];
        assert_eq!(buffer.read_msg(&mut dst), 8);
        assert_eq!(&dst[..8], b"abcdefgh");

        assert!(!buffer.rcv_msg_available());
        assert_eq!(buffer.read_msg(&mut dst), 0);

        if !acked {
            // delivered, but retained until acknowledged
            assert_eq!(pool.units().occupied_count(), 3);
            buffer.ack_data(3);
            assert!(!buffer.rcv_msg_available());
        }
        assert_eq!(pool.units().occupied_count(), 0);
    }

    #[test]
    fn test_in_order_message_waits_for_ack() {
        let (pool, buffer) = setup(8);
        deposit_msg(&pool, &buffer, 0, 1, true, &[b"abc", b"def"]);

        let mut dst = [0u8; 100];
        assert_eq!(buffer.read_msg(&mut dst), 0);

        buffer.ack_data(2);
        assert_eq!(buffer.read_msg(&mut dst), 6);
        assert_eq!(&dst[..6], b"abcdef");
    }

    #[test]
    fn test_unordered_message_overtakes_incomplete_one() {
        let (pool, buffer) = setup(8);
        assert_eq!(deposit(&pool, &buffer, 0, 1, MsgFlags::FIRST | MsgFlags::IN_ORDER, b"a"), DepositResult::Stored);
        assert_eq!(deposit(&pool, &buffer, 2, 1, MsgFlags::LAST | MsgFlags::IN_ORDER, b"c"), DepositResult::Stored);
        deposit_msg(&pool, &buffer, 3, 2, true, &[b"in order"]);
        assert!(!buffer.rcv_msg_available());

        deposit_msg(&pool, &buffer, 4, 3, false, &[b"unordered"]);
        let mut dst = [0u8; 100];
        assert_eq!(buffer.read_msg(&mut dst), 9);
        assert_eq!(&dst[..9], b"unordered");
        assert!(!buffer.rcv_msg_available());
    }

    #[test]
    fn test_gap_is_not_delivered_until_filled() {
        let (pool, buffer) = setup(8);
        assert_eq!(deposit(&pool, &buffer, 0, 1, MsgFlags::FIRST, b"abc"), DepositResult::Stored);
        assert_eq!(deposit(&pool, &buffer, 2, 1, MsgFlags::LAST, b"ghi"), DepositResult::Stored);

        let mut dst = [0u8; 100];
        assert_eq!(buffer.read_msg(&mut dst), 0);
        assert!(!buffer.rcv_msg_available());

        assert_eq!(deposit(&pool, &buffer, 1, 1, MsgFlags::empty(), b"def"), DepositResult::Stored);
        assert_eq!(buffer.read_msg(&mut dst), 9);
        assert_eq!(&dst[..9], b"abcdefghi");
    }

    #[test]
    fn test_dropped_message_is_never_delivered() {
        let (pool, buffer) = setup(8);
        assert_eq!(deposit(&pool, &buffer, 0, 1, MsgFlags::FIRST, b"abc"), DepositResult::Stored);
        assert_eq!(deposit(&pool, &buffer, 2, 1, MsgFlags::LAST, b"ghi"), DepositResult::Stored);
        deposit_msg(&pool, &buffer, 3, 2, false, &[b"next"]);

        buffer.drop_msg(MsgNo::from_raw(1));
        assert_eq!(deposit(&pool, &buffer, 1, 1, MsgFlags::empty(), b"def"), DepositResult::Stored);
        buffer.ack_data(4);

        let mut dst = [0u8; 100];
        assert_eq!(buffer.read_msg(&mut dst), 4);
        assert_eq!(&dst[..4], b"next");
        assert_eq!(buffer.read_msg(&mut dst), 0);
        assert_eq!(pool.units().occupied_count(), 0);
    }

    #[test]
    fn test_read_msg_truncates() {
        let (pool, buffer) = setup(8);
        deposit_msg(&pool, &buffer, 0, 1, false, &[b"abc", b"def"]);
        deposit_msg(&pool, &buffer, 2, 2, false, &[b"xyz"]);
        buffer.ack_data(3);

        let mut dst = [0u8; 4];
        assert_eq!(buffer.read_msg(&mut dst), 4);
        assert_eq!(&dst, b"abcd");

        // the rest of the first message is gone
        assert_eq!(buffer.read_msg(&mut dst), 3);
        assert_eq!(&dst[..3], b"xyz");
        assert_eq!(pool.units().occupied_count(), 0);
    }

    #[test]
    fn test_message_bigger_than_ring_is_delivered_partially() {
        let (pool, buffer) = setup(4);
        assert_eq!(deposit(&pool, &buffer, 0, 1, MsgFlags::FIRST, b"ab"), DepositResult::Stored);
        assert_eq!(deposit(&pool, &buffer, 1, 1, MsgFlags::empty(), b"cd"), DepositResult::Stored);
        assert_eq!(deposit(&pool, &buffer, 2, 1, MsgFlags::empty(), b"ef"), DepositResult::Stored);

        let mut dst = [0u8; 100];
        assert_eq!(buffer.read_msg(&mut dst), 6);
        assert_eq!(&dst[..6], b"abcdef");
    }

    #[test]
    fn test_read_buffer_with_partial_reads() {
        let (pool, buffer) = setup(8);
        deposit_msg(&pool, &buffer, 0, 1, false, &[&[1, 2, 3], &[4, 5, 6]]);
        deposit_msg(&pool, &buffer, 2, 2, false, &[&[7]]);
        buffer.ack_data(2);

        let mut dst = [0u8; 2];
        assert_eq!(buffer.read_buffer(&mut dst), 2);
        assert_eq!(dst, [1, 2]);

        let mut dst = [0u8; 3];
        assert_eq!(buffer.read_buffer(&mut dst), 3);
        assert_eq!(dst, [3, 4, 5]);
        assert_eq!(pool.units().occupied_count(), 2);

        // stops at the ack boundary
        let mut dst = [0u8; 10];
        assert_eq!(buffer.read_buffer(&mut dst), 1);
        assert_eq!(dst[0], 6);
        assert_eq!(buffer.read_buffer(&mut dst), 0);
        assert_eq!(pool.units().occupied_count(), 1);

        buffer.ack_data(1);
        assert_eq!(buffer.read_buffer(&mut dst), 1);
        assert_eq!(dst[0], 7);
        assert_eq!(pool.units().occupied_count(), 0);
    }

    struct FailingWriter;
    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_read_buffer_to_writer() {
        let (pool, buffer) = setup(8);
        deposit_msg(&pool, &buffer, 0, 1, false, &[b"hello ", b"world"]);
        buffer.ack_data(2);

        assert_eq!(buffer.read_buffer_to_writer(FailingWriter, 100), 0);
        assert_eq!(buffer.rcv_data_size(), 2);

        let mut out = Vec::new();
        assert_eq!(buffer.read_buffer_to_writer(&mut out, 8), 8);
        assert_eq!(buffer.read_buffer_to_writer(&mut out, 100), 3);
        assert_eq!(out, b"hello world");
        assert_eq!(buffer.rcv_data_size(), 0);
    }

    #[test]
    fn test_drop_returns_units_to_pool() {
        let (pool, buffer) = setup(8);
        deposit_msg(&pool, &buffer, 0, 1, false, &[b"a", b"b"]);
        deposit_msg(&pool, &buffer, 4, 2, false, &[b"c"]);
        assert_eq!(pool.units().occupied_count(), 3);

        drop(buffer);
        assert_eq!(pool.units().occupied_count(), 0);
    }

    #[test]
    fn test_wait_for_data() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async move {
            let (pool, buffer) = setup(8);
            deposit_msg(&pool, &buffer, 0, 1, false, &[b"a"]);

            let waiter = buffer.wait_for_data();
            buffer.ack_data(1);
            time::timeout(Duration::from_secs(1), waiter).await
                .expect("ack_data should notify waiters");
            assert_eq!(buffer.rcv_data_size(), 1);
        });
    }
}
