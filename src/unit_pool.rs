//! The unit pool is the single owner of all receive units. Packets are received into a free
//!  unit, which is then deposited in a receive buffer by its `UnitId`. The receive buffer
//!  never owns a unit, it only holds ids and moves units through their lifecycle via the
//!  pool's API:
//!
//! ```ascii
//!   Free --add_data--> Occupied --read (acknowledged)--------------------> Free
//!                         |      --read (not yet acknowledged)--> ReadPendingAck --retire--> Free
//!                         |      --drop_msg--> Dropped --retire--> Free
//! ```
//!
//! The pool is shared between all receive buffers of a socket.

use std::sync::{Mutex, MutexGuard};
use bytes::BytesMut;
use tracing::{debug, trace, warn};
use crate::config::EffectiveUnitPoolConfig;
use crate::msg_no::MsgNoField;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct UnitId(usize);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum UnitState {
    /// available for receiving a packet
    Free,
    /// deposited in a receive buffer, not delivered yet
    Occupied,
    /// delivered to the application out of order, but not yet acknowledged - the unit must not
    ///  be delivered again, and it is retired once the ack boundary passes it
    ReadPendingAck,
    /// the message was dropped, the unit is skipped and retired
    Dropped,
}

#[derive(Debug)]
pub struct Packet {
    pub msg_no: MsgNoField,
    pub payload: BytesMut,
}

#[derive(Debug)]
pub struct Unit {
    packet: Packet,
    state: UnitState,
}

impl Unit {
    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn packet_mut(&mut self) -> &mut Packet {
        &mut self.packet
    }

    pub fn state(&self) -> UnitState {
        self.state
    }
}

pub struct PooledUnits {
    config: EffectiveUnitPoolConfig,
    units: Vec<Unit>,
    /// number of units that are not `Free`
    occupied_count: usize,
    /// position where the search for the next free unit starts
    search_pos: usize,
}

impl PooledUnits {
    pub fn get(&self, id: UnitId) -> &Unit {
        &self.units[id.0]
    }

    pub fn get_mut(&mut self, id: UnitId) -> &mut Unit {
        &mut self.units[id.0]
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn occupied_count(&self) -> usize {
        self.occupied_count
    }

    /// Returns a free unit to receive the next packet into. The unit stays `Free` until it is
    ///  deposited in a receive buffer, so a packet that is not deposited (e.g. a duplicate)
    ///  does not need to be given back.
    ///
    /// The pool grows by one increment when more than 90% of the units are in use.
    pub fn next_avail_unit(&mut self) -> Option<UnitId> {
        if self.occupied_count * 10 > self.units.len() * 9 {
            self.grow();
        }

        if self.occupied_count >= self.units.len() {
            debug!("all {} receive units are in use", self.units.len());
            return None;
        }

        for _ in 0..self.units.len() {
            let candidate = self.search_pos;
            self.search_pos = (self.search_pos + 1) % self.units.len();

            if self.units[candidate].state == UnitState::Free {
                trace!("handing out receive unit #{}", candidate);
                return Some(UnitId(candidate));
            }
        }
        None
    }

    fn grow(&mut self) {
        let increment = self.config.increment
            .min(self.config.max_units.saturating_sub(self.units.len()));
        if increment == 0 {
            return;
        }

        if let Err(e) = self.units.try_reserve_exact(increment) {
            warn!("unable to grow the unit pool by {} units: {}", increment, e);
            return;
        }

        debug!("growing the unit pool from {} to {} units", self.units.len(), self.units.len() + increment);
        for _ in 0..increment {
            self.units.push(Self::new_unit(self.config.mss));
        }
    }

    fn new_unit(mss: usize) -> Unit {
        Unit {
            packet: Packet {
                msg_no: MsgNoField::default(),
                payload: BytesMut::with_capacity(mss),
            },
            state: UnitState::Free,
        }
    }

    pub(crate) fn mark_occupied(&mut self, id: UnitId) {
        let unit = &mut self.units[id.0];
        debug_assert_eq!(unit.state, UnitState::Free, "depositing a unit that is already in use");
        if unit.state == UnitState::Free {
            self.occupied_count += 1;
        }
        unit.state = UnitState::Occupied;
    }

    pub(crate) fn set_state(&mut self, id: UnitId, state: UnitState) {
        debug_assert_ne!(state, UnitState::Free, "units are freed through release()");
        self.units[id.0].state = state;
    }

    /// Returns a unit to the pool, clearing its payload
    pub(crate) fn release(&mut self, id: UnitId) {
        let unit = &mut self.units[id.0];
        if unit.state != UnitState::Free {
            self.occupied_count -= 1;
        }
        unit.state = UnitState::Free;
        unit.packet.payload.clear();
    }
}

pub struct UnitPool {
    units: Mutex<PooledUnits>,
}

impl UnitPool {
    pub fn new(config: EffectiveUnitPoolConfig) -> UnitPool {
        let initial = config.increment.min(config.max_units);
        let units = (0..initial)
            .map(|_| PooledUnits::new_unit(config.mss))
            .collect();

        UnitPool {
            units: Mutex::new(PooledUnits {
                config,
                units,
                occupied_count: 0,
                search_pos: 0,
            }),
        }
    }

    pub fn units(&self) -> MutexGuard<'_, PooledUnits> {
        self.units.lock().unwrap()
    }
}
