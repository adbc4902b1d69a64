//! This crate is the data movement and rate control core of a UDT style transport: a reliable,
//!  message oriented protocol on top of UDP. It contains the parts that are independent of
//!  sockets, handshakes and timers:
//!
//! * the *send buffer* holds outbound data until it is acknowledged, serves it for the first
//!    transmission and for retransmissions, and expires messages with a time to live
//! * the *receive buffer* holds inbound packets until they can be delivered, either as a byte
//!    stream or reassembled into messages (in order or out of order)
//! * the *congestion controller* maps ACK, loss and timeout events to a sending rate and a
//!    congestion window
//!
//! The caller is responsible for the rest: mapping sequence numbers to buffer offsets, driving
//!  the rate control timer, and pacing packets according to the controller's sending period.
//!
//! ## Message number field
//!
//! Every data packet carries a 32-bit field with its message's number and its position in the
//!  message (see [msg_no]):
//!
//! ```ascii
//! bit 31:     first packet of a message
//! bit 30:     last packet of a message
//! bit 29:     in-order delivery required
//! bits 28-0:  message number, wrapping and skipping 0
//! ```
//!
//! ## Threading
//!
//! Each buffer guards its cursors with a single mutex, so the application side and the
//!  acknowledgement processing side can share a buffer (typically through an `Arc`). The
//!  congestion controller is not synchronized - the caller must serialize ACK, loss and timeout
//!  events.
//!
//! The unit pool is shared between receive buffers. When a receive buffer needs both locks, it
//!  acquires its own lock first and the pool's lock second.

pub mod config;
pub mod seq_no;
pub mod msg_no;
pub mod unit_pool;
pub mod send_buffer;
pub mod receive_buffer;
pub mod congestion_control;
