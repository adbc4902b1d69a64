//! Rate based congestion control: the sender paces packets with a fixed interval
//!  (`pkt_snd_period`) and bounds the number of unacknowledged packets with a congestion window.
//!
//! The controller starts in slow start, growing the window by the number of acknowledged packets
//!  while sending as fast as possible. Slow start ends for good once the window exceeds the
//!  peer's flow window, or on the first loss or timeout.
//!
//! After that, the sending rate is adjusted at most once per rate control interval (the SYN
//!  interval):
//! * *Increase* on ACK: the number of additional packets per interval depends on the spare
//!    bandwidth on a logarithmic scale, so the rate grows quickly far from the link capacity and
//!    slowly close to it.
//! * *Decrease* on loss: the interval grows by a factor of 1.125. A 'congestion period' starts
//!    with a loss of a packet sent after the previous decrease. Within a congestion period,
//!    further losses lead to at most 5 more decreases, and only for every n-th loss report, n
//!    being randomized based on the average number of loss reports per period. Randomization
//!    keeps concurrent flows from decreasing their rates in lockstep.

use std::cmp::min;
use std::time::Duration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::config::EffectiveCongestionControlConfig;
use crate::seq_no::SeqNo;

const INITIAL_CWND_SIZE: f64 = 16.0;
const INITIAL_PKT_SND_PERIOD: f64 = 1.0;

/// minimum rate increase, in packets per rate control interval
const MIN_INC: f64 = 0.01;
const DECREASE_FACTOR: f64 = 1.125;
const MAX_DECREASES_PER_PERIOD: u32 = 5;
/// spare bandwidth is capped at `bandwidth / BANDWIDTH_HEADROOM_DIVISOR` while recovering from a
///  decrease
const BANDWIDTH_HEADROOM_DIVISOR: u32 = 9;

/// mask for the flag marking the start of a range in a raw loss list entry
const LOSS_RANGE_FLAG: u32 = 0x8000_0000;

#[derive(Debug)]
pub struct UdtCongestionControl {
    syn_interval: Duration,
    mss: usize,
    /// estimated link capacity, packets per second
    bandwidth: u32,
    max_cwnd_size: f64,
    snd_curr_seq_no: SeqNo,
    /// packets per second received by the peer, 0 if unknown
    rcv_rate: u32,
    rtt: Duration,

    ack_period: Duration,
    ack_interval: u32,
    rto: Option<Duration>,

    /// microseconds between two packets
    pkt_snd_period: f64,
    cwnd_size: f64,

    rc_interval: Duration,
    last_rc_time: Instant,
    slow_start: bool,
    last_ack: SeqNo,
    /// a loss was reported since the last rate increase
    loss: bool,
    /// highest sequence number sent at the time of the last decrease
    last_dec_seq: SeqNo,
    last_dec_period: f64,
    nak_count: u32,
    dec_random: u32,
    avg_nak_num: u32,
    dec_count: u32,
    rng: StdRng,
}

impl UdtCongestionControl {
    pub fn new(config: EffectiveCongestionControlConfig) -> UdtCongestionControl {
        let mut result = UdtCongestionControl {
            syn_interval: config.syn_interval,
            mss: config.mss,
            bandwidth: 0,
            max_cwnd_size: config.max_cwnd_size as f64,
            snd_curr_seq_no: SeqNo::ZERO,
            rcv_rate: 0,
            rtt: Duration::ZERO,
            ack_period: Duration::ZERO,
            ack_interval: 0,
            rto: None,
            pkt_snd_period: INITIAL_PKT_SND_PERIOD,
            cwnd_size: INITIAL_CWND_SIZE,
            rc_interval: config.syn_interval,
            last_rc_time: Instant::now(),
            slow_start: true,
            last_ack: SeqNo::ZERO,
            loss: false,
            last_dec_seq: SeqNo::ZERO,
            last_dec_period: 1.0,
            nak_count: 0,
            dec_random: 1,
            avg_nak_num: 0,
            dec_count: 0,
            rng: StdRng::seed_from_u64(0),
        };
        result.init();
        result
    }

    /// (Re-)starts the controller in slow start. This should be called after the current send
    ///  sequence number is known, i.e. after the connection is established.
    pub fn init(&mut self) {
        self.rc_interval = self.syn_interval;
        self.last_rc_time = Instant::now();
        self.set_ack_timer(self.rc_interval);

        self.slow_start = true;
        self.last_ack = self.snd_curr_seq_no;
        self.loss = false;
        self.last_dec_seq = self.last_ack.decr();
        self.last_dec_period = 1.0;
        self.avg_nak_num = 0;
        self.nak_count = 0;
        self.dec_random = 1;

        self.cwnd_size = INITIAL_CWND_SIZE;
        self.pkt_snd_period = INITIAL_PKT_SND_PERIOD;
    }

    fn rtt_plus_rc_micros(&self) -> f64 {
        (self.rtt + self.rc_interval).as_micros() as f64
    }

    fn rc_interval_micros(&self) -> f64 {
        self.rc_interval.as_micros() as f64
    }

    fn leave_slow_start(&mut self) {
        self.slow_start = false;
        self.pkt_snd_period = if self.rcv_rate > 0 {
            1_000_000.0 / self.rcv_rate as f64
        }
        else {
            self.cwnd_size / self.rtt_plus_rc_micros()
        };
        debug!("leaving slow start with a sending period of {}µs", self.pkt_snd_period);
    }

    pub fn on_ack(&mut self, ack: SeqNo) {
        let now = Instant::now();
        if now.saturating_duration_since(self.last_rc_time) < self.rc_interval {
            return;
        }
        self.last_rc_time = now;

        if self.slow_start {
            self.cwnd_size += self.last_ack.seq_len(ack) as f64;
            self.last_ack = ack;

            if self.cwnd_size > self.max_cwnd_size {
                self.slow_start = false;
                self.pkt_snd_period = if self.rcv_rate > 0 {
                    1_000_000.0 / self.rcv_rate as f64
                }
                else {
                    self.rtt_plus_rc_micros() / self.cwnd_size
                };
                debug!("congestion window {} exceeds the maximum of {}, leaving slow start with a sending period of {}µs",
                    self.cwnd_size, self.max_cwnd_size, self.pkt_snd_period);
            }
        }
        else {
            self.cwnd_size = self.rcv_rate as f64 / 1_000_000.0 * self.rtt_plus_rc_micros() + 16.0;
        }

        if self.slow_start {
            return;
        }

        if self.loss {
            trace!("loss since the last rate control tick - no increase");
            self.loss = false;
            return;
        }

        let mut spare_bandwidth = (self.bandwidth as f64 - 1_000_000.0 / self.pkt_snd_period) as i64;
        let headroom = (self.bandwidth / BANDWIDTH_HEADROOM_DIVISOR) as i64;
        if self.pkt_snd_period > self.last_dec_period && headroom < spare_bandwidth {
            spare_bandwidth = headroom;
        }

        let inc = if spare_bandwidth <= 0 {
            MIN_INC
        }
        else {
            let mss = self.mss as f64;
            let magnitude = (spare_bandwidth as f64 * mss * 8.0).log10().ceil() as i32;
            (10f64.powi(magnitude) * 0.000_001_5 / mss).max(MIN_INC)
        };

        let rc = self.rc_interval_micros();
        self.pkt_snd_period = (self.pkt_snd_period * rc) / (self.pkt_snd_period * inc + rc);
        trace!("increased sending rate by {} packets per interval: period is {}µs", inc, self.pkt_snd_period);
    }

    /// `loss_list` holds raw loss list entries as they are reported by the peer: sequence
    ///  numbers, with the highest bit set for the first number of a range.
    pub fn on_loss(&mut self, loss_list: &[u32]) {
        let Some(&first_lost) = loss_list.first() else {
            return;
        };

        if self.slow_start {
            self.leave_slow_start();
        }

        self.loss = true;

        let first_lost = SeqNo::from_raw((first_lost & !LOSS_RANGE_FLAG) as i32);
        if first_lost.seq_cmp(self.last_dec_seq) > 0 {
            // a packet sent after the last decrease was lost: start a new congestion period
            self.last_dec_period = self.pkt_snd_period;
            self.pkt_snd_period = (self.pkt_snd_period * DECREASE_FACTOR).ceil();

            self.avg_nak_num = (self.avg_nak_num as f64 * 0.875 + self.nak_count as f64 * 0.125).ceil() as u32;
            self.nak_count = 1;
            self.dec_count = 1;

            self.last_dec_seq = self.snd_curr_seq_no;

            self.rng = StdRng::seed_from_u64(self.last_dec_seq.to_raw() as u64);
            let random_factor: f64 = self.rng.gen();
            self.dec_random = ((self.avg_nak_num as f64 * random_factor).ceil() as u32).max(1);

            debug!("new congestion period at {}: sending period {}µs, decreasing for every {} NAKs",
                self.last_dec_seq, self.pkt_snd_period, self.dec_random);
        }
        else {
            let may_decrease = self.dec_count < MAX_DECREASES_PER_PERIOD;
            self.dec_count = self.dec_count.saturating_add(1);

            if may_decrease {
                self.nak_count += 1;
                if self.nak_count % self.dec_random == 0 {
                    self.pkt_snd_period = (self.pkt_snd_period * DECREASE_FACTOR).ceil();
                    self.last_dec_seq = self.snd_curr_seq_no;
                    debug!("decreasing sending rate within congestion period: period is {}µs", self.pkt_snd_period);
                }
            }
        }
    }

    pub fn on_timeout(&mut self) {
        if self.slow_start {
            self.leave_slow_start();
        }
        else {
            // a timeout outside of slow start does not change the sending rate
            trace!("timeout after slow start - keeping the sending rate");
        }
    }

    /// The time between two ACKs, capped at the SYN interval
    pub fn set_ack_timer(&mut self, period: Duration) {
        self.ack_period = min(period, self.syn_interval);
    }

    /// number of packets between two ACKs, 0 for time based ACKs only
    pub fn set_ack_interval(&mut self, num_packets: u32) {
        self.ack_interval = num_packets;
    }

    /// Overrides the retransmission timeout computed from RTT measurements
    pub fn set_rto(&mut self, rto: Duration) {
        self.rto = Some(rto);
    }

    pub fn set_mss(&mut self, mss: usize) {
        self.mss = mss;
    }

    pub fn set_bandwidth(&mut self, packets_per_second: u32) {
        self.bandwidth = packets_per_second;
    }

    pub fn set_max_cwnd_size(&mut self, num_packets: u32) {
        self.max_cwnd_size = num_packets as f64;
    }

    pub fn set_snd_curr_seq_no(&mut self, seq_no: SeqNo) {
        self.snd_curr_seq_no = seq_no;
    }

    pub fn set_rcv_rate(&mut self, packets_per_second: u32) {
        self.rcv_rate = packets_per_second;
    }

    pub fn set_rtt(&mut self, rtt: Duration) {
        self.rtt = rtt;
    }

    /// microseconds between two data packets
    pub fn pkt_snd_period(&self) -> f64 {
        self.pkt_snd_period
    }

    pub fn cwnd_size(&self) -> f64 {
        self.cwnd_size
    }

    pub fn is_slow_start(&self) -> bool {
        self.slow_start
    }

    pub fn ack_period(&self) -> Duration {
        self.ack_period
    }

    pub fn ack_interval(&self) -> u32 {
        self.ack_interval
    }

    /// `None` unless a retransmission timeout was set explicitly
    pub fn rto(&self) -> Option<Duration> {
        self.rto
    }
}
