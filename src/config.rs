use std::time::Duration;
use anyhow::bail;

pub struct UdtConfig {
    /// This is the payload size of a single data packet, i.e. the number of bytes a send buffer
    ///  block or a receive unit holds. Messages longer than this are split across several
    ///  packets.
    ///
    /// The MSS is a per-connection agreement between the peers, negotiated during the handshake
    ///  which lives outside this crate. The buffers take it as given.
    pub mss: usize,

    /// This is the initial number of blocks in a send buffer. It is also the increment by which
    ///  the send buffer grows when an application writes more data than fits.
    pub send_buffer_blocks: usize,

    /// This is the number of slots in a receive buffer's ring. One slot is always kept empty,
    ///  so a ring of N slots holds at most N-1 units.
    pub receive_buffer_slots: usize,

    /// Receive units are allocated in chunks of this size when the pool runs low
    pub unit_pool_increment: usize,
    /// The unit pool never grows beyond this number of units
    pub unit_pool_max_units: usize,

    /// The 'SYN' interval is the protocol's basic clock tick - rate control is done at most once
    ///  per interval
    pub syn_interval: Duration,

    /// This is the seed for the maximum congestion window, in packets. It is usually replaced
    ///  by the flow window the peer advertises during the handshake.
    pub max_flow_window: u32,
}

impl UdtConfig {
    /// full Ethernet frames, IP V4 without optional headers
    pub fn default_ipv4() -> UdtConfig {
        UdtConfig {
            mss: 1456,
            send_buffer_blocks: 8192,
            receive_buffer_slots: 8192,
            unit_pool_increment: 32,
            unit_pool_max_units: 32 * 256,
            syn_interval: Duration::from_millis(10),
            max_flow_window: 25600,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mss == 0 {
            bail!("MSS must be positive");
        }
        if self.send_buffer_blocks == 0 {
            bail!("send buffer must have at least one block");
        }
        if self.receive_buffer_slots < 2 {
            bail!("receive buffer needs at least two slots since one slot is always kept empty");
        }
        if self.unit_pool_increment == 0 || self.unit_pool_max_units < self.unit_pool_increment {
            bail!("unit pool must be able to hold at least one increment of units");
        }
        if self.syn_interval.is_zero() {
            bail!("SYN interval must be positive");
        }

        Ok(())
    }

    pub fn send_buffer_config(&self) -> EffectiveSendBufferConfig {
        EffectiveSendBufferConfig {
            mss: self.mss,
            blocks_per_chunk: self.send_buffer_blocks,
        }
    }

    pub fn receive_buffer_config(&self) -> EffectiveReceiveBufferConfig {
        EffectiveReceiveBufferConfig {
            num_slots: self.receive_buffer_slots,
        }
    }

    pub fn unit_pool_config(&self) -> EffectiveUnitPoolConfig {
        EffectiveUnitPoolConfig {
            mss: self.mss,
            increment: self.unit_pool_increment,
            max_units: self.unit_pool_max_units,
        }
    }

    pub fn congestion_control_config(&self) -> EffectiveCongestionControlConfig {
        EffectiveCongestionControlConfig {
            mss: self.mss,
            syn_interval: self.syn_interval,
            max_cwnd_size: self.max_flow_window,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EffectiveSendBufferConfig {
    pub mss: usize,
    /// initial capacity and growth increment, in blocks
    pub blocks_per_chunk: usize,
}

#[derive(Debug, Clone)]
pub struct EffectiveReceiveBufferConfig {
    pub num_slots: usize,
}

#[derive(Debug, Clone)]
pub struct EffectiveUnitPoolConfig {
    pub mss: usize,
    pub increment: usize,
    pub max_units: usize,
}

#[derive(Debug, Clone)]
pub struct EffectiveCongestionControlConfig {
    pub mss: usize,
    pub syn_interval: Duration,
    pub max_cwnd_size: u32,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_default_is_valid() {
        UdtConfig::default_ipv4().validate().unwrap();
    }

    #[rstest]
    #[case::zero_mss(|c: &mut UdtConfig| c.mss = 0)]
    #[case::no_send_blocks(|c: &mut UdtConfig| c.send_buffer_blocks = 0)]
    #[case::receive_ring_too_small(|c: &mut UdtConfig| c.receive_buffer_slots = 1)]
    #[case::zero_pool_increment(|c: &mut UdtConfig| c.unit_pool_increment = 0)]
    #[case::pool_max_below_increment(|c: &mut UdtConfig| c.unit_pool_max_units = 16)]
    #[case::zero_syn_interval(|c: &mut UdtConfig| c.syn_interval = Duration::ZERO)]
    fn test_validate_rejects(#[case] tweak: fn(&mut UdtConfig)) {
        let mut config = UdtConfig::default_ipv4();
        tweak(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_configs() {
        let config = UdtConfig::default_ipv4();

        let send = config.send_buffer_config();
        assert_eq!(send.mss, 1456);
        assert_eq!(send.blocks_per_chunk, 8192);

        assert_eq!(config.receive_buffer_config().num_slots, 8192);

        let pool = config.unit_pool_config();
        assert_eq!(pool.increment, 32);
        assert_eq!(pool.max_units, 8192);

        let cc = config.congestion_control_config();
        assert_eq!(cc.syn_interval, Duration::from_millis(10));
        assert_eq!(cc.max_cwnd_size, 25600);
    }
}
