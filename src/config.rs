use {MILLISECONDS, RESET_TOKEN_SIZE};

/// Parameters governing the core QUIC state machine.
pub struct Config {
    /// Maximum number of peer-initiated bidirectional streams that may exist
    /// at one time.
    pub max_remote_bi_streams: u16,
    /// Maximum number of peer-initiated unidirectional streams that may
    /// exist at one time.
    pub max_remote_uni_streams: u16,
    /// Maximum duration of inactivity to accept before timing out the
    /// connection (seconds).
    ///
    /// The actual value used is the minimum of this and the peer's own idle
    /// timeout. 0 for none.
    pub idle_timeout: u16,
    /// Maximum number of bytes the peer may transmit on any one stream
    /// before becoming blocked.
    ///
    /// This should be set to at least the expected connection latency
    /// multiplied by the maximum desired throughput. Setting this smaller
    /// than `receive_window` helps ensure that a single stream doesn't
    /// monopolize receive buffers, which may otherwise occur if the
    /// application chooses not to read from a large stream for a time while
    /// still requiring data on other streams.
    pub stream_receive_window: u32,
    /// Maximum number of bytes the peer may transmit across all streams of a
    /// connection before becoming blocked.
    pub receive_window: u32,
    /// Largest UDP payload we will advertise accepting.
    pub max_packet_size: u16,
    /// Scaling exponent advertised for the ACK Delay field of ACKs we send.
    pub ack_delay_exponent: u8,
    /// Length of the connection IDs we issue, 0 or 4–18 bytes.
    pub local_cid_len: usize,
    /// Token the peer can use to reset this connection statelessly,
    /// advertised by servers in the transport parameters.
    pub stateless_reset_token: Option<[u8; RESET_TOKEN_SIZE]>,

    /// Maximum number of tail loss probes before an RTO fires.
    pub max_tlps: u32,
    /// Maximum reordering in packet number space before FACK style loss
    /// detection considers a packet lost.
    pub reordering_threshold: u32,
    /// Minimum time in the future a tail loss probe alarm may be set for.
    pub min_tlp_timeout: u64,
    /// Minimum time in the future an RTO alarm may be set for.
    pub min_rto_timeout: u64,
    /// The length of our delayed ack timer.
    pub delayed_ack_timeout: u64,
    /// The default RTT used before an RTT sample is taken.
    pub default_initial_rtt: u64,
    /// How long each outstanding path validation challenge remains usable.
    pub path_challenge_timeout: u64,

    /// The max packet size used for calculating default and minimum
    /// congestion windows.
    pub default_mss: u64,
    /// Default limit on the amount of outstanding data in bytes.
    pub initial_window: u64,
    /// Default minimum congestion window.
    pub minimum_window: u64,
    /// Reduction in congestion window when a new loss event is detected.
    /// 0.16 fixed point format.
    pub loss_reduction_factor: u16,
}

impl Default for Config {
    fn default() -> Self {
        const EXPECTED_RTT: u32 = 100; // ms
        const MAX_STREAM_BANDWIDTH: u32 = 12500 * 1000; // bytes/s
                                                        // Window size needed to avoid pipeline
                                                        // stalls
        const STREAM_RWND: u32 = MAX_STREAM_BANDWIDTH / 1000 * EXPECTED_RTT;
        Self {
            max_remote_bi_streams: 0,
            max_remote_uni_streams: 0,
            idle_timeout: 10,
            stream_receive_window: STREAM_RWND,
            receive_window: 8 * STREAM_RWND,
            max_packet_size: ::MAX_PKT_SIZE,
            ack_delay_exponent: 3,
            local_cid_len: 8,
            stateless_reset_token: None,

            max_tlps: 2,
            reordering_threshold: 3,
            min_tlp_timeout: 10 * MILLISECONDS,
            min_rto_timeout: 200 * MILLISECONDS,
            delayed_ack_timeout: 25 * MILLISECONDS,
            default_initial_rtt: u64::from(EXPECTED_RTT) * MILLISECONDS,
            path_challenge_timeout: 3 * ::SECONDS,

            default_mss: 1460,
            initial_window: 10 * 1460,
            minimum_window: 2 * 1460,
            loss_reduction_factor: 0x8000, // 1/2
        }
    }
}
