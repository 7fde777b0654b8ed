//! Path MTU discovery for one forwarder.
//!
//! Works in terms of the effective PMTU: the largest IP packet a host on
//! the overlay may send through this forwarder. A send failing with
//! "message too big" seeds a binary search between 8 and the reported
//! limit; each candidate is probed with a special frame of that size and
//! confirmed by an acknowledgement over TCP.

use std::time::Duration;

use tracing::{debug, info};

use super::frame::{ETHERNET_OVERHEAD, FRAME_OVERHEAD, UDP_OVERHEAD};

/// Effective PMTU assumed until the network says otherwise.
pub const DEFAULT_PMTU: usize = 65535;

/// Probes sent for one candidate before it is declared bad.
pub const PMTU_VERIFY_ATTEMPTS: u32 = 8;

/// Timeout for the first probe of a candidate; doubles with each retry.
pub const PMTU_VERIFY_TIMEOUT: Duration = Duration::from_millis(10);

/// What the forwarder should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmtuAction {
    /// Send a probe for `epmtu` and arm the probe timer.
    SendProbe {
        /// Candidate effective PMTU.
        epmtu: usize,
        /// How long to wait for the acknowledgement.
        timeout: Duration,
    },
    /// Discovery finished at this effective PMTU; disarm the probe timer.
    Verified(usize),
    /// Nothing to do.
    None,
}

/// Discovery state.
#[derive(Debug, Clone)]
pub struct PmtuDiscovery {
    overhead: usize,
    effective_pmtu: usize,
    max_payload: usize,
    highest_good: usize,
    lowest_bad: usize,
    /// 0 while no search is running.
    candidate: usize,
    tests_sent: u32,
}

impl PmtuDiscovery {
    /// Creates the state for a forwarder whose datagrams carry
    /// `packet_overhead` bytes on top of their frames.
    #[must_use]
    pub const fn new(packet_overhead: usize) -> Self {
        Self {
            overhead: UDP_OVERHEAD + packet_overhead + FRAME_OVERHEAD + ETHERNET_OVERHEAD,
            effective_pmtu: DEFAULT_PMTU,
            max_payload: DEFAULT_PMTU - UDP_OVERHEAD,
            highest_good: 0,
            lowest_bad: 0,
            candidate: 0,
            tests_sent: 0,
        }
    }

    /// Bytes added when an overlay IP packet becomes an underlay one.
    #[must_use]
    pub const fn overhead(&self) -> usize {
        self.overhead
    }

    /// Current effective PMTU.
    #[must_use]
    pub const fn effective_pmtu(&self) -> usize {
        self.effective_pmtu
    }

    /// Largest UDP payload for the don't-fragment path.
    #[must_use]
    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// The candidate being probed, if a search is running.
    #[must_use]
    pub const fn candidate(&self) -> Option<usize> {
        if self.candidate == 0 {
            None
        } else {
            Some(self.candidate)
        }
    }

    /// Handles a send failure that reported an IP-level `pmtu`.
    pub fn on_message_too_big(&mut self, pmtu: usize) -> PmtuAction {
        let epmtu = pmtu.saturating_sub(self.overhead);
        if self.candidate != 0 && epmtu >= self.candidate {
            return PmtuAction::None;
        }
        debug!(pmtu, epmtu, "message too big, starting PMTU search");
        self.highest_good = 8;
        self.lowest_bad = epmtu + 1;
        self.candidate = epmtu;
        self.tests_sent = 0;
        self.max_payload = pmtu.saturating_sub(UDP_OVERHEAD);
        self.effective_pmtu = epmtu;
        self.probe()
    }

    /// Handles an acknowledgement of a probe for `epmtu`.
    pub fn on_probe_ack(&mut self, epmtu: usize) -> PmtuAction {
        if self.candidate == 0 || epmtu != self.candidate {
            return PmtuAction::None;
        }
        self.highest_good = epmtu;
        self.search()
    }

    /// Handles expiry of the probe timer.
    pub fn on_probe_timeout(&mut self) -> PmtuAction {
        if self.candidate == 0 {
            return PmtuAction::None;
        }
        if self.tests_sent < PMTU_VERIFY_ATTEMPTS {
            return self.probe();
        }
        self.lowest_bad = self.candidate;
        self.search()
    }

    fn probe(&mut self) -> PmtuAction {
        let timeout = PMTU_VERIFY_TIMEOUT * (1 << self.tests_sent);
        self.tests_sent += 1;
        PmtuAction::SendProbe {
            epmtu: self.candidate,
            timeout,
        }
    }

    fn search(&mut self) -> PmtuAction {
        if self.highest_good + 1 >= self.lowest_bad {
            let epmtu = self.highest_good;
            info!(epmtu, "effective PMTU verified");
            self.candidate = 0;
            self.max_payload = epmtu + self.overhead - UDP_OVERHEAD;
            self.effective_pmtu = epmtu;
            return PmtuAction::Verified(epmtu);
        }
        self.candidate = (self.highest_good + self.lowest_bad) / 2;
        self.tests_sent = 0;
        self.probe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_crypto::DatagramSealer;

    const SEALED: usize = crate::peer::NAME_SIZE + DatagramSealer::OVERHEAD;

    /// Drives discovery against a path that drops IP packets larger than
    /// `limit`, returning the final state and the number of probes sent.
    fn converge(limit: usize, reported: usize) -> (PmtuDiscovery, usize) {
        let mut pmtu = PmtuDiscovery::new(SEALED);
        let mut action = pmtu.on_message_too_big(reported);
        let mut probes = 0;
        let mut attempts_for_candidate = 0;
        let mut last_candidate = None;
        loop {
            match action {
                PmtuAction::SendProbe { epmtu, .. } => {
                    probes += 1;
                    if last_candidate == Some(epmtu) {
                        attempts_for_candidate += 1;
                    } else {
                        last_candidate = Some(epmtu);
                        attempts_for_candidate = 1;
                    }
                    assert!(attempts_for_candidate <= PMTU_VERIFY_ATTEMPTS as usize);
                    action = if epmtu + pmtu.overhead() <= limit {
                        pmtu.on_probe_ack(epmtu)
                    } else {
                        pmtu.on_probe_timeout()
                    };
                }
                PmtuAction::Verified(_) => return (pmtu, probes),
                PmtuAction::None => panic!("discovery stalled"),
            }
        }
    }

    // ========== Search Tests ==========

    #[test]
    fn overhead_includes_every_layer() {
        assert_eq!(PmtuDiscovery::new(6).overhead(), 28 + 6 + 14 + 14);
        assert_eq!(PmtuDiscovery::new(SEALED).overhead(), 28 + 30 + 14 + 14);
    }

    #[test]
    fn accurate_report_verifies_in_one_probe() {
        let (pmtu, probes) = converge(1400, 1400);
        assert_eq!(probes, 1);
        assert_eq!(pmtu.effective_pmtu() + pmtu.overhead(), 1400);
        assert_eq!(pmtu.max_payload(), 1400 - UDP_OVERHEAD);
    }

    #[test]
    fn converges_to_path_limit_of_1400() {
        let (pmtu, _) = converge(1400, 1500);
        let ip = pmtu.effective_pmtu() + pmtu.overhead();
        assert!((1393..=1400).contains(&ip));
        assert_eq!(pmtu.candidate(), None);
    }

    #[test]
    fn stable_after_convergence() {
        let (mut pmtu, _) = converge(1400, 1500);
        let epmtu = pmtu.effective_pmtu();

        // nothing pending: timers and stray acks change nothing
        assert_eq!(pmtu.on_probe_timeout(), PmtuAction::None);
        assert_eq!(pmtu.on_probe_ack(epmtu), PmtuAction::None);

        // the kernel repeating the true limit re-verifies the same value
        let action = pmtu.on_message_too_big(1400);
        assert_eq!(
            action,
            PmtuAction::SendProbe {
                epmtu,
                timeout: PMTU_VERIFY_TIMEOUT
            }
        );
        assert_eq!(pmtu.on_probe_ack(epmtu), PmtuAction::Verified(epmtu));
    }

    #[test]
    fn probe_timeout_doubles() {
        let mut pmtu = PmtuDiscovery::new(SEALED);
        pmtu.on_message_too_big(1500);
        for attempt in 1..PMTU_VERIFY_ATTEMPTS {
            match pmtu.on_probe_timeout() {
                PmtuAction::SendProbe { timeout, .. } => {
                    assert_eq!(timeout, PMTU_VERIFY_TIMEOUT * (1 << attempt));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        // eighth failure moves the search down
        match pmtu.on_probe_timeout() {
            PmtuAction::SendProbe { epmtu, timeout } => {
                assert!(epmtu < 1500 - pmtu.overhead());
                assert_eq!(timeout, PMTU_VERIFY_TIMEOUT);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn larger_report_during_search_is_ignored() {
        let mut pmtu = PmtuDiscovery::new(SEALED);
        pmtu.on_message_too_big(1400);
        assert_eq!(pmtu.on_message_too_big(1500), PmtuAction::None);
        assert!(matches!(pmtu.on_message_too_big(1300), PmtuAction::SendProbe { .. }));
    }

    #[test]
    fn stale_ack_is_ignored() {
        let mut pmtu = PmtuDiscovery::new(SEALED);
        pmtu.on_message_too_big(1400);
        assert_eq!(pmtu.on_probe_ack(59_986), PmtuAction::None);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn search_finds_exact_limit(limit in 576usize..1500, extra in 0usize..200) {
                let (pmtu, _) = converge(limit, limit + extra);
                prop_assert_eq!(pmtu.effective_pmtu() + pmtu.overhead(), limit);
                prop_assert_eq!(pmtu.candidate(), None);
            }
        }
    }
}
