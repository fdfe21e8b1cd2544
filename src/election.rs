//! Module that contains the processor side of central manager failover.
//!
//! One processor, the prober, asks every CM whether it is alive and elects
//! the lowest-id CM that acknowledged within one timeout window. CMs holding
//! a current replica are preferred over ones that came back from the dead.

/// Enum that represents where a processor stands in an election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElectionPhase {
    #[default]
    Normal,
    /// Waiting for a new primary to be announced.
    InElection,
}

/// Struct that collects acknowledgements during one probing window.
#[derive(Debug, Clone, Default)]
pub struct ElectionRound {
    pub phase: ElectionPhase,
    /// Bumped on every probe, so that a stale window expiry is ignored.
    pub round: u64,
    /// True while a probe window is open.
    pub probing: bool,
    /// CMs that answered the open window, with whether they are synced.
    acknowledgements: Vec<(usize, bool)>,
}

/// Function that tells if `processor` is the one that probes the CMs.
///
/// The highest processor id probes, which gives exactly one prober per round.
pub fn is_prober(processor: usize, processors: usize) -> bool {
    processor + 1 == processors
}

impl ElectionRound {
    pub fn in_election(&self) -> bool {
        self.phase == ElectionPhase::InElection
    }

    /// Function that enters the election. Returns `false` if already in one.
    pub fn enter(&mut self) -> bool {
        if self.in_election() {
            return false;
        }
        self.phase = ElectionPhase::InElection;
        self.acknowledgements.clear();
        true
    }

    /// Function that opens a probing window and returns its round number.
    pub fn open_probe(&mut self) -> u64 {
        self.round += 1;
        self.probing = true;
        self.acknowledgements.clear();
        self.round
    }

    pub fn acknowledge(&mut self, central_manager: usize, synced: bool) {
        if self.probing && !self.acknowledgements.iter().any(|(id, _)| *id == central_manager) {
            self.acknowledgements.push((central_manager, synced));
        }
    }

    /// Function that closes the window of `round` and returns the CM to elect.
    ///
    /// The lowest synced CM wins; an unsynced one only when nobody else answered.
    /// `None` means the window was stale, or that no CM answered.
    pub fn close_probe(&mut self, round: u64) -> Option<usize> {
        if !self.probing || round != self.round {
            return None;
        }
        self.probing = false;
        let synced = self
            .acknowledgements
            .iter()
            .filter(|(_, synced)| *synced)
            .map(|(id, _)| *id)
            .min();
        synced.or_else(|| self.acknowledgements.iter().map(|(id, _)| *id).min())
    }

    /// Function that leaves the election once a primary is announced.
    pub fn finish(&mut self) {
        self.phase = ElectionPhase::Normal;
        self.probing = false;
        self.acknowledgements.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_processor_probes() {
        assert!(is_prober(9, 10));
        assert!(!is_prober(0, 10));
        assert!(is_prober(0, 1));
    }

    #[test]
    fn lowest_acknowledging_cm_wins() {
        let mut election = ElectionRound::default();
        assert!(election.enter());
        assert!(!election.enter());

        let round = election.open_probe();
        election.acknowledge(3, true);
        election.acknowledge(1, true);
        election.acknowledge(2, true);
        assert_eq!(election.close_probe(round), Some(1));
        assert!(election.in_election());

        election.finish();
        assert!(!election.in_election());
    }

    #[test]
    fn stale_or_silent_windows_elect_nobody() {
        let mut election = ElectionRound::default();
        election.enter();
        let first = election.open_probe();
        let second = election.open_probe();
        election.acknowledge(0, true);
        assert_eq!(election.close_probe(first), None);
        assert_eq!(election.close_probe(second), Some(0));

        let third = election.open_probe();
        assert_eq!(election.close_probe(third), None);
    }

    #[test]
    fn acknowledgements_outside_a_window_are_ignored() {
        let mut election = ElectionRound::default();
        election.acknowledge(0, true);
        let round = election.open_probe();
        assert_eq!(election.close_probe(round), None);
    }

    #[test]
    fn synced_cms_win_over_resurrected_ones() {
        let mut election = ElectionRound::default();
        election.enter();
        let round = election.open_probe();
        election.acknowledge(0, false);
        election.acknowledge(2, true);
        assert_eq!(election.close_probe(round), Some(2));

        let round = election.open_probe();
        election.acknowledge(1, false);
        election.acknowledge(0, false);
        assert_eq!(election.close_probe(round), Some(0));
    }
}
