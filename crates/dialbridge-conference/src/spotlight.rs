//! Bounded spotlight set.
//!
//! Peers are kept in a ranking, most recently active first. The spotlight set
//! is the first `max` entries of that ranking. Mutations return the new set
//! only when its membership changed, and only after [`SpotlightSelector::start`],
//! so the client never pauses or resumes consumers for a no-op.

use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct SpotlightSelector {
    max: usize,
    ranking: Vec<String>,
    current: Vec<String>,
    started: bool,
}

impl SpotlightSelector {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            ranking: Vec::new(),
            current: Vec::new(),
            started: false,
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Append peers in room membership order; known peers keep their rank.
    pub fn add_peers<I, S>(&mut self, peers: I) -> Option<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for peer in peers {
            let peer = peer.into();
            if !self.ranking.contains(&peer) {
                self.ranking.push(peer);
            }
        }
        self.refresh()
    }

    /// Pre-seed the ranking with recent speakers (most recent first).
    pub fn add_speaker_list<I, S>(&mut self, speakers: I) -> Option<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut ranking: Vec<String> = speakers
            .into_iter()
            .map(|p| -> String { p.into() })
            .filter(|p| seen.insert(p.clone()))
            .collect();
        ranking.extend(self.ranking.drain(..).filter(|p| !seen.contains(p)));
        self.ranking = ranking;
        self.refresh()
    }

    /// Promote `peer` to most recently active.
    pub fn handle_active_speaker(&mut self, peer: &str) -> Option<Vec<String>> {
        self.ranking.retain(|p| p != peer);
        self.ranking.insert(0, peer.to_string());
        self.refresh()
    }

    pub fn remove_peer(&mut self, peer: &str) -> Option<Vec<String>> {
        self.ranking.retain(|p| p != peer);
        self.refresh()
    }

    /// Begin emitting updates; returns the initial set.
    pub fn start(&mut self) -> Vec<String> {
        self.started = true;
        self.current = self.top();
        self.current.clone()
    }

    /// Forget everything and stop emitting until the next `start`.
    pub fn clear(&mut self) {
        self.ranking.clear();
        self.current.clear();
        self.started = false;
    }

    pub fn current(&self) -> &[String] {
        &self.current
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.current.iter().any(|p| p == peer)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    fn top(&self) -> Vec<String> {
        self.ranking.iter().take(self.max).cloned().collect()
    }

    fn refresh(&mut self) -> Option<Vec<String>> {
        if !self.started {
            return None;
        }
        let next = self.top();
        let changed = {
            let old: HashSet<&String> = self.current.iter().collect();
            let new: HashSet<&String> = next.iter().collect();
            old != new
        };
        self.current = next;
        changed.then(|| self.current.clone())
    }
}
