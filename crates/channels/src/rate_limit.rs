//! Dispatch pacing for outbound agent commands.
//!
//! Two independent constraints apply to every dispatch:
//! - a global gap since the previous dispatch to *any* agent, drawn
//!   uniformly from `[min_delay, max_delay]` after each dispatch
//! - a fixed per-agent cooldown since the previous dispatch to that agent
//!
//! The pacer only does bookkeeping; the command queue owns the waiting.
use farmhand_core::QueueConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

pub struct DispatchPacer {
    min_gap: Duration,
    max_gap: Duration,
    cooldown: Duration,
    /// Last dispatch to any agent.
    last_dispatch: Option<Instant>,
    /// Gap the next dispatch has to respect, drawn when the last one happened.
    required_gap: Duration,
    last_by_agent: HashMap<String, Instant>,
    rng: StdRng,
}

impl DispatchPacer {
    pub fn new(config: &QueueConfig) -> Self {
        let (min_gap, max_gap) = config.delay_window();
        Self {
            min_gap,
            max_gap,
            cooldown: config.agent_cooldown(),
            last_dispatch: None,
            required_gap: Duration::ZERO,
            last_by_agent: HashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Remaining cooldown for `agent_id`, or `None` when it may receive a command.
    pub fn cooldown_remaining(&self, agent_id: &str, now: Instant) -> Option<Duration> {
        let last = self.last_by_agent.get(agent_id)?;
        let ready_at = *last + self.cooldown;
        (ready_at > now).then(|| ready_at - now)
    }

    /// Time left before the global gap since the last dispatch is satisfied.
    pub fn global_wait(&self, now: Instant) -> Duration {
        match self.last_dispatch {
            Some(last) => (last + self.required_gap).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Records a dispatch to `agent_id` and draws the next global gap.
    pub fn record_dispatch(&mut self, agent_id: &str, now: Instant) {
        self.last_dispatch = Some(now);
        self.required_gap = self.draw_gap();
        self.last_by_agent.insert(agent_id.to_string(), now);

        let cooldown = self.cooldown;
        self.last_by_agent
            .retain(|_, last| now.saturating_duration_since(*last) < cooldown);
    }

    /// Agents still cooling down, with the time left for each.
    pub fn cooldowns(&self, now: Instant) -> Vec<(String, Duration)> {
        let mut out: Vec<(String, Duration)> = self
            .last_by_agent
            .keys()
            .filter_map(|id| self.cooldown_remaining(id, now).map(|d| (id.clone(), d)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn draw_gap(&mut self) -> Duration {
        let lo = self.min_gap.as_millis() as u64;
        let hi = self.max_gap.as_millis() as u64;
        if lo >= hi {
            return self.min_gap;
        }
        Duration::from_millis(self.rng.gen_range(lo..=hi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(min_ms: u64, max_ms: u64, cooldown_ms: u64) -> QueueConfig {
        QueueConfig {
            min_delay_ms: min_ms,
            max_delay_ms: max_ms,
            agent_cooldown_ms: cooldown_ms,
            ..QueueConfig::default()
        }
    }

    #[test]
    fn test_fresh_pacer_is_open() {
        let pacer = DispatchPacer::new(&config(5_000, 15_000, 30_000));
        let now = Instant::now();
        assert_eq!(pacer.global_wait(now), Duration::ZERO);
        assert!(pacer.cooldown_remaining("alice", now).is_none());
    }

    #[test]
    fn test_gap_drawn_within_window() {
        let mut pacer = DispatchPacer::new(&config(5_000, 15_000, 30_000)).with_seed(7);
        let now = Instant::now();
        for _ in 0..50 {
            pacer.record_dispatch("alice", now);
            let wait = pacer.global_wait(now);
            assert!(wait >= Duration::from_secs(5));
            assert!(wait <= Duration::from_secs(15));
        }
    }

    #[test]
    fn test_cooldown_is_per_agent() {
        let mut pacer = DispatchPacer::new(&config(1_000, 1_000, 30_000));
        let now = Instant::now();
        pacer.record_dispatch("alice", now);

        assert_eq!(
            pacer.cooldown_remaining("alice", now + Duration::from_secs(10)),
            Some(Duration::from_secs(20))
        );
        assert!(pacer.cooldown_remaining("bob", now).is_none());
        assert!(pacer
            .cooldown_remaining("alice", now + Duration::from_secs(30))
            .is_none());
        assert_eq!(
            pacer.global_wait(now + Duration::from_millis(400)),
            Duration::from_millis(600)
        );
    }

    #[test]
    fn test_expired_cooldowns_are_pruned() {
        let mut pacer = DispatchPacer::new(&config(0, 0, 10_000));
        let start = Instant::now();
        pacer.record_dispatch("alice", start);
        pacer.record_dispatch("bob", start + Duration::from_secs(11));

        let cooling = pacer.cooldowns(start + Duration::from_secs(11));
        assert_eq!(cooling, vec![("bob".to_string(), Duration::from_secs(10))]);
    }
}
