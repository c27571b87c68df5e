use rand::Rng;

/// Generates a random election timeout, in ticks, within the configured range
pub fn random_election_ticks(min_ticks: u64, max_ticks: u64) -> u64 {
    let max_ticks = max_ticks.max(min_ticks);
    rand::thread_rng().gen_range(min_ticks..=max_ticks)
}
