// Challenge wager bounds

use spacetimedb::SpacetimeType;

/// Floor for any minimum stake
pub const MIN_STAKE_FLOOR: u64 = 50;

/// Minimum stake grows with level
pub const MIN_STAKE_PER_LEVEL: u64 = 25;

/// Nobody can wager more than this in one challenge
pub const MAX_STAKE_CAP: u64 = 500;

pub fn minimum_stake(level: u32) -> u64 {
    MIN_STAKE_FLOOR.max(level as u64 * MIN_STAKE_PER_LEVEL)
}

/// A quarter of the balance (floored), capped
pub fn maximum_stake(total_xp: u64) -> u64 {
    (total_xp / 4).min(MAX_STAKE_CAP)
}

/// Up to four distinct, ascending wager suggestions.
/// Empty when the balance can't cover the level's minimum stake.
pub fn recommended_stakes(level: u32, total_xp: u64) -> Vec<u64> {
    let min = minimum_stake(level);
    let max = maximum_stake(total_xp);
    if max < min {
        return Vec::new();
    }

    let step = (max - min) / 3;
    let mut stakes = vec![min, min + step, min + 2 * step, max];
    stakes.sort_unstable();
    stakes.dedup();
    stakes
}

pub fn can_afford_stake(total_xp: u64, stake: u64) -> bool {
    stake > 0 && total_xp >= stake
}

/// Stake picker payload for the challenge screen
#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub struct StakeOptions {
    pub minimum: u64,
    pub maximum: u64,
    pub recommended: Vec<u64>,
}

pub fn stake_options(level: u32, total_xp: u64) -> StakeOptions {
    StakeOptions {
        minimum: minimum_stake(level),
        maximum: maximum_stake(total_xp),
        recommended: recommended_stakes(level, total_xp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stake_bounds() {
        assert_eq!(minimum_stake(1), 50);
        assert_eq!(minimum_stake(2), 50);
        assert_eq!(minimum_stake(5), 125);
        assert_eq!(maximum_stake(1000), 250);
        assert_eq!(maximum_stake(10_000), 500);
        assert_eq!(maximum_stake(3), 0);
        assert_eq!(maximum_stake(1999), 499);
    }

    #[test]
    fn test_can_afford_stake() {
        assert!(can_afford_stake(100, 100));
        assert!(can_afford_stake(100, 1));
        assert!(!can_afford_stake(100, 101));
        assert!(!can_afford_stake(100, 0));
        assert!(!can_afford_stake(0, 0));
    }

    #[test]
    fn test_recommended_stakes_spread() {
        // min 100, max 500, step 133
        assert_eq!(recommended_stakes(4, 2000), vec![100, 233, 366, 500]);
    }

    #[test]
    fn test_recommended_stakes_collapse() {
        // min 50, max 50 → every slot is 50
        assert_eq!(recommended_stakes(1, 200), vec![50]);
        // min 50, max 52 → step 0
        assert_eq!(recommended_stakes(1, 208), vec![50, 52]);
    }

    #[test]
    fn test_recommended_stakes_empty_when_broke() {
        assert!(recommended_stakes(1, 100).is_empty());
        assert!(recommended_stakes(10, 900).is_empty());
        let options = stake_options(10, 900);
        assert_eq!(options.minimum, 250);
        assert_eq!(options.maximum, 225);
        assert!(options.recommended.is_empty());
    }

    #[test]
    fn test_recommended_stakes_are_strictly_ascending() {
        for level in 1..30 {
            for xp in (0..4000u64).step_by(97) {
                let stakes = recommended_stakes(level, xp);
                assert!(stakes.len() <= 4);
                assert!(stakes.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }
}
