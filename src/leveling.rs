// XP → level curve
//
// Level L costs floor(100 × L^1.5) XP on top of level L-1. Level 1 is free,
// so the cumulative requirement sums from level 2 upward. Stored balances
// from earlier deployments depend on these exact boundaries, so the level is
// always found by accumulating the same floored per-level costs, never by
// inverting the curve.

use spacetimedb::SpacetimeType;
use thiserror::Error;

/// Hard ceiling for the accumulation loop (≈ 1.2 × 10^14 cumulative XP)
const MAX_LEVEL: u32 = 100_000;

/// XP needed to advance from `level - 1` into `level`
pub fn xp_required_for_level(level: u32) -> u64 {
    (100.0 * (level as f64).powf(1.5)).floor() as u64
}

/// Total XP at which `level` is reached (0 for level 1)
pub fn cumulative_xp_for_level(level: u32) -> u64 {
    (2..=level.min(MAX_LEVEL))
        .map(xp_required_for_level)
        .fold(0u64, |acc, xp| acc.saturating_add(xp))
}

/// Highest level whose cumulative requirement does not exceed `total_xp`
pub fn level_for_total_xp(total_xp: u64) -> u32 {
    let mut level = 1;
    let mut cumulative = 0u64;
    while level < MAX_LEVEL {
        let next = cumulative.saturating_add(xp_required_for_level(level + 1));
        if next > total_xp {
            break;
        }
        cumulative = next;
        level += 1;
    }
    level
}

/// Level progress as shown on the champion card
#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub struct LevelInfo {
    pub level: u32,
    pub xp_into_current_level: u64,
    pub xp_needed_for_next_level: u64,
    /// Clamped to 0..=100 for progress bars
    pub progress_percent: f64,
}

pub fn level_info(total_xp: u64) -> LevelInfo {
    let level = level_for_total_xp(total_xp);
    let xp_into_current_level = total_xp.saturating_sub(cumulative_xp_for_level(level));
    let xp_needed_for_next_level = xp_required_for_level(level + 1);

    let progress_percent = if xp_needed_for_next_level == 0 {
        0.0
    } else {
        (100.0 * xp_into_current_level as f64 / xp_needed_for_next_level as f64).clamp(0.0, 100.0)
    };

    LevelInfo {
        level,
        xp_into_current_level,
        xp_needed_for_next_level,
        progress_percent,
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum XpError {
    #[error("balance of {balance} XP cannot cover a debit of {debit} XP")]
    Insufficient { balance: u64, debit: u64 },
    #[error("XP balance overflow")]
    Overflow,
}

/// Apply a signed change to a balance. Balances never go negative.
pub fn apply_xp_delta(balance: u64, delta: i64) -> Result<u64, XpError> {
    if delta >= 0 {
        balance.checked_add(delta as u64).ok_or(XpError::Overflow)
    } else {
        let debit = delta.unsigned_abs();
        balance
            .checked_sub(debit)
            .ok_or(XpError::Insufficient { balance, debit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xp_required_for_level() {
        assert_eq!(xp_required_for_level(1), 100);
        assert_eq!(xp_required_for_level(2), 282);
        assert_eq!(xp_required_for_level(3), 519);
        assert_eq!(xp_required_for_level(4), 800);
        assert_eq!(xp_required_for_level(9), 2700);
        assert_eq!(xp_required_for_level(16), 6400);
    }

    #[test]
    fn test_level_one_is_free() {
        assert_eq!(cumulative_xp_for_level(1), 0);
        assert_eq!(level_for_total_xp(0), 1);
        for xp in [1, 100, 200, 281] {
            assert_eq!(level_for_total_xp(xp), 1, "xp {}", xp);
        }
        assert_eq!(level_for_total_xp(282), 2);
    }

    #[test]
    fn test_boundaries_are_exact() {
        for level in 2..=40 {
            let at = cumulative_xp_for_level(level);
            assert_eq!(level_for_total_xp(at), level, "at boundary of level {}", level);
            assert_eq!(level_for_total_xp(at - 1), level - 1, "just below level {}", level);
        }
    }

    #[test]
    fn test_level_is_monotonic() {
        let mut previous = 1;
        for xp in (0..60_000u64).step_by(37) {
            let level = level_for_total_xp(xp);
            assert!(level >= previous, "level dropped at xp {}", xp);
            previous = level;
        }
    }

    #[test]
    fn test_cumulative_matches_running_sum() {
        // 282 + 519 + 800 = 1601
        assert_eq!(cumulative_xp_for_level(3), 801);
        assert_eq!(cumulative_xp_for_level(4), 1601);
    }

    #[test]
    fn test_level_info() {
        let info = level_info(400);
        assert_eq!(info.level, 2);
        assert_eq!(info.xp_into_current_level, 118);
        assert_eq!(info.xp_needed_for_next_level, 519);
        assert!((info.progress_percent - 100.0 * 118.0 / 519.0).abs() < 1e-9);

        let fresh = level_info(0);
        assert_eq!(fresh.level, 1);
        assert_eq!(fresh.xp_into_current_level, 0);
        assert_eq!(fresh.xp_needed_for_next_level, 282);
        assert_eq!(fresh.progress_percent, 0.0);
    }

    #[test]
    fn test_progress_stays_in_bar_range() {
        for xp in (0..20_000u64).step_by(113) {
            let info = level_info(xp);
            assert!((0.0..=100.0).contains(&info.progress_percent));
            assert!(info.xp_into_current_level < info.xp_needed_for_next_level);
        }
    }

    #[test]
    fn test_apply_xp_delta() {
        assert_eq!(apply_xp_delta(400, -100), Ok(300));
        assert_eq!(apply_xp_delta(400, 20), Ok(420));
        assert_eq!(apply_xp_delta(100, -100), Ok(0));
        assert_eq!(
            apply_xp_delta(99, -100),
            Err(XpError::Insufficient { balance: 99, debit: 100 })
        );
        assert_eq!(apply_xp_delta(u64::MAX, 1), Err(XpError::Overflow));
    }
}
