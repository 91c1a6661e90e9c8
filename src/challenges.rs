// Challenge lifecycle
//
// One authoritative `Challenge` row per challenge. Transitions here are pure:
// they mutate the row in memory and return the XP movements the caller must
// apply. The reducers in lib.rs persist both inside the same transaction, so a
// failed transfer rolls the status change back with it.
//
//   Pending ──accept──▶ Active ──resolve──▶ InitiatorWon | OpponentWon | Tied
//      │
//      └──reject/cancel──▶ Rejected
//
// AI challenges skip Pending. Stakes are escrowed (debited) when a challenge
// becomes Active and paid out once at resolution.

use spacetimedb::{SpacetimeType, Timestamp};
use thiserror::Error;

use crate::calendar::MICROS_PER_DAY;
use crate::stakes::can_afford_stake;
use crate::Challenge;

/// Reserved opponent id for challenges against the AI Sage
pub const AI_OPPONENT_ID: &str = "AI";

/// Allowed challenge lengths in days
pub const CHALLENGE_DURATIONS: [u32; 4] = [7, 14, 21, 30];

/// Per-tick random swing applied to the AI completion rate (percentage points)
pub const AI_JITTER_PCT: i32 = 10;

pub const REASON_STAKE: &str = "challenge_stake";
pub const REASON_PAYOUT: &str = "challenge_payout";
pub const REASON_REFUND: &str = "challenge_refund";

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq)]
pub enum ChallengeStatus {
    Pending,
    Active,
    InitiatorWon,
    OpponentWon,
    Tied,
    Rejected,
}

impl ChallengeStatus {
    /// Pending or Active
    pub fn is_open(&self) -> bool {
        matches!(self, ChallengeStatus::Pending | ChallengeStatus::Active)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChallengeStatus::Pending => "pending",
            ChallengeStatus::Active => "active",
            ChallengeStatus::InitiatorWon => "initiator_won",
            ChallengeStatus::OpponentWon => "opponent_won",
            ChallengeStatus::Tied => "tied",
            ChallengeStatus::Rejected => "rejected",
        }
    }
}

/// AI opponent tiers. The AI completes a day with this base probability.
#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq)]
pub enum AiDifficulty {
    Easy,
    Medium,
    Hard,
    Expert,
}

impl AiDifficulty {
    pub fn completion_rate_pct(&self) -> i32 {
        match self {
            AiDifficulty::Easy => 60,
            AiDifficulty::Medium => 75,
            AiDifficulty::Hard => 85,
            AiDifficulty::Expert => 95,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AiDifficulty::Easy => "easy",
            AiDifficulty::Medium => "medium",
            AiDifficulty::Hard => "hard",
            AiDifficulty::Expert => "expert",
        }
    }
}

/// A challenge as one participant sees it
#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq)]
pub enum ChallengeOutcome {
    Pending,
    Active,
    Victory,
    Defeated,
    Tied,
    Rejected,
}

#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub struct ChallengeProjection {
    pub challenge_id: u64,
    /// The other side (user id or "AI")
    pub opponent_id: String,
    pub is_initiator: bool,
    pub my_habit_id: Option<u64>,
    pub duration_days: u32,
    pub stake: u64,
    pub outcome: ChallengeOutcome,
    pub my_progress: u32,
    pub opponent_progress: u32,
    pub started_at: Option<Timestamp>,
    pub ends_at: Option<Timestamp>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ChallengeError {
    #[error("stake must be greater than zero")]
    ZeroStake,
    #[error("insufficient XP for stake: {user} has {balance}, needs {stake}")]
    InsufficientXp { user: String, balance: u64, stake: u64 },
    #[error("invalid duration {0} days (allowed: 7, 14, 21, 30)")]
    InvalidDuration(u32),
    #[error("cannot challenge yourself")]
    SelfChallenge,
    #[error("challenge is {actual}, expected {expected}")]
    WrongStatus { actual: &'static str, expected: &'static str },
    #[error("only the challenged player can respond to this challenge")]
    NotOpponent,
    #[error("only the initiator can cancel this challenge")]
    NotInitiator,
    #[error("AI challenges cannot be accepted or rejected")]
    AiChallenge,
    #[error("challenge is not due for resolution yet")]
    NotDue,
    #[error("AI opponent still owes {0} daily rolls")]
    AiTicksOwed(u32),
}

/// Signed XP movement produced by a transition
#[derive(Debug, Clone, PartialEq)]
pub struct XpTransfer {
    pub user_id: String,
    pub delta: i64,
    pub reason: &'static str,
}

impl XpTransfer {
    fn debit(user_id: &str, amount: u64, reason: &'static str) -> Self {
        XpTransfer { user_id: user_id.to_string(), delta: -(amount as i64), reason }
    }

    fn credit(user_id: &str, amount: u64, reason: &'static str) -> Self {
        XpTransfer { user_id: user_id.to_string(), delta: amount as i64, reason }
    }
}

pub fn is_ai_opponent(opponent_id: &str) -> bool {
    opponent_id == AI_OPPONENT_ID
}

pub fn validate_duration(duration_days: u32) -> Result<(), ChallengeError> {
    if CHALLENGE_DURATIONS.contains(&duration_days) {
        Ok(())
    } else {
        Err(ChallengeError::InvalidDuration(duration_days))
    }
}

pub fn validate_stake(user: &str, balance: u64, stake: u64) -> Result<(), ChallengeError> {
    if stake == 0 {
        return Err(ChallengeError::ZeroStake);
    }
    if !can_afford_stake(balance, stake) {
        return Err(ChallengeError::InsufficientXp {
            user: user.to_string(),
            balance,
            stake,
        });
    }
    Ok(())
}

fn require_status(challenge: &Challenge, expected: ChallengeStatus) -> Result<(), ChallengeError> {
    if challenge.status != expected {
        return Err(ChallengeError::WrongStatus {
            actual: challenge.status.label(),
            expected: expected.label(),
        });
    }
    Ok(())
}

fn window_end(start: Timestamp, duration_days: u32) -> Timestamp {
    Timestamp::from_micros_since_unix_epoch(
        start.to_micros_since_unix_epoch() + duration_days as i64 * MICROS_PER_DAY,
    )
}

fn blank(
    initiator_id: &str,
    opponent_id: &str,
    habit_id: u64,
    duration_days: u32,
    stake: u64,
    now: Timestamp,
) -> Challenge {
    Challenge {
        id: 0,
        initiator_id: initiator_id.to_string(),
        opponent_id: opponent_id.to_string(),
        ai_difficulty: None,
        initiator_habit_id: habit_id,
        opponent_habit_id: None,
        duration_days,
        stake,
        status: ChallengeStatus::Pending,
        initiator_progress: 0,
        opponent_progress: 0,
        created_at: now,
        started_at: None,
        ends_at: None,
        resolved_at: None,
        ai_ticks_applied: 0,
    }
}

/// Player-vs-player challenge, created Pending. Nothing is escrowed yet.
pub fn open_pvp(
    initiator_id: &str,
    initiator_xp: u64,
    opponent_id: &str,
    habit_id: u64,
    duration_days: u32,
    stake: u64,
    now: Timestamp,
) -> Result<Challenge, ChallengeError> {
    if initiator_id == opponent_id {
        return Err(ChallengeError::SelfChallenge);
    }
    validate_duration(duration_days)?;
    validate_stake(initiator_id, initiator_xp, stake)?;
    Ok(blank(initiator_id, opponent_id, habit_id, duration_days, stake, now))
}

/// Challenge against the AI, Active immediately with the initiator's stake escrowed
pub fn open_vs_ai(
    initiator_id: &str,
    initiator_xp: u64,
    habit_id: u64,
    difficulty: AiDifficulty,
    duration_days: u32,
    stake: u64,
    now: Timestamp,
) -> Result<(Challenge, Vec<XpTransfer>), ChallengeError> {
    validate_duration(duration_days)?;
    validate_stake(initiator_id, initiator_xp, stake)?;

    let mut challenge = blank(initiator_id, AI_OPPONENT_ID, habit_id, duration_days, stake, now);
    challenge.ai_difficulty = Some(difficulty);
    challenge.status = ChallengeStatus::Active;
    challenge.started_at = Some(now);
    challenge.ends_at = Some(window_end(now, duration_days));

    let escrow = vec![XpTransfer::debit(initiator_id, stake, REASON_STAKE)];
    Ok((challenge, escrow))
}

/// Opponent accepts: both stakes are escrowed and the window starts now.
/// Either side being unable to cover the stake leaves the challenge Pending.
pub fn accept(
    challenge: &mut Challenge,
    by: &str,
    habit_id: u64,
    opponent_xp: u64,
    initiator_xp: u64,
    now: Timestamp,
) -> Result<Vec<XpTransfer>, ChallengeError> {
    if challenge.ai_difficulty.is_some() {
        return Err(ChallengeError::AiChallenge);
    }
    if challenge.opponent_id != by {
        return Err(ChallengeError::NotOpponent);
    }
    require_status(challenge, ChallengeStatus::Pending)?;
    validate_stake(&challenge.opponent_id, opponent_xp, challenge.stake)?;
    validate_stake(&challenge.initiator_id, initiator_xp, challenge.stake)?;

    challenge.status = ChallengeStatus::Active;
    challenge.opponent_habit_id = Some(habit_id);
    challenge.started_at = Some(now);
    challenge.ends_at = Some(window_end(now, challenge.duration_days));

    Ok(vec![
        XpTransfer::debit(&challenge.initiator_id, challenge.stake, REASON_STAKE),
        XpTransfer::debit(&challenge.opponent_id, challenge.stake, REASON_STAKE),
    ])
}

pub fn reject(challenge: &mut Challenge, by: &str) -> Result<(), ChallengeError> {
    if challenge.ai_difficulty.is_some() {
        return Err(ChallengeError::AiChallenge);
    }
    if challenge.opponent_id != by {
        return Err(ChallengeError::NotOpponent);
    }
    require_status(challenge, ChallengeStatus::Pending)?;
    challenge.status = ChallengeStatus::Rejected;
    Ok(())
}

/// Initiator withdraws a challenge nobody has answered yet
pub fn cancel(challenge: &mut Challenge, by: &str) -> Result<(), ChallengeError> {
    if challenge.initiator_id != by {
        return Err(ChallengeError::NotInitiator);
    }
    require_status(challenge, ChallengeStatus::Pending)?;
    challenge.status = ChallengeStatus::Rejected;
    Ok(())
}

pub fn in_window(challenge: &Challenge, now: Timestamp) -> bool {
    match (challenge.started_at, challenge.ends_at) {
        (Some(start), Some(end)) => {
            let now = now.to_micros_since_unix_epoch();
            challenge.status == ChallengeStatus::Active
                && now >= start.to_micros_since_unix_epoch()
                && now < end.to_micros_since_unix_epoch()
        }
        _ => false,
    }
}

/// One qualifying completion by `user_id` using `habit_id`.
/// Returns true when a counter moved. Never resolves the challenge.
pub fn record_progress(challenge: &mut Challenge, user_id: &str, habit_id: u64, now: Timestamp) -> bool {
    if !in_window(challenge, now) {
        return false;
    }
    let limit = challenge.duration_days;
    if challenge.initiator_id == user_id && challenge.initiator_habit_id == habit_id {
        if challenge.initiator_progress < limit {
            challenge.initiator_progress += 1;
            return true;
        }
    } else if challenge.opponent_id == user_id && challenge.opponent_habit_id == Some(habit_id) {
        if challenge.opponent_progress < limit {
            challenge.opponent_progress += 1;
            return true;
        }
    }
    false
}

/// The window closed, or one side already hit the maximum score
pub fn resolution_due(challenge: &Challenge, now: Timestamp) -> bool {
    if challenge.status != ChallengeStatus::Active {
        return false;
    }
    let window_over = challenge
        .ends_at
        .map(|end| now.to_micros_since_unix_epoch() >= end.to_micros_since_unix_epoch())
        .unwrap_or(false);
    window_over
        || challenge.initiator_progress >= challenge.duration_days
        || challenge.opponent_progress >= challenge.duration_days
}

/// Settle an Active challenge. The strictly higher score takes 2 × stake;
/// on a tie every human side gets its own stake back.
pub fn resolve(challenge: &mut Challenge, now: Timestamp) -> Result<Vec<XpTransfer>, ChallengeError> {
    require_status(challenge, ChallengeStatus::Active)?;
    if !resolution_due(challenge, now) {
        return Err(ChallengeError::NotDue);
    }
    let owed = ai_ticks_due(challenge, now);
    if owed > 0 {
        return Err(ChallengeError::AiTicksOwed(owed));
    }

    let stake = challenge.stake;
    let versus_ai = is_ai_opponent(&challenge.opponent_id);
    let mut payouts = Vec::new();

    if challenge.initiator_progress > challenge.opponent_progress {
        challenge.status = ChallengeStatus::InitiatorWon;
        payouts.push(XpTransfer::credit(&challenge.initiator_id, stake * 2, REASON_PAYOUT));
    } else if challenge.opponent_progress > challenge.initiator_progress {
        challenge.status = ChallengeStatus::OpponentWon;
        if !versus_ai {
            payouts.push(XpTransfer::credit(&challenge.opponent_id, stake * 2, REASON_PAYOUT));
        }
    } else {
        challenge.status = ChallengeStatus::Tied;
        payouts.push(XpTransfer::credit(&challenge.initiator_id, stake, REASON_REFUND));
        if !versus_ai {
            payouts.push(XpTransfer::credit(&challenge.opponent_id, stake, REASON_REFUND));
        }
    }

    challenge.resolved_at = Some(now);
    Ok(payouts)
}

/// AI progress ticks owed: one per whole day elapsed in the window
pub fn ai_ticks_due(challenge: &Challenge, now: Timestamp) -> u32 {
    if challenge.ai_difficulty.is_none() || challenge.status != ChallengeStatus::Active {
        return 0;
    }
    let Some(start) = challenge.started_at else {
        return 0;
    };
    let elapsed = now.to_micros_since_unix_epoch() - start.to_micros_since_unix_epoch();
    if elapsed <= 0 {
        return 0;
    }
    let days = ((elapsed / MICROS_PER_DAY) as u32).min(challenge.duration_days);
    days.saturating_sub(challenge.ai_ticks_applied)
}

/// Does the AI complete this tick? `jitter_pct` in ±AI_JITTER_PCT, `roll_pct` in 0..100.
pub fn ai_tick_hits(difficulty: AiDifficulty, jitter_pct: i32, roll_pct: u32) -> bool {
    let jitter = jitter_pct.clamp(-AI_JITTER_PCT, AI_JITTER_PCT);
    let chance = (difficulty.completion_rate_pct() + jitter).clamp(0, 100);
    (roll_pct as i32) < chance
}

pub fn apply_ai_tick(challenge: &mut Challenge, hit: bool) {
    challenge.ai_ticks_applied += 1;
    if hit && challenge.opponent_progress < challenge.duration_days {
        challenge.opponent_progress += 1;
    }
}

/// Roll every AI tick owed at `now`. `roll` yields (jitter_pct, roll_pct).
pub fn catch_up_ai_ticks(challenge: &mut Challenge, now: Timestamp, mut roll: impl FnMut() -> (i32, u32)) -> u32 {
    let Some(difficulty) = challenge.ai_difficulty else {
        return 0;
    };
    let owed = ai_ticks_due(challenge, now);
    for _ in 0..owed {
        let (jitter_pct, roll_pct) = roll();
        apply_ai_tick(challenge, ai_tick_hits(difficulty, jitter_pct, roll_pct));
    }
    owed
}

/// Per-participant read model. None when `viewer` isn't part of the challenge.
pub fn project(challenge: &Challenge, viewer: &str) -> Option<ChallengeProjection> {
    let is_initiator = if challenge.initiator_id == viewer {
        true
    } else if challenge.opponent_id == viewer {
        false
    } else {
        return None;
    };

    let outcome = match challenge.status {
        ChallengeStatus::Pending => ChallengeOutcome::Pending,
        ChallengeStatus::Active => ChallengeOutcome::Active,
        ChallengeStatus::Tied => ChallengeOutcome::Tied,
        ChallengeStatus::Rejected => ChallengeOutcome::Rejected,
        ChallengeStatus::InitiatorWon if is_initiator => ChallengeOutcome::Victory,
        ChallengeStatus::OpponentWon if !is_initiator => ChallengeOutcome::Victory,
        ChallengeStatus::InitiatorWon | ChallengeStatus::OpponentWon => ChallengeOutcome::Defeated,
    };

    let (other, my_habit_id, mine, theirs) = if is_initiator {
        (
            &challenge.opponent_id,
            Some(challenge.initiator_habit_id),
            challenge.initiator_progress,
            challenge.opponent_progress,
        )
    } else {
        (
            &challenge.initiator_id,
            challenge.opponent_habit_id,
            challenge.opponent_progress,
            challenge.initiator_progress,
        )
    };

    Some(ChallengeProjection {
        challenge_id: challenge.id,
        opponent_id: other.clone(),
        is_initiator,
        my_habit_id,
        duration_days: challenge.duration_days,
        stake: challenge.stake,
        outcome,
        my_progress: mine,
        opponent_progress: theirs,
        started_at: challenge.started_at,
        ends_at: challenge.ends_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const DAY: i64 = MICROS_PER_DAY;

    fn at(micros: i64) -> Timestamp {
        Timestamp::from_micros_since_unix_epoch(micros)
    }

    fn t0() -> Timestamp {
        at(1_700_000_000 * 1_000_000)
    }

    fn after_days(days: i64) -> Timestamp {
        at(t0().to_micros_since_unix_epoch() + days * DAY)
    }

    /// In-memory balances standing in for the user_account table
    struct Ledger(HashMap<String, u64>);

    impl Ledger {
        fn new(entries: &[(&str, u64)]) -> Self {
            Ledger(entries.iter().map(|(k, v)| (k.to_string(), *v)).collect())
        }

        fn xp(&self, user: &str) -> u64 {
            self.0.get(user).copied().unwrap_or(0)
        }

        fn apply(&mut self, transfers: &[XpTransfer]) {
            for t in transfers {
                let balance = self.0.entry(t.user_id.clone()).or_insert(0);
                *balance = (*balance as i64 + t.delta) as u64;
            }
        }

        fn total(&self) -> u64 {
            self.0.values().sum()
        }
    }

    fn progress(challenge: &mut Challenge, user: &str, habit: u64, times: u32, day: i64) {
        for _ in 0..times {
            record_progress(challenge, user, habit, after_days(day));
        }
    }

    #[test]
    fn test_create_validates_before_anything_else() {
        assert_eq!(
            open_pvp("alice", 400, "alice", 1, 14, 100, t0()).unwrap_err(),
            ChallengeError::SelfChallenge
        );
        assert_eq!(
            open_pvp("alice", 400, "bob", 1, 10, 100, t0()).unwrap_err(),
            ChallengeError::InvalidDuration(10)
        );
        assert_eq!(
            open_pvp("alice", 400, "bob", 1, 14, 0, t0()).unwrap_err(),
            ChallengeError::ZeroStake
        );
        assert!(matches!(
            open_pvp("alice", 99, "bob", 1, 14, 100, t0()),
            Err(ChallengeError::InsufficientXp { balance: 99, stake: 100, .. })
        ));

        let challenge = open_pvp("alice", 400, "bob", 1, 14, 100, t0()).unwrap();
        assert_eq!(challenge.status, ChallengeStatus::Pending);
        assert!(challenge.started_at.is_none());
    }

    #[test]
    fn test_friend_challenge_scenario() {
        let mut ledger = Ledger::new(&[("alice", 400), ("bob", 600)]);
        let mut challenge = open_pvp("alice", ledger.xp("alice"), "bob", 1, 14, 100, t0()).unwrap();
        // Nothing escrowed while pending
        assert_eq!(ledger.xp("alice"), 400);

        let escrow = accept(&mut challenge, "bob", 2, ledger.xp("bob"), ledger.xp("alice"), t0()).unwrap();
        ledger.apply(&escrow);
        assert_eq!(ledger.xp("alice"), 300);
        assert_eq!(ledger.xp("bob"), 500);
        assert_eq!(challenge.status, ChallengeStatus::Active);

        progress(&mut challenge, "alice", 1, 10, 3);
        progress(&mut challenge, "bob", 2, 14, 3);
        assert_eq!(challenge.initiator_progress, 10);
        assert_eq!(challenge.opponent_progress, 14);

        let payout = resolve(&mut challenge, after_days(14)).unwrap();
        ledger.apply(&payout);
        assert_eq!(challenge.status, ChallengeStatus::OpponentWon);
        assert_eq!(ledger.xp("bob"), 700);
        assert_eq!(ledger.xp("alice"), 300);
        assert_eq!(ledger.total(), 1000);
    }

    #[test]
    fn test_tie_refunds_both_stakes() {
        let mut ledger = Ledger::new(&[("alice", 800), ("bob", 800)]);
        let mut challenge = open_pvp("alice", 800, "bob", 1, 7, 150, t0()).unwrap();
        ledger.apply(&accept(&mut challenge, "bob", 9, 800, 800, t0()).unwrap());
        assert_eq!(ledger.total(), 1300);

        progress(&mut challenge, "alice", 1, 5, 1);
        progress(&mut challenge, "bob", 9, 5, 1);
        ledger.apply(&resolve(&mut challenge, after_days(7)).unwrap());

        assert_eq!(challenge.status, ChallengeStatus::Tied);
        assert_eq!(ledger.xp("alice"), 800);
        assert_eq!(ledger.xp("bob"), 800);
    }

    #[test]
    fn test_accept_is_all_or_nothing() {
        let mut challenge = open_pvp("alice", 400, "bob", 1, 14, 100, t0()).unwrap();

        let err = accept(&mut challenge, "bob", 2, 50, 400, t0()).unwrap_err();
        assert!(matches!(err, ChallengeError::InsufficientXp { .. }));
        assert_eq!(challenge.status, ChallengeStatus::Pending);
        assert!(challenge.opponent_habit_id.is_none());

        // Initiator spent their XP while waiting
        let err = accept(&mut challenge, "bob", 2, 600, 20, t0()).unwrap_err();
        assert!(matches!(err, ChallengeError::InsufficientXp { .. }));
        assert_eq!(challenge.status, ChallengeStatus::Pending);
    }

    #[test]
    fn test_only_pending_challenges_can_be_answered() {
        let mut challenge = open_pvp("alice", 400, "bob", 1, 14, 100, t0()).unwrap();
        assert_eq!(
            accept(&mut challenge, "carol", 2, 600, 400, t0()).unwrap_err(),
            ChallengeError::NotOpponent
        );

        accept(&mut challenge, "bob", 2, 600, 400, t0()).unwrap();
        assert!(matches!(
            accept(&mut challenge, "bob", 2, 600, 400, t0()),
            Err(ChallengeError::WrongStatus { actual: "active", .. })
        ));
        assert!(matches!(reject(&mut challenge, "bob"), Err(ChallengeError::WrongStatus { .. })));
    }

    #[test]
    fn test_reject_and_cancel() {
        let mut challenge = open_pvp("alice", 400, "bob", 1, 14, 100, t0()).unwrap();
        assert_eq!(reject(&mut challenge, "alice").unwrap_err(), ChallengeError::NotOpponent);
        reject(&mut challenge, "bob").unwrap();
        assert_eq!(challenge.status, ChallengeStatus::Rejected);
        assert!(reject(&mut challenge, "bob").is_err());

        let mut other = open_pvp("alice", 400, "bob", 1, 14, 100, t0()).unwrap();
        assert_eq!(cancel(&mut other, "bob").unwrap_err(), ChallengeError::NotInitiator);
        cancel(&mut other, "alice").unwrap();
        assert_eq!(other.status, ChallengeStatus::Rejected);
    }

    #[test]
    fn test_progress_is_bounded_and_windowed() {
        let mut challenge = open_pvp("alice", 400, "bob", 1, 7, 100, t0()).unwrap();
        // Not active yet
        assert!(!record_progress(&mut challenge, "alice", 1, t0()));

        accept(&mut challenge, "bob", 2, 600, 400, t0()).unwrap();
        // Wrong habit for this challenge
        assert!(!record_progress(&mut challenge, "alice", 2, after_days(1)));
        assert!(!record_progress(&mut challenge, "bob", 1, after_days(1)));

        progress(&mut challenge, "alice", 1, 20, 1);
        assert_eq!(challenge.initiator_progress, 7);

        // Window closed
        assert!(!record_progress(&mut challenge, "bob", 2, after_days(7)));
        assert_eq!(challenge.opponent_progress, 0);
    }

    #[test]
    fn test_resolution_trigger() {
        let mut challenge = open_pvp("alice", 400, "bob", 1, 7, 100, t0()).unwrap();
        assert!(!resolution_due(&challenge, after_days(30)));

        accept(&mut challenge, "bob", 2, 600, 400, t0()).unwrap();
        assert!(!resolution_due(&challenge, after_days(3)));
        assert_eq!(resolve(&mut challenge, after_days(3)).unwrap_err(), ChallengeError::NotDue);

        progress(&mut challenge, "bob", 2, 7, 3);
        assert!(resolution_due(&challenge, after_days(3)));

        let payout = resolve(&mut challenge, after_days(3)).unwrap();
        assert_eq!(payout, vec![XpTransfer::credit("bob", 200, REASON_PAYOUT)]);
        assert!(!resolution_due(&challenge, after_days(8)));
        assert!(resolve(&mut challenge, after_days(8)).is_err());
    }

    #[test]
    fn test_ai_challenge_escrows_only_the_human() {
        let mut ledger = Ledger::new(&[("alice", 400)]);
        let (mut challenge, escrow) =
            open_vs_ai("alice", 400, 1, AiDifficulty::Medium, 7, 100, t0()).unwrap();
        ledger.apply(&escrow);
        assert_eq!(ledger.xp("alice"), 300);
        assert_eq!(challenge.status, ChallengeStatus::Active);
        assert_eq!(challenge.opponent_id, AI_OPPONENT_ID);
        assert_eq!(reject(&mut challenge, AI_OPPONENT_ID).unwrap_err(), ChallengeError::AiChallenge);

        // AI wins: the stake is gone, nobody gets credited
        challenge.ai_ticks_applied = 7;
        challenge.opponent_progress = 5;
        challenge.initiator_progress = 4;
        let payout = resolve(&mut challenge, after_days(7)).unwrap();
        assert!(payout.is_empty());
        ledger.apply(&payout);
        assert_eq!(ledger.xp("alice"), 300);
    }

    #[test]
    fn test_ai_tie_refunds_the_human() {
        let (mut challenge, _) = open_vs_ai("alice", 400, 1, AiDifficulty::Easy, 7, 100, t0()).unwrap();
        challenge.ai_ticks_applied = 7;
        challenge.opponent_progress = 3;
        challenge.initiator_progress = 3;
        let payout = resolve(&mut challenge, after_days(7)).unwrap();
        assert_eq!(payout, vec![XpTransfer::credit("alice", 100, REASON_REFUND)]);
    }

    #[test]
    fn test_ai_ticks() {
        let (mut challenge, _) = open_vs_ai("alice", 400, 1, AiDifficulty::Hard, 7, 100, t0()).unwrap();
        assert_eq!(ai_ticks_due(&challenge, t0()), 0);
        assert_eq!(ai_ticks_due(&challenge, after_days(2)), 2);

        apply_ai_tick(&mut challenge, true);
        apply_ai_tick(&mut challenge, false);
        assert_eq!(challenge.opponent_progress, 1);
        assert_eq!(ai_ticks_due(&challenge, after_days(2)), 0);
        // Capped at the challenge length
        assert_eq!(ai_ticks_due(&challenge, after_days(40)), 5);
    }

    #[test]
    fn test_ai_last_roll_lands_before_settling() {
        let (mut challenge, _) = open_vs_ai("alice", 400, 1, AiDifficulty::Expert, 7, 100, t0()).unwrap();
        for _ in 0..6 {
            apply_ai_tick(&mut challenge, true);
        }
        challenge.initiator_progress = 6;

        let ends_at = after_days(7);
        assert!(resolution_due(&challenge, ends_at));
        assert_eq!(ai_ticks_due(&challenge, ends_at), 1);
        assert_eq!(resolve(&mut challenge, ends_at).unwrap_err(), ChallengeError::AiTicksOwed(1));
        assert_eq!(challenge.status, ChallengeStatus::Active);

        let rolled = catch_up_ai_ticks(&mut challenge, ends_at, || (0, 0));
        assert_eq!(rolled, 1);
        assert_eq!(challenge.ai_ticks_applied, 7);
        assert_eq!(challenge.opponent_progress, 7);

        let payout = resolve(&mut challenge, ends_at).unwrap();
        assert_eq!(challenge.status, ChallengeStatus::OpponentWon);
        assert!(payout.is_empty());
    }

    #[test]
    fn test_catch_up_ignores_pvp() {
        let mut challenge = open_pvp("alice", 400, "bob", 1, 7, 100, t0()).unwrap();
        accept(&mut challenge, "bob", 2, 600, 400, t0()).unwrap();
        assert_eq!(catch_up_ai_ticks(&mut challenge, after_days(7), || (0, 0)), 0);
        assert_eq!(challenge.opponent_progress, 0);
    }

    #[test]
    fn test_ai_completion_curve() {
        assert!(ai_tick_hits(AiDifficulty::Easy, 0, 59));
        assert!(!ai_tick_hits(AiDifficulty::Easy, 0, 60));
        assert!(ai_tick_hits(AiDifficulty::Easy, 10, 69));
        assert!(!ai_tick_hits(AiDifficulty::Easy, -10, 50));
        // Jitter is clamped to ±10 and the chance to 100
        assert!(!ai_tick_hits(AiDifficulty::Medium, 50, 85));
        assert!(ai_tick_hits(AiDifficulty::Expert, 10, 99));
    }

    #[test]
    fn test_projection_per_side() {
        let mut challenge = open_pvp("alice", 400, "bob", 1, 14, 100, t0()).unwrap();
        challenge.id = 42;
        accept(&mut challenge, "bob", 2, 600, 400, t0()).unwrap();
        progress(&mut challenge, "alice", 1, 3, 1);
        progress(&mut challenge, "bob", 2, 14, 1);
        resolve(&mut challenge, after_days(2)).unwrap();

        let alice = project(&challenge, "alice").unwrap();
        assert_eq!(alice.challenge_id, 42);
        assert_eq!(alice.opponent_id, "bob");
        assert_eq!(alice.outcome, ChallengeOutcome::Defeated);
        assert_eq!((alice.my_progress, alice.opponent_progress), (3, 14));
        assert_eq!(alice.my_habit_id, Some(1));

        let bob = project(&challenge, "bob").unwrap();
        assert!(!bob.is_initiator);
        assert_eq!(bob.outcome, ChallengeOutcome::Victory);
        assert_eq!((bob.my_progress, bob.opponent_progress), (14, 3));
        assert_eq!(bob.my_habit_id, Some(2));

        assert!(project(&challenge, "carol").is_none());
    }
}
