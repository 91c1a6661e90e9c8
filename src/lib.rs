use spacetimedb::{
    ReducerContext, Identity, Table, Timestamp, ScheduleAt,
    table, reducer, view, SpacetimeType, rand::Rng,
    client_visibility_filter, Filter,
};

mod calendar;
mod challenges;
mod insight;
mod leveling;
mod stakes;

// Import reducers for migrating exported documents
mod restore;

use calendar::{clamp_utc_offset, format_day, local_day, MICROS_PER_DAY};
use challenges::{
    catch_up_ai_ticks, is_ai_opponent, project, record_progress, resolution_due,
    AiDifficulty, ChallengeProjection, ChallengeStatus, XpTransfer, AI_JITTER_PCT,
    AI_OPPONENT_ID,
};
use insight::{build_prompt, parse_insight_reply, summarize};
use leveling::{apply_xp_delta, level_for_total_xp, level_info, LevelInfo};
use stakes::{stake_options, StakeOptions};

// ==================== CONSTANTS ====================

/// How often the maintenance sweep runs
const MAINTENANCE_INTERVAL_SECS: u64 = 60;

/// Challenge notifications and finished insight requests are kept this long
const RETENTION_DAYS: i64 = 7;

const MAX_PERSONA_TRAITS: usize = 8;
const MAX_PERSONA_TRAIT_LEN: usize = 40;
const MAX_DISPLAY_NAME_LEN: usize = 40;
const MAX_HABIT_NAME_LEN: usize = 60;
const MAX_CATEGORY_LEN: usize = 30;

/// Custom XP rewards must stay within 1..=MAX_CUSTOM_XP
const MAX_CUSTOM_XP: u32 = 100;

/// game_config is a single row
const CONFIG_ROW_ID: u32 = 0;
const DEFAULT_INSIGHT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_INSIGHT_MODEL: &str = "sage-default";
const DEFAULT_MAX_OPEN_CHALLENGES: u32 = 10;

// ==================== HELPER FUNCTIONS ====================

/// First 8 characters of an id, for logs
fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn is_authorized(ctx: &ReducerContext) -> bool {
    ctx.db.authorized_worker().identity().find(&ctx.sender).is_some()
}

/// Resolve the calling connection to its verified user id
fn acting_user(ctx: &ReducerContext) -> Result<String, String> {
    ctx.db.session()
        .connection_id()
        .find(&ctx.sender)
        .map(|s| s.user_id)
        .ok_or("No session found - sign in first".to_string())
}

fn get_account(ctx: &ReducerContext, user_id: &str) -> Result<UserAccount, String> {
    ctx.db.user_account()
        .id()
        .find(&user_id.to_string())
        .ok_or(format!("Account {} not found", short_id(user_id)))
}

fn get_config(ctx: &ReducerContext) -> GameConfig {
    ctx.db.game_config()
        .id()
        .find(&CONFIG_ROW_ID)
        .unwrap_or_else(GameConfig::default)
}

/// Habit owned by `user_id`
fn owned_habit(ctx: &ReducerContext, user_id: &str, habit_id: u64) -> Result<Habit, String> {
    let habit = ctx.db.habit()
        .id()
        .find(&habit_id)
        .ok_or(format!("Habit {} not found", habit_id))?;
    if habit.user_id != user_id {
        return Err(format!("Habit {} does not belong to you", habit_id));
    }
    Ok(habit)
}

/// Apply a signed XP change, keep the derived level in sync and record it.
/// Debits larger than the balance fail and leave the account untouched.
fn apply_xp(ctx: &ReducerContext, user_id: &str, delta: i64, reason: &str) -> Result<UserAccount, String> {
    let mut account = get_account(ctx, user_id)?;
    let old_level = account.level;

    account.total_xp = apply_xp_delta(account.total_xp, delta)
        .map_err(|e| format!("{} for {}", e, short_id(user_id)))?;
    account.level = level_for_total_xp(account.total_xp);
    ctx.db.user_account().id().update(account.clone());

    ctx.db.xp_event().insert(XpEvent {
        id: 0, // auto_inc
        user_id: user_id.to_string(),
        delta,
        balance_after: account.total_xp,
        reason: reason.to_string(),
        created_at: ctx.timestamp,
    });

    if account.level != old_level {
        log::info!("[XP] level_change user={} from={} to={} total_xp={} reason={}",
            short_id(user_id), old_level, account.level, account.total_xp, reason);
    }
    Ok(account)
}

/// Check that every transfer lands on an existing account and keeps its
/// balance in range, taking earlier transfers in the batch into account.
fn preflight_transfers(
    transfers: &[XpTransfer],
    balance_of: impl Fn(&str) -> Option<u64>,
) -> Result<(), String> {
    let mut running: Vec<(&str, u64)> = Vec::new();
    for transfer in transfers {
        let user_id = transfer.user_id.as_str();
        let slot = match running.iter().position(|(id, _)| *id == user_id) {
            Some(i) => i,
            None => {
                let balance = balance_of(user_id)
                    .ok_or(format!("Account {} not found", short_id(user_id)))?;
                running.push((user_id, balance));
                running.len() - 1
            }
        };
        running[slot].1 = apply_xp_delta(running[slot].1, transfer.delta)
            .map_err(|e| format!("{} for {}", e, short_id(user_id)))?;
    }
    Ok(())
}

/// Apply a batch of transfers. Nothing is written unless every one of them fits.
fn apply_transfers(ctx: &ReducerContext, transfers: &[XpTransfer]) -> Result<(), String> {
    preflight_transfers(transfers, |user_id| {
        ctx.db.user_account().id().find(&user_id.to_string()).map(|a| a.total_xp)
    })?;
    for transfer in transfers {
        apply_xp(ctx, &transfer.user_id, transfer.delta, transfer.reason)?;
    }
    Ok(())
}

/// Append a notification row for one human participant
fn emit_event(ctx: &ReducerContext, user_id: &str, challenge_id: u64, kind: ChallengeEventKind, message: String) {
    if is_ai_opponent(user_id) {
        return;
    }
    ctx.db.challenge_event().insert(ChallengeEvent {
        id: 0, // auto_inc
        user_id: user_id.to_string(),
        challenge_id,
        kind,
        message,
        created_at: ctx.timestamp,
    });
}

/// Pending + active challenges started by `user_id`
fn count_open_challenges(ctx: &ReducerContext, user_id: &str) -> u32 {
    ctx.db.challenge()
        .initiator_id()
        .filter(&user_id.to_string())
        .filter(|c| c.status.is_open())
        .count() as u32
}

/// Challenges where `user_id` is on either side
fn challenges_of(ctx: &ReducerContext, user_id: &str) -> Vec<Challenge> {
    let uid = user_id.to_string();
    let mut all: Vec<Challenge> = ctx.db.challenge().initiator_id().filter(&uid).collect();
    all.extend(ctx.db.challenge().opponent_id().filter(&uid));
    all
}

fn find_challenge(ctx: &ReducerContext, challenge_id: u64) -> Result<Challenge, String> {
    ctx.db.challenge()
        .id()
        .find(&challenge_id)
        .ok_or(format!("Challenge {} not found", challenge_id))
}

/// Bump win/loss/tie counters of the human participants
fn record_challenge_result(ctx: &ReducerContext, challenge: &Challenge) {
    let sides = [
        (&challenge.initiator_id, ChallengeStatus::InitiatorWon),
        (&challenge.opponent_id, ChallengeStatus::OpponentWon),
    ];
    for (user_id, winning_status) in sides {
        if is_ai_opponent(user_id) {
            continue;
        }
        if let Some(mut account) = ctx.db.user_account().id().find(user_id) {
            if challenge.status == ChallengeStatus::Tied {
                account.challenges_tied += 1;
            } else if challenge.status == winning_status {
                account.challenges_won += 1;
            } else {
                account.challenges_lost += 1;
            }
            ctx.db.user_account().id().update(account);
        }
    }
}

/// Roll the AI's owed daily ticks with the module RNG
fn roll_ai_ticks(ctx: &ReducerContext, challenge: &mut Challenge) -> u32 {
    let mut rng = ctx.rng();
    let rolled = catch_up_ai_ticks(challenge, ctx.timestamp, || {
        (rng.gen_range(-AI_JITTER_PCT..=AI_JITTER_PCT), rng.gen_range(0..100u32))
    });
    if rolled > 0 {
        log::debug!("[CHALLENGE] ai_ticks challenge_id={} ticks={} ai_progress={}/{}",
            challenge.id, rolled, challenge.opponent_progress, challenge.duration_days);
    }
    rolled
}

/// Resolve a due challenge, pay out and notify both sides
fn finalize_challenge(ctx: &ReducerContext, mut challenge: Challenge) -> Result<(), String> {
    // The AI's last roll is owed exactly when the window closes
    roll_ai_ticks(ctx, &mut challenge);
    let payouts = challenges::resolve(&mut challenge, ctx.timestamp).map_err(|e| e.to_string())?;
    apply_transfers(ctx, &payouts)?;
    ctx.db.challenge().id().update(challenge.clone());
    record_challenge_result(ctx, &challenge);

    let score = format!("{}-{}", challenge.initiator_progress, challenge.opponent_progress);
    for user_id in [&challenge.initiator_id, &challenge.opponent_id] {
        emit_event(ctx, user_id, challenge.id, ChallengeEventKind::Resolved,
            format!("Challenge finished {} ({})", challenge.status.label(), score));
    }

    // Wide event: one canonical log per resolution
    log::info!("[CHALLENGE] resolved challenge_id={} outcome={} score={} stake={} initiator={} opponent={} payouts={}",
        challenge.id, challenge.status.label(), score, challenge.stake,
        short_id(&challenge.initiator_id), short_id(&challenge.opponent_id), payouts.len());
    Ok(())
}

/// What completing a habit does to today's record
#[derive(Debug, Clone, Copy, PartialEq)]
enum CompletionStep {
    /// Already completed today: no XP, no streak, no challenge progress
    AlreadyDone,
    /// Logged as missed earlier today
    Upgrade,
    Insert,
}

impl CompletionStep {
    fn awards_xp(&self) -> bool {
        !matches!(self, CompletionStep::AlreadyDone)
    }
}

fn completion_step(existing: Option<&HabitCompletion>) -> CompletionStep {
    match existing {
        Some(record) if record.completed => CompletionStep::AlreadyDone,
        Some(_) => CompletionStep::Upgrade,
        None => CompletionStep::Insert,
    }
}

/// Streak after a completion on `day`: (current, longest)
fn advance_streak(current: u32, longest: u32, last_day: Option<i32>, day: i32) -> (u32, u32) {
    let current = match last_day {
        Some(last) if last >= day => current.max(1),
        Some(last) if last == day - 1 => current + 1,
        _ => 1,
    };
    (current, longest.max(current))
}

/// Did the user miss at least one whole day since their last completion?
fn streak_broken(last_day: Option<i32>, today: i32) -> bool {
    match last_day {
        Some(last) => today - last > 1,
        None => false,
    }
}

fn reset_streak_if_broken(account: &mut UserAccount, now: Timestamp) -> bool {
    let today = local_day(now, account.utc_offset_minutes);
    if account.current_streak > 0 && streak_broken(account.last_completion_day, today) {
        log::info!("[STREAK] broken user={} lost_streak={} last_day={}",
            short_id(&account.id), account.current_streak,
            account.last_completion_day.map(format_day).unwrap_or_default());
        account.current_streak = 0;
        return true;
    }
    false
}

/// User ids from the auth gateway; the AI opponent id is reserved
fn validate_session_user(user_id: &str) -> Result<(), String> {
    if user_id.trim().is_empty() {
        return Err("User id must not be empty".to_string());
    }
    if user_id == AI_OPPONENT_ID {
        return Err(format!("User id '{}' is reserved", AI_OPPONENT_ID));
    }
    Ok(())
}

fn clean_text(value: &str, max_len: usize, what: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("{} must not be empty", what));
    }
    if trimmed.chars().count() > max_len {
        return Err(format!("{} must be at most {} characters", what, max_len));
    }
    Ok(trimmed.to_string())
}

/// Trimmed, non-empty, bounded persona traits
fn clean_persona(traits: Vec<String>) -> Vec<String> {
    traits
        .into_iter()
        .map(|t| t.trim().chars().take(MAX_PERSONA_TRAIT_LEN).collect::<String>())
        .filter(|t| !t.is_empty())
        .take(MAX_PERSONA_TRAITS)
        .collect()
}

fn habit_xp_reward(difficulty: HabitDifficulty, custom_xp: Option<u32>) -> Result<u32, String> {
    match custom_xp {
        Some(xp) if xp == 0 || xp > MAX_CUSTOM_XP => {
            Err(format!("Custom XP must be between 1 and {}", MAX_CUSTOM_XP))
        }
        Some(xp) => Ok(xp),
        None => Ok(difficulty.xp_reward()),
    }
}

fn micros_ago(now: Timestamp, then: Timestamp) -> i64 {
    now.to_micros_since_unix_epoch() - then.to_micros_since_unix_epoch()
}

// ==================== TABLES ====================

/// Links an ephemeral connection to a verified user
/// PRIVATE: written only by the auth gateway
#[table(name = session)]
pub struct Session {
    #[primary_key]
    pub connection_id: Identity,

    /// Stable user id issued by the auth provider
    #[index(btree)]
    pub user_id: String,

    pub connected_at: Timestamp,
}

/// Identities allowed to call worker/admin reducers and read the insight queue
#[table(name = authorized_worker)]
pub struct AuthorizedWorker {
    #[primary_key]
    pub identity: Identity,
}

/// Runtime tunables (single row, id = 0)
#[table(name = game_config)]
#[derive(Clone, Debug)]
pub struct GameConfig {
    #[primary_key]
    pub id: u32,

    /// Pending insight requests fail after this many seconds
    pub insight_timeout_secs: u64,

    /// Model name forwarded to the worker with each prompt
    pub insight_model: String,

    /// Pending + active challenges one user may have started
    pub max_open_challenges: u32,

    pub ai_opponents_enabled: bool,
}

impl Default for GameConfig {
    fn default() -> Self {
        GameConfig {
            id: CONFIG_ROW_ID,
            insight_timeout_secs: DEFAULT_INSIGHT_TIMEOUT_SECS,
            insight_model: DEFAULT_INSIGHT_MODEL.to_string(),
            max_open_challenges: DEFAULT_MAX_OPEN_CHALLENGES,
            ai_opponents_enabled: true,
        }
    }
}

/// Player account
/// PRIVATE: clients read it through the my_account view
#[table(name = user_account)]
#[derive(Clone, Debug)]
pub struct UserAccount {
    #[primary_key]
    pub id: String,

    pub display_name: String,

    /// Cumulative XP; only changes through apply_xp
    pub total_xp: u64,

    /// Always level_for_total_xp(total_xp)
    pub level: u32,

    pub current_streak: u32,
    pub longest_streak: u32,

    /// Local day of the most recent habit completion
    pub last_completion_day: Option<i32>,

    /// Free-form traits, only used as Sage prompt context
    pub persona: Vec<String>,

    /// Minutes east of UTC, defines the user's calendar days
    pub utc_offset_minutes: i32,

    pub challenges_won: u32,
    pub challenges_lost: u32,
    pub challenges_tied: u32,

    pub created_at: Timestamp,
    pub last_seen: Timestamp,
}

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq)]
pub enum HabitFrequency {
    Daily,
    Weekly,
    Monthly,
}

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq)]
pub enum HabitDifficulty {
    Easy,
    Medium,
    Hard,
}

impl HabitDifficulty {
    /// Default XP per completion
    pub fn xp_reward(&self) -> u32 {
        match self {
            HabitDifficulty::Easy => 5,
            HabitDifficulty::Medium => 10,
            HabitDifficulty::Hard => 20,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            HabitDifficulty::Easy => "easy",
            HabitDifficulty::Medium => "medium",
            HabitDifficulty::Hard => "hard",
        }
    }
}

#[table(name = habit)]
#[derive(Clone, Debug)]
pub struct Habit {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub user_id: String,

    pub name: String,

    /// Free-text tag
    pub category: String,

    pub frequency: HabitFrequency,
    pub difficulty: HabitDifficulty,

    /// Fixed at creation; later difficulty edits never change it
    pub xp_reward: u32,

    pub created_at: Timestamp,
}

/// One calendar day of one habit. At most one row per (habit_id, day).
#[table(name = habit_completion)]
#[derive(Clone, Debug)]
pub struct HabitCompletion {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub habit_id: u64,

    #[index(btree)]
    pub user_id: String,

    /// Local calendar day (days since 1970-01-01)
    pub day: i32,

    /// false = the user logged this day as missed
    pub completed: bool,

    pub recorded_at: Timestamp,
}

/// Single authoritative record of a challenge; both participants read it
/// through the my_challenges view.
#[table(name = challenge)]
#[derive(Clone, Debug)]
pub struct Challenge {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub initiator_id: String,

    /// User id, or "AI" for AI Sage challenges
    #[index(btree)]
    pub opponent_id: String,

    /// Set only for AI challenges
    pub ai_difficulty: Option<AiDifficulty>,

    pub initiator_habit_id: u64,

    /// Chosen by the opponent when accepting
    pub opponent_habit_id: Option<u64>,

    /// 7, 14, 21 or 30
    pub duration_days: u32,

    /// XP each side puts in
    pub stake: u64,

    pub status: ChallengeStatus,

    /// Both bounded by duration_days
    pub initiator_progress: u32,
    pub opponent_progress: u32,

    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub ends_at: Option<Timestamp>,
    pub resolved_at: Option<Timestamp>,

    /// Daily AI progress rolls already made
    pub ai_ticks_applied: u32,
}

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq)]
pub enum ChallengeEventKind {
    Received,
    Accepted,
    Rejected,
    Cancelled,
    Progress,
    Resolved,
}

/// Notification feed for challenge participants
#[table(name = challenge_event)]
pub struct ChallengeEvent {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    /// Recipient
    #[index(btree)]
    pub user_id: String,

    pub challenge_id: u64,
    pub kind: ChallengeEventKind,
    pub message: String,
    pub created_at: Timestamp,
}

/// Audit trail of every XP balance change
#[table(name = xp_event)]
pub struct XpEvent {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub user_id: String,

    pub delta: i64,
    pub balance_after: u64,

    /// e.g. "habit_completion", "challenge_stake", "challenge_payout"
    pub reason: String,

    pub created_at: Timestamp,
}

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq)]
pub enum InsightRequestState {
    Pending,
    Completed,
    Failed,
}

/// Prompt queue drained by the Sage worker
/// SECURITY: public table with RLS - only authorized workers can see rows
#[table(name = insight_request, public)]
#[derive(Clone)]
pub struct InsightRequest {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub user_id: String,

    pub prompt: String,

    /// Model the worker should call
    pub model: String,

    pub state: InsightRequestState,

    pub created_at: Timestamp,
    pub finished_at: Option<Timestamp>,

    /// Network, auth or parse failure reported for this request
    pub error: Option<String>,
}

/// Parsed Sage reply
#[table(name = sage_insight)]
#[derive(Clone)]
pub struct SageInsight {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub user_id: String,

    pub request_id: u64,

    /// At most 30 words
    pub insight: String,

    /// At most 15 words
    pub suggested_habit: String,

    pub created_at: Timestamp,
}

/// Schedule table for the maintenance sweep
#[table(name = maintenance_schedule, scheduled(run_maintenance))]
pub struct MaintenanceSchedule {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    pub scheduled_at: ScheduleAt,
}

// ==================== ROW LEVEL SECURITY ====================

/// RLS Filter: only authorized workers see queued prompts
#[client_visibility_filter]
const INSIGHT_QUEUE_VISIBILITY: Filter = Filter::Sql(
    "SELECT ir.* FROM insight_request ir
     JOIN authorized_worker aw WHERE aw.identity = :sender"
);

// ==================== VIEWS ====================

fn session_user(ctx: &spacetimedb::ViewContext) -> Option<String> {
    ctx.db.session().connection_id().find(ctx.sender).map(|s| s.user_id)
}

/// View: the caller's own account
#[view(name = my_account, public)]
fn my_account(ctx: &spacetimedb::ViewContext) -> Option<UserAccount> {
    let user_id = session_user(ctx)?;
    ctx.db.user_account().id().find(&user_id)
}

/// View: level progress for the champion card
#[view(name = my_level, public)]
fn my_level(ctx: &spacetimedb::ViewContext) -> Option<LevelInfo> {
    let user_id = session_user(ctx)?;
    let account = ctx.db.user_account().id().find(&user_id)?;
    Some(level_info(account.total_xp))
}

/// View: wager bounds and suggestions for the challenge screen
#[view(name = my_stake_options, public)]
fn my_stake_options(ctx: &spacetimedb::ViewContext) -> Option<StakeOptions> {
    let user_id = session_user(ctx)?;
    let account = ctx.db.user_account().id().find(&user_id)?;
    Some(stake_options(account.level, account.total_xp))
}

#[view(name = my_habits, public)]
fn my_habits(ctx: &spacetimedb::ViewContext) -> Vec<Habit> {
    match session_user(ctx) {
        Some(user_id) => ctx.db.habit().user_id().filter(&user_id).collect(),
        None => Vec::new(),
    }
}

#[view(name = my_completions, public)]
fn my_completions(ctx: &spacetimedb::ViewContext) -> Vec<HabitCompletion> {
    match session_user(ctx) {
        Some(user_id) => ctx.db.habit_completion().user_id().filter(&user_id).collect(),
        None => Vec::new(),
    }
}

/// View: every challenge the caller is part of, from their side
#[view(name = my_challenges, public)]
fn my_challenges(ctx: &spacetimedb::ViewContext) -> Vec<ChallengeProjection> {
    let Some(user_id) = session_user(ctx) else {
        return Vec::new();
    };
    ctx.db.challenge()
        .initiator_id()
        .filter(&user_id)
        .chain(ctx.db.challenge().opponent_id().filter(&user_id))
        .filter_map(|c| project(&c, &user_id))
        .collect()
}

#[view(name = my_challenge_events, public)]
fn my_challenge_events(ctx: &spacetimedb::ViewContext) -> Vec<ChallengeEvent> {
    match session_user(ctx) {
        Some(user_id) => ctx.db.challenge_event().user_id().filter(&user_id).collect(),
        None => Vec::new(),
    }
}

#[view(name = my_insights, public)]
fn my_insights(ctx: &spacetimedb::ViewContext) -> Vec<SageInsight> {
    match session_user(ctx) {
        Some(user_id) => ctx.db.sage_insight().user_id().filter(&user_id).collect(),
        None => Vec::new(),
    }
}

// ==================== REDUCERS ====================

/// Create a verified session for a client identity
/// Called by the auth gateway AFTER it verified the auth provider's token
#[reducer]
pub fn create_session(ctx: &ReducerContext, client_identity: String, user_id: String) -> Result<(), String> {
    if !is_authorized(ctx) {
        log::warn!("Unauthorized create_session attempt by {}", ctx.sender);
        return Err("Unauthorized: only the gateway can create sessions".to_string());
    }

    validate_session_user(&user_id)?;
    let identity = Identity::from_hex(&client_identity)
        .map_err(|e| format!("Invalid identity hex string: {:?}", e))?;

    // Same user reconnecting OR same connection id reused
    let stale_sessions: Vec<_> = ctx.db.session()
        .iter()
        .filter(|s| s.user_id == user_id || s.connection_id == identity)
        .map(|s| s.connection_id)
        .collect();
    for conn_id in stale_sessions {
        ctx.db.session().connection_id().delete(&conn_id);
    }

    ctx.db.session().insert(Session {
        connection_id: identity,
        user_id: user_id.clone(),
        connected_at: ctx.timestamp,
    });

    log::info!("[SESSION] created user:{} ws:{}", short_id(&user_id), short_id(&client_identity));
    Ok(())
}

#[reducer(client_disconnected)]
pub fn on_disconnect(ctx: &ReducerContext) {
    if let Some(session) = ctx.db.session().connection_id().find(&ctx.sender) {
        log::debug!("[SESSION] closed user:{}", short_id(&session.user_id));
        ctx.db.session().connection_id().delete(&ctx.sender);
    }
}

/// Get-or-create the caller's account
#[reducer]
pub fn register(ctx: &ReducerContext, display_name: String, utc_offset_minutes: i32) -> Result<(), String> {
    let user_id = acting_user(ctx)?;
    let display_name = clean_text(&display_name, MAX_DISPLAY_NAME_LEN, "Display name")?;
    let utc_offset_minutes = clamp_utc_offset(utc_offset_minutes);

    if let Some(mut existing) = ctx.db.user_account().id().find(&user_id) {
        existing.display_name = display_name;
        existing.utc_offset_minutes = utc_offset_minutes;
        existing.last_seen = ctx.timestamp;
        reset_streak_if_broken(&mut existing, ctx.timestamp);
        ctx.db.user_account().id().update(existing.clone());

        log::info!("[ACCOUNT] user=\"{}\" user_id={} type=returning level={} xp={} streak={} challenges={}/{}/{}",
            existing.display_name, short_id(&user_id), existing.level, existing.total_xp,
            existing.current_streak, existing.challenges_won, existing.challenges_lost, existing.challenges_tied);
        return Ok(());
    }

    let account = UserAccount {
        id: user_id.clone(),
        display_name,
        total_xp: 0,
        level: level_for_total_xp(0),
        current_streak: 0,
        longest_streak: 0,
        last_completion_day: None,
        persona: Vec::new(),
        utc_offset_minutes,
        challenges_won: 0,
        challenges_lost: 0,
        challenges_tied: 0,
        created_at: ctx.timestamp,
        last_seen: ctx.timestamp,
    };
    ctx.db.user_account().insert(account.clone());

    log::info!("[ACCOUNT] user=\"{}\" user_id={} type=new utc_offset={}",
        account.display_name, short_id(&user_id), utc_offset_minutes);
    Ok(())
}

#[reducer]
pub fn update_persona(ctx: &ReducerContext, traits: Vec<String>) -> Result<(), String> {
    let user_id = acting_user(ctx)?;
    let mut account = get_account(ctx, &user_id)?;
    account.persona = clean_persona(traits);
    log::info!("[ACCOUNT] persona user={} traits={}", short_id(&user_id), account.persona.len());
    ctx.db.user_account().id().update(account);
    Ok(())
}

#[reducer]
pub fn create_habit(
    ctx: &ReducerContext,
    name: String,
    category: String,
    frequency: HabitFrequency,
    difficulty: HabitDifficulty,
    custom_xp: Option<u32>,
) -> Result<(), String> {
    let user_id = acting_user(ctx)?;
    get_account(ctx, &user_id)?;

    let name = clean_text(&name, MAX_HABIT_NAME_LEN, "Habit name")?;
    let category = category.trim().chars().take(MAX_CATEGORY_LEN).collect::<String>();
    let xp_reward = habit_xp_reward(difficulty, custom_xp)?;

    let habit = ctx.db.habit().insert(Habit {
        id: 0, // auto_inc
        user_id: user_id.clone(),
        name,
        category,
        frequency,
        difficulty,
        xp_reward,
        created_at: ctx.timestamp,
    });

    log::info!("[HABIT] created habit_id={} user={} name=\"{}\" difficulty={} xp={}",
        habit.id, short_id(&user_id), habit.name, difficulty.label(), xp_reward);
    Ok(())
}

/// Mark a habit done for today. Repeating it the same day changes nothing.
#[reducer]
pub fn complete_habit(ctx: &ReducerContext, habit_id: u64) -> Result<(), String> {
    let user_id = acting_user(ctx)?;
    let habit = owned_habit(ctx, &user_id, habit_id)?;
    let account = get_account(ctx, &user_id)?;
    let today = local_day(ctx.timestamp, account.utc_offset_minutes);

    let existing = ctx.db.habit_completion()
        .habit_id()
        .filter(&habit_id)
        .find(|c| c.day == today);

    match (completion_step(existing.as_ref()), existing) {
        (CompletionStep::AlreadyDone, _) => {
            log::debug!("[HABIT] already completed habit_id={} day={}", habit_id, format_day(today));
            return Ok(());
        }
        (CompletionStep::Upgrade, Some(mut record)) => {
            record.completed = true;
            record.recorded_at = ctx.timestamp;
            ctx.db.habit_completion().id().update(record);
        }
        _ => {
            ctx.db.habit_completion().insert(HabitCompletion {
                id: 0, // auto_inc
                habit_id,
                user_id: user_id.clone(),
                day: today,
                completed: true,
                recorded_at: ctx.timestamp,
            });
        }
    }

    let mut account = apply_xp(ctx, &user_id, habit.xp_reward as i64, "habit_completion")?;
    let (streak, longest) = advance_streak(
        account.current_streak, account.longest_streak, account.last_completion_day, today);
    account.current_streak = streak;
    account.longest_streak = longest;
    account.last_completion_day = Some(account.last_completion_day.map_or(today, |d| d.max(today)));
    ctx.db.user_account().id().update(account.clone());

    // Accrue progress on every active challenge tracking this habit
    let mut challenges_progressed = 0;
    for mut challenge in challenges_of(ctx, &user_id) {
        if !record_progress(&mut challenge, &user_id, habit_id, ctx.timestamp) {
            continue;
        }
        challenges_progressed += 1;
        let (other, mine) = if challenge.initiator_id == user_id {
            (challenge.opponent_id.clone(), challenge.initiator_progress)
        } else {
            (challenge.initiator_id.clone(), challenge.opponent_progress)
        };
        emit_event(ctx, &other, challenge.id, ChallengeEventKind::Progress,
            format!("{} is at {}/{}", account.display_name, mine, challenge.duration_days));
        ctx.db.challenge().id().update(challenge);
    }

    log::info!("[HABIT] completed habit_id={} user={} day={} xp={} total_xp={} streak={} challenges={}",
        habit_id, short_id(&user_id), format_day(today), habit.xp_reward, account.total_xp,
        account.current_streak, challenges_progressed);
    Ok(())
}

/// Log today as missed (feeds the Sage's weekday rollup)
#[reducer]
pub fn skip_habit(ctx: &ReducerContext, habit_id: u64) -> Result<(), String> {
    let user_id = acting_user(ctx)?;
    owned_habit(ctx, &user_id, habit_id)?;
    let account = get_account(ctx, &user_id)?;
    let today = local_day(ctx.timestamp, account.utc_offset_minutes);

    let already_recorded = ctx.db.habit_completion()
        .habit_id()
        .filter(&habit_id)
        .any(|c| c.day == today);
    if already_recorded {
        return Ok(());
    }

    ctx.db.habit_completion().insert(HabitCompletion {
        id: 0, // auto_inc
        habit_id,
        user_id: user_id.clone(),
        day: today,
        completed: false,
        recorded_at: ctx.timestamp,
    });
    log::debug!("[HABIT] missed habit_id={} user={} day={}", habit_id, short_id(&user_id), format_day(today));
    Ok(())
}

#[reducer]
pub fn delete_habit(ctx: &ReducerContext, habit_id: u64) -> Result<(), String> {
    let user_id = acting_user(ctx)?;
    owned_habit(ctx, &user_id, habit_id)?;

    let linked = challenges_of(ctx, &user_id).into_iter().any(|c| {
        c.status.is_open()
            && (c.initiator_habit_id == habit_id && c.initiator_id == user_id
                || c.opponent_habit_id == Some(habit_id) && c.opponent_id == user_id)
    });
    if linked {
        return Err("Habit is part of an open challenge".to_string());
    }

    let records: Vec<u64> = ctx.db.habit_completion()
        .habit_id()
        .filter(&habit_id)
        .map(|c| c.id)
        .collect();
    for id in &records {
        ctx.db.habit_completion().id().delete(id);
    }
    ctx.db.habit().id().delete(&habit_id);

    log::info!("[HABIT] deleted habit_id={} user={} records={}", habit_id, short_id(&user_id), records.len());
    Ok(())
}

/// Challenge a friend. Nothing is escrowed until they accept.
#[reducer]
pub fn create_challenge(
    ctx: &ReducerContext,
    opponent_id: String,
    habit_id: u64,
    duration_days: u32,
    stake: u64,
) -> Result<(), String> {
    let user_id = acting_user(ctx)?;
    let account = get_account(ctx, &user_id)?;
    owned_habit(ctx, &user_id, habit_id)?;

    if is_ai_opponent(&opponent_id) {
        return Err("Use create_ai_challenge to challenge the AI Sage".to_string());
    }
    let opponent = get_account(ctx, &opponent_id)?;

    let config = get_config(ctx);
    if count_open_challenges(ctx, &user_id) >= config.max_open_challenges {
        return Err(format!("You already have {} open challenges", config.max_open_challenges));
    }

    let challenge = challenges::open_pvp(
        &user_id, account.total_xp, &opponent_id, habit_id, duration_days, stake, ctx.timestamp,
    ).map_err(|e| e.to_string())?;
    let challenge = ctx.db.challenge().insert(challenge);

    emit_event(ctx, &opponent_id, challenge.id, ChallengeEventKind::Received,
        format!("{} challenged you: {} days for {} XP", account.display_name, duration_days, stake));

    log::info!("[CHALLENGE] created challenge_id={} initiator={} opponent=\"{}\" days={} stake={}",
        challenge.id, short_id(&user_id), opponent.display_name, duration_days, stake);
    Ok(())
}

/// Challenge the AI Sage. Starts immediately; only the caller's stake is escrowed.
#[reducer]
pub fn create_ai_challenge(
    ctx: &ReducerContext,
    habit_id: u64,
    duration_days: u32,
    stake: u64,
    difficulty: AiDifficulty,
) -> Result<(), String> {
    let user_id = acting_user(ctx)?;
    let account = get_account(ctx, &user_id)?;
    owned_habit(ctx, &user_id, habit_id)?;

    let config = get_config(ctx);
    if !config.ai_opponents_enabled {
        return Err("AI challenges are disabled".to_string());
    }
    if count_open_challenges(ctx, &user_id) >= config.max_open_challenges {
        return Err(format!("You already have {} open challenges", config.max_open_challenges));
    }

    let (challenge, escrow) = challenges::open_vs_ai(
        &user_id, account.total_xp, habit_id, difficulty, duration_days, stake, ctx.timestamp,
    ).map_err(|e| e.to_string())?;
    apply_transfers(ctx, &escrow)?;
    let challenge = ctx.db.challenge().insert(challenge);

    log::info!("[CHALLENGE] created challenge_id={} initiator={} opponent=AI difficulty={} days={} stake={}",
        challenge.id, short_id(&user_id), difficulty.label(), duration_days, stake);
    Ok(())
}

/// Accept a pending challenge, tracking it with one of your own habits
#[reducer]
pub fn accept_challenge(ctx: &ReducerContext, challenge_id: u64, habit_id: u64) -> Result<(), String> {
    let user_id = acting_user(ctx)?;
    let mut challenge = find_challenge(ctx, challenge_id)?;
    owned_habit(ctx, &user_id, habit_id)?;

    let opponent = get_account(ctx, &user_id)?;
    let initiator = get_account(ctx, &challenge.initiator_id)?;

    let escrow = challenges::accept(
        &mut challenge, &user_id, habit_id, opponent.total_xp, initiator.total_xp, ctx.timestamp,
    ).map_err(|e| e.to_string())?;
    apply_transfers(ctx, &escrow)?;
    ctx.db.challenge().id().update(challenge.clone());

    emit_event(ctx, &challenge.initiator_id, challenge.id, ChallengeEventKind::Accepted,
        format!("{} accepted your challenge. {} XP each is on the line", opponent.display_name, challenge.stake));

    log::info!("[CHALLENGE] accepted challenge_id={} initiator={} opponent={} stake={} days={}",
        challenge.id, short_id(&challenge.initiator_id), short_id(&user_id), challenge.stake, challenge.duration_days);
    Ok(())
}

#[reducer]
pub fn reject_challenge(ctx: &ReducerContext, challenge_id: u64) -> Result<(), String> {
    let user_id = acting_user(ctx)?;
    let mut challenge = find_challenge(ctx, challenge_id)?;
    challenges::reject(&mut challenge, &user_id).map_err(|e| e.to_string())?;
    ctx.db.challenge().id().update(challenge.clone());

    emit_event(ctx, &challenge.initiator_id, challenge.id, ChallengeEventKind::Rejected,
        "Your challenge was declined".to_string());
    log::info!("[CHALLENGE] rejected challenge_id={} by={}", challenge.id, short_id(&user_id));
    Ok(())
}

/// Withdraw a challenge you started before it was answered
#[reducer]
pub fn cancel_challenge(ctx: &ReducerContext, challenge_id: u64) -> Result<(), String> {
    let user_id = acting_user(ctx)?;
    let mut challenge = find_challenge(ctx, challenge_id)?;
    challenges::cancel(&mut challenge, &user_id).map_err(|e| e.to_string())?;
    ctx.db.challenge().id().update(challenge.clone());

    emit_event(ctx, &challenge.opponent_id, challenge.id, ChallengeEventKind::Cancelled,
        "A challenge sent to you was withdrawn".to_string());
    log::info!("[CHALLENGE] cancelled challenge_id={} by={}", challenge.id, short_id(&user_id));
    Ok(())
}

/// Settle a challenge whose window closed or whose score is maxed out
#[reducer]
pub fn resolve_challenge(ctx: &ReducerContext, challenge_id: u64) -> Result<(), String> {
    let user_id = acting_user(ctx)?;
    let challenge = find_challenge(ctx, challenge_id)?;
    if challenge.initiator_id != user_id && challenge.opponent_id != user_id {
        return Err("You are not part of this challenge".to_string());
    }
    finalize_challenge(ctx, challenge)
}

/// Queue an AI Sage insight for the caller
#[reducer]
pub fn request_insight(ctx: &ReducerContext) -> Result<(), String> {
    let user_id = acting_user(ctx)?;

    let in_flight = ctx.db.insight_request()
        .user_id()
        .filter(&user_id)
        .any(|r| r.state == InsightRequestState::Pending);
    if in_flight {
        return Err("The Sage is already working on an insight".to_string());
    }

    let account = get_account(ctx, &user_id)?;
    let habits: Vec<Habit> = ctx.db.habit().user_id().filter(&user_id).collect();
    let completions: Vec<HabitCompletion> = ctx.db.habit_completion().user_id().filter(&user_id).collect();

    let summary = summarize(&account, &habits, &completions);
    let prompt = build_prompt(&summary);
    let config = get_config(ctx);

    let request = ctx.db.insight_request().insert(InsightRequest {
        id: 0, // auto_inc
        user_id: user_id.clone(),
        prompt,
        model: config.insight_model,
        state: InsightRequestState::Pending,
        created_at: ctx.timestamp,
        finished_at: None,
        error: None,
    });

    log::info!("[SAGE] queued request_id={} user={} habits={} records={}",
        request.id, short_id(&user_id), habits.len(), completions.len());
    Ok(())
}

/// Worker reports the text-generation result (or its failure) for a request
#[reducer]
pub fn submit_insight_reply(
    ctx: &ReducerContext,
    request_id: u64,
    reply: Option<String>,
    error: Option<String>,
) -> Result<(), String> {
    if !is_authorized(ctx) {
        log::warn!("Unauthorized submit_insight_reply attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let mut request = ctx.db.insight_request()
        .id()
        .find(&request_id)
        .ok_or(format!("Insight request {} not found", request_id))?;

    if request.state != InsightRequestState::Pending {
        // Timed out or already answered
        log::warn!("[SAGE] late reply request_id={} state={:?}", request_id, request.state);
        return Ok(());
    }

    let outcome = match (reply, error) {
        (_, Some(err)) => Err(err),
        (Some(raw), None) => parse_insight_reply(&raw).map_err(|e| e.to_string()),
        (None, None) => Err("worker sent neither a reply nor an error".to_string()),
    };

    request.finished_at = Some(ctx.timestamp);
    match outcome {
        Ok(parsed) => {
            request.state = InsightRequestState::Completed;
            ctx.db.sage_insight().insert(SageInsight {
                id: 0, // auto_inc
                user_id: request.user_id.clone(),
                request_id,
                insight: parsed.insight,
                suggested_habit: parsed.suggested_habit,
                created_at: ctx.timestamp,
            });
            log::info!("[SAGE] completed request_id={} user={}", request_id, short_id(&request.user_id));
        }
        Err(err) => {
            log::warn!("[SAGE] failed request_id={} user={} error={}", request_id, short_id(&request.user_id), err);
            request.state = InsightRequestState::Failed;
            request.error = Some(err);
        }
    }
    ctx.db.insight_request().id().update(request);
    Ok(())
}

/// Update runtime tunables (authorized workers only)
#[reducer]
pub fn set_game_config(
    ctx: &ReducerContext,
    insight_timeout_secs: Option<u64>,
    insight_model: Option<String>,
    max_open_challenges: Option<u32>,
    ai_opponents_enabled: Option<bool>,
) -> Result<(), String> {
    if !is_authorized(ctx) {
        log::warn!("Unauthorized set_game_config attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let mut config = get_config(ctx);
    if let Some(secs) = insight_timeout_secs {
        if secs == 0 {
            return Err("insight_timeout_secs must be positive".to_string());
        }
        config.insight_timeout_secs = secs;
    }
    if let Some(model) = insight_model {
        config.insight_model = clean_text(&model, 100, "Model name")?;
    }
    if let Some(max) = max_open_challenges {
        config.max_open_challenges = max;
    }
    if let Some(enabled) = ai_opponents_enabled {
        config.ai_opponents_enabled = enabled;
    }

    log::info!("[CONFIG] insight_timeout_secs={} insight_model={} max_open_challenges={} ai_opponents_enabled={}",
        config.insight_timeout_secs, config.insight_model, config.max_open_challenges, config.ai_opponents_enabled);

    if ctx.db.game_config().id().find(&CONFIG_ROW_ID).is_some() {
        ctx.db.game_config().id().update(config);
    } else {
        ctx.db.game_config().insert(config);
    }
    Ok(())
}

/// Periodic sweep: AI progress, due resolutions, streak breaks,
/// insight timeouts and retention cleanup
#[reducer]
pub fn run_maintenance(ctx: &ReducerContext, _schedule: MaintenanceSchedule) {
    // Only allow scheduler to call this, not clients
    if ctx.sender != ctx.identity() {
        log::warn!("Client {} attempted to call run_maintenance", ctx.sender);
        return;
    }

    let now = ctx.timestamp;
    let config = get_config(ctx);

    // -------------------- AI opponents --------------------
    let ai_challenges: Vec<Challenge> = ctx.db.challenge()
        .iter()
        .filter(|c| c.status == ChallengeStatus::Active && c.ai_difficulty.is_some())
        .collect();
    for mut challenge in ai_challenges {
        if roll_ai_ticks(ctx, &mut challenge) > 0 {
            ctx.db.challenge().id().update(challenge);
        }
    }

    // -------------------- Resolutions --------------------
    let due: Vec<Challenge> = ctx.db.challenge()
        .iter()
        .filter(|c| resolution_due(c, now))
        .collect();
    for challenge in due {
        let challenge_id = challenge.id;
        if let Err(e) = finalize_challenge(ctx, challenge) {
            log::error!("[CHALLENGE] resolve failed challenge_id={} error={}", challenge_id, e);
        }
    }

    // -------------------- Streaks --------------------
    let streaking: Vec<UserAccount> = ctx.db.user_account()
        .iter()
        .filter(|a| a.current_streak > 0)
        .collect();
    for mut account in streaking {
        if reset_streak_if_broken(&mut account, now) {
            ctx.db.user_account().id().update(account);
        }
    }

    // -------------------- Insight queue --------------------
    let timeout_micros = config.insight_timeout_secs as i64 * 1_000_000;
    let retention_micros = RETENTION_DAYS * MICROS_PER_DAY;
    for mut request in ctx.db.insight_request().iter().collect::<Vec<_>>() {
        match request.state {
            InsightRequestState::Pending if micros_ago(now, request.created_at) > timeout_micros => {
                log::warn!("[SAGE] timed out request_id={} user={} after {}s",
                    request.id, short_id(&request.user_id), config.insight_timeout_secs);
                request.state = InsightRequestState::Failed;
                request.error = Some(format!("timed out after {}s", config.insight_timeout_secs));
                request.finished_at = Some(now);
                ctx.db.insight_request().id().update(request);
            }
            InsightRequestState::Completed | InsightRequestState::Failed => {
                let finished = request.finished_at.unwrap_or(request.created_at);
                if micros_ago(now, finished) > retention_micros {
                    ctx.db.insight_request().id().delete(&request.id);
                }
            }
            _ => {}
        }
    }

    // -------------------- Notifications --------------------
    let expired: Vec<u64> = ctx.db.challenge_event()
        .iter()
        .filter(|e| micros_ago(now, e.created_at) > retention_micros)
        .map(|e| e.id)
        .collect();
    if !expired.is_empty() {
        log::debug!("[MAINT] expired {} challenge events", expired.len());
    }
    for id in expired {
        ctx.db.challenge_event().id().delete(&id);
    }
}

/// Initialize module - authorize the owner, seed config, schedule the sweep
#[reducer(init)]
pub fn init(ctx: &ReducerContext) {
    // In init, ctx.sender is the module owner identity
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        ctx.db.authorized_worker().insert(AuthorizedWorker {
            identity: ctx.sender,
        });
    }

    if ctx.db.game_config().id().find(&CONFIG_ROW_ID).is_none() {
        ctx.db.game_config().insert(GameConfig::default());
    }

    // Check if scheduler already exists to avoid duplicates on hot-reload
    if ctx.db.maintenance_schedule().iter().count() == 0 {
        ctx.db.maintenance_schedule().insert(MaintenanceSchedule {
            id: 0, // auto_inc will handle this
            scheduled_at: ScheduleAt::Interval(std::time::Duration::from_secs(MAINTENANCE_INTERVAL_SECS).into()),
        });
    }

    log::info!("Habit quest module initialized successfully");
}
