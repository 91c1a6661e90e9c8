// Bulk import reducers for migrating exported documents
// Accept JSON arrays exported from the old document store (camelCase keys)

use spacetimedb::{reducer, ReducerContext, Timestamp, log, Table};
use crate::{UserAccount, Habit, HabitCompletion, HabitFrequency, HabitDifficulty, authorized_worker};
use crate::{user_account, habit, habit_completion, MAX_CUSTOM_XP};
use crate::calendar::{clamp_utc_offset, parse_day};
use crate::leveling::level_for_total_xp;
use serde_json::Value;

/// Accepts SDK JSON ({"__timestamp_micros_since_unix_epoch__": "123"}),
/// plain epoch milliseconds, or an ISO-8601 string
fn parse_timestamp_json(val: &Value) -> Result<Timestamp, String> {
    if let Some(micros) = val.get("__timestamp_micros_since_unix_epoch__") {
        let micros: i64 = match micros {
            Value::String(s) => s.parse().map_err(|e| format!("Invalid timestamp micros: {}", e))?,
            other => other.as_i64().ok_or("Invalid timestamp micros")?,
        };
        return Ok(Timestamp::from_micros_since_unix_epoch(micros));
    }
    if let Some(millis) = val.as_i64() {
        let micros = millis.checked_mul(1000).ok_or(format!("Timestamp {} ms out of range", millis))?;
        return Ok(Timestamp::from_micros_since_unix_epoch(micros));
    }
    if let Some(s) = val.as_str() {
        let dt = chrono::DateTime::parse_from_rfc3339(s)
            .map_err(|e| format!("Invalid timestamp '{}': {}", s, e))?;
        return Ok(Timestamp::from_micros_since_unix_epoch(dt.timestamp_micros()));
    }
    Err("Missing or invalid timestamp field".to_string())
}

fn parse_frequency(val: Option<&Value>) -> Result<HabitFrequency, String> {
    match val.and_then(|v| v.as_str()).unwrap_or("daily") {
        "daily" => Ok(HabitFrequency::Daily),
        "weekly" => Ok(HabitFrequency::Weekly),
        "monthly" => Ok(HabitFrequency::Monthly),
        other => Err(format!("Unknown frequency '{}'", other)),
    }
}

fn parse_difficulty(val: Option<&Value>) -> Result<HabitDifficulty, String> {
    match val.and_then(|v| v.as_str()).unwrap_or("medium") {
        "easy" => Ok(HabitDifficulty::Easy),
        "medium" => Ok(HabitDifficulty::Medium),
        "hard" => Ok(HabitDifficulty::Hard),
        other => Err(format!("Unknown difficulty '{}'", other)),
    }
}

/// Exported reward is kept as-is (it was fixed at creation), within the custom XP range
fn parse_xp_reward(val: Option<&Value>, difficulty: HabitDifficulty) -> Result<u32, String> {
    let Some(val) = val.filter(|v| !v.is_null()) else {
        return Ok(difficulty.xp_reward());
    };
    let xp = val.as_u64().ok_or(format!("Invalid xpReward {}", val))?;
    match u32::try_from(xp) {
        Ok(xp) if (1..=MAX_CUSTOM_XP).contains(&xp) => Ok(xp),
        _ => Err(format!("xpReward {} outside 1..={}", xp, MAX_CUSTOM_XP)),
    }
}

/// Completion records as (day, completed). One entry per date; a completed
/// record wins over a missed one for the same date.
fn parse_completions(val: Option<&Value>) -> Result<Vec<(i32, bool)>, String> {
    let Some(records) = val.and_then(|v| v.as_array()) else {
        return Ok(Vec::new());
    };

    let mut days: Vec<(i32, bool)> = Vec::with_capacity(records.len());
    for (i, r) in records.iter().enumerate() {
        let date = r.get("date").and_then(|v| v.as_str())
            .ok_or(format!("Completion {}: missing date", i))?;
        let day = parse_day(date).ok_or(format!("Completion {}: invalid date '{}'", i, date))?;
        let completed = r.get("completed").and_then(|v| v.as_bool()).unwrap_or(true);

        match days.iter_mut().find(|(d, _)| *d == day) {
            Some(existing) => existing.1 |= completed,
            None => days.push((day, completed)),
        }
    }
    days.sort_by_key(|(d, _)| *d);
    Ok(days)
}

fn parse_persona(val: Option<&Value>) -> Vec<String> {
    val.and_then(|v| v.as_array())
        .map(|traits| traits.iter().filter_map(|t| t.as_str()).map(|s| s.to_string()).collect())
        .unwrap_or_default()
}

fn parse_account(i: usize, a: &Value, now: Timestamp) -> Result<UserAccount, String> {
    let total_xp = a.get("totalXP").and_then(|v| v.as_u64()).ok_or(format!("Account {}: missing totalXP", i))?;
    let created_at = a.get("createdAt").map(parse_timestamp_json).transpose()?.unwrap_or(now);
    let last_completion_day = a.get("lastCompletionDate")
        .and_then(|v| v.as_str())
        .and_then(parse_day);

    Ok(UserAccount {
        id: a.get("id").and_then(|v| v.as_str()).ok_or(format!("Account {}: missing id", i))?.to_string(),
        display_name: a.get("displayName").and_then(|v| v.as_str()).ok_or(format!("Account {}: missing displayName", i))?.to_string(),
        total_xp,
        // Stored level is ignored
        level: level_for_total_xp(total_xp),
        current_streak: a.get("currentStreak").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        longest_streak: a.get("longestStreak").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        last_completion_day,
        persona: parse_persona(a.get("persona")),
        utc_offset_minutes: clamp_utc_offset(a.get("utcOffsetMinutes").and_then(|v| v.as_i64()).unwrap_or(0) as i32),
        challenges_won: a.get("challengesWon").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        challenges_lost: a.get("challengesLost").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        challenges_tied: a.get("challengesTied").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        created_at,
        last_seen: created_at,
    })
}

/// Bulk restore user_account table from JSON array
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn bulk_restore_user_account(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized bulk_restore_user_account attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let data: Value = serde_json::from_str(&json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;

    let accounts = data.as_array()
        .ok_or("Expected JSON array of user accounts")?;

    let mut inserted = 0;
    let mut replaced = 0;
    for (i, a) in accounts.iter().enumerate() {
        let account = parse_account(i, a, ctx.timestamp)?;
        if ctx.db.user_account().id().find(&account.id).is_some() {
            ctx.db.user_account().id().update(account);
            replaced += 1;
        } else {
            ctx.db.user_account().insert(account);
            inserted += 1;
        }
    }

    log::info!("[RESTORE] user_account inserted={} replaced={}", inserted, replaced);
    Ok(())
}

/// Bulk restore habit table (with embedded completion records) from JSON array
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn bulk_restore_habit(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized bulk_restore_habit attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let data: Value = serde_json::from_str(&json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;

    let habits = data.as_array()
        .ok_or("Expected JSON array of habits")?;

    let mut habit_count = 0;
    let mut record_count = 0;
    for (i, h) in habits.iter().enumerate() {
        let user_id = h.get("userId").and_then(|v| v.as_str()).ok_or(format!("Habit {}: missing userId", i))?.to_string();
        if ctx.db.user_account().id().find(&user_id).is_none() {
            return Err(format!("Habit {}: unknown user {} (restore accounts first)", i, user_id));
        }

        let difficulty = parse_difficulty(h.get("difficulty")).map_err(|e| format!("Habit {}: {}", i, e))?;
        let created_at = h.get("createdAt").map(parse_timestamp_json).transpose()?.unwrap_or(ctx.timestamp);
        let completions = parse_completions(h.get("completions")).map_err(|e| format!("Habit {}: {}", i, e))?;

        let habit = ctx.db.habit().insert(Habit {
            id: 0, // auto_inc
            user_id: user_id.clone(),
            name: h.get("name").and_then(|v| v.as_str()).ok_or(format!("Habit {}: missing name", i))?.to_string(),
            category: h.get("category").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            frequency: parse_frequency(h.get("frequency")).map_err(|e| format!("Habit {}: {}", i, e))?,
            difficulty,
            xp_reward: parse_xp_reward(h.get("xpReward"), difficulty).map_err(|e| format!("Habit {}: {}", i, e))?,
            created_at,
        });

        for (day, completed) in completions {
            ctx.db.habit_completion().insert(HabitCompletion {
                id: 0, // auto_inc
                habit_id: habit.id,
                user_id: user_id.clone(),
                day,
                completed,
                recorded_at: created_at,
            });
            record_count += 1;
        }
        habit_count += 1;
    }

    log::info!("[RESTORE] habit habits={} completion_records={}", habit_count, record_count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_timestamp_formats() {
        let sdk = json!({"__timestamp_micros_since_unix_epoch__": "1710037800000000"});
        assert_eq!(parse_timestamp_json(&sdk).unwrap().to_micros_since_unix_epoch(), 1_710_037_800_000_000);

        let millis = json!(1_710_037_800_000i64);
        assert_eq!(parse_timestamp_json(&millis).unwrap().to_micros_since_unix_epoch(), 1_710_037_800_000_000);

        let iso = json!("2024-03-10T02:30:00Z");
        assert_eq!(parse_timestamp_json(&iso).unwrap().to_micros_since_unix_epoch(), 1_710_037_800_000_000);

        assert!(parse_timestamp_json(&json!(true)).is_err());
        assert!(parse_timestamp_json(&json!(i64::MAX)).is_err());
    }

    #[test]
    fn test_completions_deduplicated_per_date() {
        let records = json!([
            {"date": "2024-03-11", "completed": false},
            {"date": "2024-03-10", "completed": true},
            {"date": "2024-03-11", "completed": true},
            {"date": "2024-03-10", "completed": false},
        ]);
        let days = parse_completions(Some(&records)).unwrap();
        assert_eq!(days, vec![(19_792, true), (19_793, true)]);
    }

    #[test]
    fn test_completions_reject_bad_dates() {
        let records = json!([{"date": "March 10th", "completed": true}]);
        assert!(parse_completions(Some(&records)).is_err());
        assert_eq!(parse_completions(None).unwrap(), vec![]);
    }

    #[test]
    fn test_xp_reward_bounds() {
        assert_eq!(parse_xp_reward(None, HabitDifficulty::Hard), Ok(20));
        assert_eq!(parse_xp_reward(Some(&Value::Null), HabitDifficulty::Easy), Ok(5));
        assert_eq!(parse_xp_reward(Some(&json!(42)), HabitDifficulty::Easy), Ok(42));
        assert!(parse_xp_reward(Some(&json!(0)), HabitDifficulty::Easy).is_err());
        assert!(parse_xp_reward(Some(&json!(MAX_CUSTOM_XP + 1)), HabitDifficulty::Easy).is_err());
        assert!(parse_xp_reward(Some(&json!(4_294_967_306u64)), HabitDifficulty::Easy).is_err());
        assert!(parse_xp_reward(Some(&json!(-5)), HabitDifficulty::Easy).is_err());
    }

    #[test]
    fn test_enum_defaults() {
        assert_eq!(parse_frequency(None), Ok(HabitFrequency::Daily));
        assert_eq!(parse_difficulty(Some(&json!("hard"))), Ok(HabitDifficulty::Hard));
        assert!(parse_difficulty(Some(&json!("brutal"))).is_err());
    }

    #[test]
    fn test_account_level_recomputed() {
        let now = Timestamp::from_micros_since_unix_epoch(0);
        let exported = json!({
            "id": "user-123456789",
            "displayName": "Sam",
            "totalXP": 400,
            "level": 9,
            "persona": ["night owl", 3],
        });
        let account = parse_account(0, &exported, now).unwrap();
        assert_eq!(account.level, 2);
        assert_eq!(account.persona, vec!["night owl".to_string()]);
        assert_eq!(account.current_streak, 0);
        assert_eq!(account.last_completion_day, None);

        let missing = json!({"id": "x", "displayName": "Sam"});
        assert!(parse_account(0, &missing, now).is_err());
    }
}
