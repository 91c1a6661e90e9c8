// AI Sage insight requests
//
// Builds the activity summary that goes into the text-generation prompt and
// parses the model's reply. The HTTP call itself happens in the worker that
// drains `insight_request`; this module only deals with text in and out.

use std::collections::HashMap;

use chrono::Weekday;
use serde_json::{json, Value};
use thiserror::Error;

use crate::calendar::{local_hour, weekday_label, weekday_of_day, TimeOfDay};
use crate::{Habit, HabitCompletion, UserAccount};

/// Word limits the prompt asks the model to respect
pub const INSIGHT_MAX_WORDS: usize = 30;
pub const SUGGESTED_HABIT_MAX_WORDS: usize = 15;

const MISSED_WEEKDAYS_SHOWN: usize = 3;

#[derive(Debug, Error, PartialEq)]
pub enum InsightError {
    #[error("model reply contains no JSON object")]
    NoJsonObject,
    #[error("model reply JSON is invalid: {0}")]
    InvalidJson(String),
    #[error("model reply is missing string field `{0}`")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HabitStat {
    pub name: String,
    pub category: String,
    pub success_rate_pct: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsightSummary {
    pub display_name: String,
    pub persona: Vec<String>,
    pub level: u32,
    pub total_xp: u64,
    pub habits: Vec<HabitStat>,
    pub current_streak: u32,
    pub longest_streak: u32,
    /// Completions per bucket, in Morning/Afternoon/Evening/Night order
    pub time_of_day: Vec<(TimeOfDay, u32)>,
    pub most_missed_weekdays: Vec<Weekday>,
    pub challenges_won: u32,
    pub challenges_lost: u32,
}

impl InsightSummary {
    /// Bucket with the most completions; None without any completions
    pub fn preferred_time_of_day(&self) -> Option<TimeOfDay> {
        self.time_of_day
            .iter()
            .filter(|(_, count)| *count > 0)
            // first bucket wins ties
            .fold(None, |best: Option<(TimeOfDay, u32)>, &(bucket, count)| match best {
                Some((_, best_count)) if best_count >= count => best,
                _ => Some((bucket, count)),
            })
            .map(|(bucket, _)| bucket)
    }
}

/// Parsed model reply
#[derive(Debug, Clone, PartialEq)]
pub struct SageReply {
    pub insight: String,
    pub suggested_habit: String,
}

pub fn success_rate_pct(completed: u32, total_records: u32) -> u32 {
    if total_records == 0 {
        return 0;
    }
    ((completed as f64 / total_records as f64) * 100.0).round() as u32
}

pub fn time_of_day_rollup(hours: impl IntoIterator<Item = u32>) -> Vec<(TimeOfDay, u32)> {
    let mut counts = [
        (TimeOfDay::Morning, 0u32),
        (TimeOfDay::Afternoon, 0),
        (TimeOfDay::Evening, 0),
        (TimeOfDay::Night, 0),
    ];
    for hour in hours {
        let bucket = TimeOfDay::from_hour(hour);
        if let Some(slot) = counts.iter_mut().find(|(b, _)| *b == bucket) {
            slot.1 += 1;
        }
    }
    counts.to_vec()
}

/// Up to three weekdays with the most missed records, most missed first.
/// Ties keep Monday-first order.
pub fn most_missed_weekdays(missed_days: impl IntoIterator<Item = i32>) -> Vec<Weekday> {
    let mut counts: HashMap<Weekday, u32> = HashMap::new();
    for day in missed_days {
        if let Some(weekday) = weekday_of_day(day) {
            *counts.entry(weekday).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(Weekday, u32)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| {
        b.1.cmp(&a.1)
            .then(a.0.num_days_from_monday().cmp(&b.0.num_days_from_monday()))
    });
    ranked.into_iter().take(MISSED_WEEKDAYS_SHOWN).map(|(d, _)| d).collect()
}

/// Summarize one user's activity from their rows
pub fn summarize(account: &UserAccount, habits: &[Habit], completions: &[HabitCompletion]) -> InsightSummary {
    let habit_stats = habits
        .iter()
        .map(|habit| {
            let records: Vec<&HabitCompletion> =
                completions.iter().filter(|c| c.habit_id == habit.id).collect();
            let completed = records.iter().filter(|c| c.completed).count() as u32;
            HabitStat {
                name: habit.name.clone(),
                category: habit.category.clone(),
                success_rate_pct: success_rate_pct(completed, records.len() as u32),
            }
        })
        .collect();

    let time_of_day = time_of_day_rollup(
        completions
            .iter()
            .filter(|c| c.completed)
            .filter_map(|c| local_hour(c.recorded_at, account.utc_offset_minutes)),
    );

    let most_missed = most_missed_weekdays(completions.iter().filter(|c| !c.completed).map(|c| c.day));

    InsightSummary {
        display_name: account.display_name.clone(),
        persona: account.persona.clone(),
        level: account.level,
        total_xp: account.total_xp,
        habits: habit_stats,
        current_streak: account.current_streak,
        longest_streak: account.longest_streak,
        time_of_day,
        most_missed_weekdays: most_missed,
        challenges_won: account.challenges_won,
        challenges_lost: account.challenges_lost,
    }
}

pub fn summary_payload(summary: &InsightSummary) -> Value {
    let time_of_day: serde_json::Map<String, Value> = summary
        .time_of_day
        .iter()
        .map(|(bucket, count)| (bucket.label().to_string(), json!(count)))
        .collect();

    json!({
        "name": summary.display_name,
        "persona": summary.persona,
        "level": summary.level,
        "totalXP": summary.total_xp,
        "habits": summary.habits.iter().map(|h| json!({
            "name": h.name,
            "category": h.category,
            "successRate": h.success_rate_pct,
        })).collect::<Vec<_>>(),
        "currentStreak": summary.current_streak,
        "longestStreak": summary.longest_streak,
        "completionsByTimeOfDay": time_of_day,
        "preferredTimeOfDay": summary.preferred_time_of_day().map(|t| t.label()),
        "mostMissedDays": summary.most_missed_weekdays.iter().map(|d| weekday_label(*d)).collect::<Vec<_>>(),
        "challengesWon": summary.challenges_won,
        "challengesLost": summary.challenges_lost,
    })
}

pub fn build_prompt(summary: &InsightSummary) -> String {
    format!(
        "You are the Sage, a wise and encouraging habit coach in a fantasy-themed habit tracker.\n\
         Study this player's activity and give one personal, actionable insight.\n\n\
         Player activity (JSON):\n{}\n\n\
         Reply with ONLY a JSON object of the form \
         {{\"insight\": \"...\", \"suggested_habit\": \"...\"}}.\n\
         \"insight\" must be at most {} words. \"suggested_habit\" must be at most {} words \
         and name one new habit that fits the player's persona and gaps.",
        summary_payload(summary),
        INSIGHT_MAX_WORDS,
        SUGGESTED_HABIT_MAX_WORDS,
    )
}

/// First balanced `{...}` in `raw`, ignoring braces inside JSON strings
pub fn extract_first_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in raw[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn truncate_words(text: &str, max_words: usize) -> String {
    text.split_whitespace().take(max_words).collect::<Vec<_>>().join(" ")
}

fn string_field(obj: &Value, name: &'static str) -> Result<String, InsightError> {
    obj.get(name)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(InsightError::MissingField(name))
}

pub fn parse_insight_reply(raw: &str) -> Result<SageReply, InsightError> {
    let object = extract_first_json_object(raw).ok_or(InsightError::NoJsonObject)?;
    let value: Value =
        serde_json::from_str(object).map_err(|e| InsightError::InvalidJson(e.to_string()))?;

    let insight = string_field(&value, "insight")?;
    let suggested_habit = string_field(&value, "suggested_habit")?;

    Ok(SageReply {
        insight: truncate_words(&insight, INSIGHT_MAX_WORDS),
        suggested_habit: truncate_words(&suggested_habit, SUGGESTED_HABIT_MAX_WORDS),
    })
}
