use chrono::{Days, NaiveDate};
use serde_json::{Value, json};

const DATE_FORMAT: &str = "%Y-%m-%d";

fn completed_dates(completions: &Value) -> Vec<NaiveDate> {
    completions
        .as_array()
        .map(|records| {
            records
                .iter()
                .filter(|r| r.get("completed").and_then(Value::as_bool).unwrap_or(true))
                .filter_map(|r| r.get("date").and_then(Value::as_str))
                .filter_map(|d| NaiveDate::parse_from_str(d, DATE_FORMAT).ok())
                .collect()
        })
        .unwrap_or_default()
}

pub fn is_completed(completions: &Value, date: NaiveDate) -> bool {
    completed_dates(completions).contains(&date)
}

pub fn toggle_completion(completions: &Value, date: NaiveDate) -> Value {
    let day = date.format(DATE_FORMAT).to_string();
    let mut records = completions.as_array().cloned().unwrap_or_default();

    if is_completed(completions, date) {
        records.retain(|r| r.get("date").and_then(Value::as_str) != Some(day.as_str()));
    } else {
        records.push(json!({ "date": day, "completed": true }));
    }
    Value::Array(records)
}

/// Consecutive completed days ending today, or ending yesterday when today
/// is not done yet. Anything older breaks the streak.
pub fn current_streak(completions: &Value, today: NaiveDate) -> u32 {
    let dates = completed_dates(completions);
    let mut cursor = if dates.contains(&today) {
        today
    } else {
        match today.checked_sub_days(Days::new(1)) {
            Some(yesterday) if dates.contains(&yesterday) => yesterday,
            _ => return 0,
        }
    };

    let mut streak = 0;
    while dates.contains(&cursor) {
        streak += 1;
        match cursor.checked_sub_days(Days::new(1)) {
            Some(prev) => cursor = prev,
            None => break,
        }
    }
    streak
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).expect("date")
    }

    #[test]
    fn toggle_adds_then_removes() {
        let empty = json!([]);
        let once = toggle_completion(&empty, day("2025-03-01"));
        assert_eq!(once, json!([{ "date": "2025-03-01", "completed": true }]));

        let twice = toggle_completion(&once, day("2025-03-01"));
        assert_eq!(twice, json!([]));
    }

    #[test]
    fn streak_counts_back_from_today() {
        let completions = json!([
            { "date": "2025-03-01", "completed": true },
            { "date": "2025-03-03", "completed": true },
            { "date": "2025-03-04", "completed": true },
            { "date": "2025-03-05", "completed": true },
        ]);
        assert_eq!(current_streak(&completions, day("2025-03-05")), 3);
        // today not done yet keeps yesterday's run alive
        assert_eq!(current_streak(&completions, day("2025-03-06")), 3);
        assert_eq!(current_streak(&completions, day("2025-03-07")), 0);
    }

    #[test]
    fn streak_ignores_garbage_records() {
        let completions = json!([
            { "date": "not a date" },
            { "date": "2025-03-05", "completed": false },
            "2025-03-05",
        ]);
        assert_eq!(current_streak(&completions, day("2025-03-05")), 0);
        assert_eq!(current_streak(&Value::Null, day("2025-03-05")), 0);
    }
}
