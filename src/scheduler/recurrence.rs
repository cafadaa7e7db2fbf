//! Recurrence rules — cron-expression parsing for recurring tasks.

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::ValidationError;

/// Validate a recurrence pattern at submission time.
pub fn validate_pattern(pattern: &str) -> Result<(), ValidationError> {
    cron::Schedule::from_str(pattern)
        .map(|_| ())
        .map_err(|e| ValidationError::InvalidRecurrence {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}

/// Next fire time strictly after `after`, or None for a pattern with no
/// future occurrences.
pub fn next_occurrence(
    pattern: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    let schedule =
        cron::Schedule::from_str(pattern).map_err(|e| ValidationError::InvalidRecurrence {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;

    Ok(schedule.after(&after).next())
}
