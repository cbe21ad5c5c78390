// Records - what gets persisted
//
// SummaryRecord: one saved GPA calculation (the parent row)
// EntryRecord:   one graded course belonging to exactly one summary (child row)

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp layout used for `created_at` (local time, second precision).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ============================================================================
// SUMMARY RECORD
// ============================================================================

/// A saved GPA result.
///
/// `id` is `None` until storage assigns one; after that it never changes.
/// `children` is lazily populated and stays empty unless explicitly loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    pub gpa: f64,

    pub total_credits: f64,

    /// Set once when the record is created, see [`TIMESTAMP_FORMAT`].
    pub created_at: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<EntryRecord>,
}

impl SummaryRecord {
    /// Create a transient (unsaved) summary stamped with the current local time.
    pub fn new(gpa: f64, total_credits: f64) -> Self {
        Self {
            id: None,
            gpa,
            total_credits,
            created_at: now_timestamp(),
            children: Vec::new(),
        }
    }

    /// Rebuild a persisted summary from stored columns.
    pub fn persisted(id: i64, gpa: f64, total_credits: f64, created_at: String) -> Self {
        Self {
            id: Some(id),
            gpa,
            total_credits,
            created_at,
            children: Vec::new(),
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    /// True if this record carries the given storage id.
    pub fn has_id(&self, id: i64) -> bool {
        self.id == Some(id)
    }

    /// Copy of this record with the children list replaced.
    pub fn with_children(mut self, children: Vec<EntryRecord>) -> Self {
        self.children = children;
        self
    }
}

impl fmt::Display for SummaryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GPA {:.2} over {:.1} credits ({})",
            self.gpa, self.total_credits, self.created_at
        )
    }
}

/// Current local time in [`TIMESTAMP_FORMAT`].
pub fn now_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

// ============================================================================
// ENTRY RECORD
// ============================================================================

/// One graded course. Immutable value data.
///
/// Field names double as CSV headers for the CLI course import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub name: String,

    /// Expected shape: no whitespace, ends in exactly four digits (e.g. "CSE1101").
    /// Not enforced here; see [`EntryRecord::has_well_formed_code`].
    pub code: String,

    #[serde(rename = "credit")]
    pub credit_value: f64,

    #[serde(rename = "teacher1", default, deserialize_with = "empty_as_none")]
    pub instructor_primary: Option<String>,

    #[serde(rename = "teacher2", default, deserialize_with = "empty_as_none")]
    pub instructor_secondary: Option<String>,

    pub grade: String,
}

impl EntryRecord {
    pub fn new(name: &str, code: &str, credit_value: f64, grade: &str) -> Self {
        Self {
            name: name.to_string(),
            code: code.to_string(),
            credit_value,
            instructor_primary: None,
            instructor_secondary: None,
            grade: grade.to_string(),
        }
    }

    pub fn with_instructors(mut self, primary: Option<&str>, secondary: Option<&str>) -> Self {
        self.instructor_primary = primary.map(str::to_string);
        self.instructor_secondary = secondary.map(str::to_string);
        self
    }

    /// No embedded whitespace and exactly four trailing digits, so "CSE2201"
    /// passes while "CSE22011" (five trailing digits) does not. Only used to
    /// warn; nothing in the core rejects a malformed code.
    pub fn has_well_formed_code(&self) -> bool {
        let code = self.code.as_str();
        if code.is_empty() || code.chars().any(char::is_whitespace) {
            return false;
        }

        let trailing_digits = code.chars().rev().take_while(|c| c.is_ascii_digit()).count();
        trailing_digits == 4
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}
