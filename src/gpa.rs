// GPA Engine - credit-weighted average of graded entries

use crate::grade_scale::grade_points;
use crate::records::EntryRecord;
use serde::Serialize;

/// GPA together with the credits it was computed over.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GpaSummary {
    pub gpa: f64,
    pub total_credits: f64,
}

/// `Σ points·credit / Σ credit`, or 0.0 when the credit sum is exactly zero.
pub fn compute(entries: &[EntryRecord]) -> f64 {
    summarize(entries).gpa
}

/// Sum of credit values.
pub fn total_credits(entries: &[EntryRecord]) -> f64 {
    entries.iter().map(|e| e.credit_value).sum()
}

pub fn summarize(entries: &[EntryRecord]) -> GpaSummary {
    let mut quality_points = 0.0;
    let mut credits = 0.0;

    for entry in entries {
        quality_points += grade_points(&entry.grade) * entry.credit_value;
        credits += entry.credit_value;
    }

    // Empty input lands here too
    let gpa = if credits == 0.0 {
        0.0
    } else {
        quality_points / credits
    };

    GpaSummary {
        gpa,
        total_credits: credits,
    }
}
