// Grade Scale - letter grade → grade points
//
// Fixed table, case-sensitive after trimming surrounding whitespace.
// Anything not in the table (absent, empty, "a+", "E", ...) is worth 0.0.

/// Every recognised grade with its point value, best first.
pub const GRADES: [(&str, f64); 12] = [
    ("A+", 4.00),
    ("A", 3.75),
    ("A-", 3.50),
    ("B+", 3.25),
    ("B", 3.00),
    ("B-", 2.75),
    ("C+", 2.50),
    ("C", 2.25),
    ("C-", 2.00),
    ("D+", 1.75),
    ("D", 1.50),
    ("F", 0.00),
];

/// Points for a possibly-absent grade. Never fails.
pub fn points_for(grade: Option<&str>) -> f64 {
    grade.map(grade_points).unwrap_or(0.0)
}

/// Points for a grade string. Unknown grades are worth 0.0.
pub fn grade_points(grade: &str) -> f64 {
    let grade = grade.trim();
    GRADES
        .iter()
        .find(|(letter, _)| *letter == grade)
        .map_or(0.0, |(_, points)| *points)
}

/// True if the trimmed grade is one of [`GRADES`].
///
/// `F` is known even though it is worth nothing, which is why callers can't
/// just test `grade_points(..) > 0.0`.
pub fn is_known_grade(grade: &str) -> bool {
    let grade = grade.trim();
    GRADES.iter().any(|(letter, _)| *letter == grade)
}
