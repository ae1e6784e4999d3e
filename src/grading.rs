use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

pub const PASS_MARK: f64 = 40.0;
pub const MAX_MARKS: f64 = 100.0;

/// Which scale a mark is graded on. Backlog attempts share the regular
/// bands but can never score above B+.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradePolicy {
    Regular,
    Backlog,
}

impl GradePolicy {
    pub fn for_attempt(is_backlog: bool) -> Self {
        if is_backlog {
            GradePolicy::Backlog
        } else {
            GradePolicy::Regular
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grade {
    pub grade: &'static str,
    pub grade_point: f64,
}

const FAIL: Grade = Grade {
    grade: "F",
    grade_point: 0.0,
};

/// Inclusive lower bound per band, highest first.
const GRADE_BANDS: [(f64, Grade); 9] = [
    (80.0, Grade { grade: "A+", grade_point: 4.00 }),
    (75.0, Grade { grade: "A", grade_point: 3.75 }),
    (70.0, Grade { grade: "A-", grade_point: 3.50 }),
    (65.0, Grade { grade: "B+", grade_point: 3.25 }),
    (60.0, Grade { grade: "B", grade_point: 3.00 }),
    (55.0, Grade { grade: "B-", grade_point: 2.75 }),
    (50.0, Grade { grade: "C+", grade_point: 2.50 }),
    (45.0, Grade { grade: "C", grade_point: 2.25 }),
    (PASS_MARK, Grade { grade: "D", grade_point: 2.00 }),
];

const BACKLOG_CEILING: Grade = Grade {
    grade: "B+",
    grade_point: 3.25,
};

/// Marks are expected in `[0, 100]`; callers validate with [`validate_marks`]
/// before anything is stored.
pub fn grade_of(marks: f64, policy: GradePolicy) -> Grade {
    let grade = GRADE_BANDS
        .iter()
        .find(|(min, _)| marks >= *min)
        .map(|(_, g)| *g)
        .unwrap_or(FAIL);

    match policy {
        GradePolicy::Backlog if grade.grade_point > BACKLOG_CEILING.grade_point => BACKLOG_CEILING,
        _ => grade,
    }
}

pub fn is_pass(marks: f64) -> bool {
    marks >= PASS_MARK
}

pub fn validate_marks(marks: f64) -> CoreResult<f64> {
    if !marks.is_finite() || !(0.0..=MAX_MARKS).contains(&marks) {
        return Err(CoreError::validation(format!(
            "marks must be between 0 and {MAX_MARKS}"
        )));
    }
    Ok(marks)
}

pub fn round_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpaEntry {
    pub marks: f64,
    pub credits: f64,
    pub is_backlog: bool,
}

/// Credit-weighted grade point over the passed entries of one semester.
/// Failing entries count toward neither the numerator nor the denominator.
pub fn semester_gpa<I>(entries: I) -> f64
where
    I: IntoIterator<Item = GpaEntry>,
{
    let mut weighted: f64 = 0.0;
    let mut credits: f64 = 0.0;

    for e in entries {
        let g = grade_of(e.marks, GradePolicy::for_attempt(e.is_backlog));
        if g.grade_point == 0.0 {
            continue;
        }
        weighted += g.grade_point * e.credits;
        credits += e.credits;
    }

    if credits > 0.0 {
        round_2_decimals(weighted / credits)
    } else {
        0.0
    }
}

/// Plain mean of semester SGPAs; every semester counts equally regardless of
/// its credit load.
pub fn overall_cgpa(semester_sgpas: &[f64]) -> f64 {
    if semester_sgpas.is_empty() {
        return 0.0;
    }
    let sum: f64 = semester_sgpas.iter().sum();
    round_2_decimals(sum / semester_sgpas.len() as f64)
}
