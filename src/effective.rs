//! Picks the one result per course that every aggregate is computed from.
//!
//! The regular attempt stands unless a backlog attempt scored strictly
//! higher. Equal marks keep whichever entry was already chosen, so backlog
//! attempts are considered in the order they were recorded.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::grading::{self, Grade, GradePolicy};
use crate::results::ResultRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Regular,
    Backlog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResultStatus {
    Passed,
    Failed,
    Cleared,
    #[serde(rename = "Failed Again")]
    FailedAgain,
}

#[derive(Debug, Clone, Serialize)]
pub struct EffectiveResult {
    pub result: ResultRecord,
    pub source: ResultSource,
    pub status: ResultStatus,
    /// Attempts recorded for the course, this one included.
    pub attempts: usize,
}

impl EffectiveResult {
    fn new(result: ResultRecord) -> Self {
        let passed = grading::is_pass(result.marks);
        let (source, status) = match (result.is_backlog, passed) {
            (false, true) => (ResultSource::Regular, ResultStatus::Passed),
            (false, false) => (ResultSource::Regular, ResultStatus::Failed),
            (true, true) => (ResultSource::Backlog, ResultStatus::Cleared),
            (true, false) => (ResultSource::Backlog, ResultStatus::FailedAgain),
        };
        EffectiveResult {
            result,
            source,
            status,
            attempts: 0,
        }
    }

    pub fn policy(&self) -> GradePolicy {
        GradePolicy::for_attempt(self.result.is_backlog)
    }

    pub fn grade(&self) -> Grade {
        grading::grade_of(self.result.marks, self.policy())
    }
}

/// Resolves one effective result per `course_id`.
///
/// Filtering (published only, one student) is up to the caller.
pub fn resolve<I>(all: I) -> BTreeMap<i64, EffectiveResult>
where
    I: IntoIterator<Item = ResultRecord>,
{
    let mut attempts: HashMap<i64, usize> = HashMap::new();
    let mut regular = Vec::new();
    let mut backlog = Vec::new();
    for r in all {
        *attempts.entry(r.course_id).or_default() += 1;
        if r.is_backlog {
            backlog.push(r);
        } else {
            regular.push(r);
        }
    }
    backlog.sort_by_key(|r| r.id);

    let mut out: BTreeMap<i64, EffectiveResult> = BTreeMap::new();
    for r in regular {
        out.insert(r.course_id, EffectiveResult::new(r));
    }
    for r in backlog {
        let replace = match out.get(&r.course_id) {
            None => true,
            Some(current) => r.marks > current.result.marks,
        };
        if replace {
            out.insert(r.course_id, EffectiveResult::new(r));
        }
    }

    for (course_id, eff) in out.iter_mut() {
        eff.attempts = attempts.get(course_id).copied().unwrap_or(1);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: i64, course_id: i64, marks: f64, group: Option<i64>) -> ResultRecord {
        ResultRecord {
            id,
            student_id: 1,
            course_id,
            marks,
            published: true,
            is_backlog: group.is_some(),
            backlog_group_id: group,
            created_at: String::new(),
        }
    }

    #[test]
    fn higher_backlog_supersedes_failed_regular() {
        let out = resolve(vec![result(1, 10, 30.0, None), result(2, 10, 45.0, Some(1))]);
        let eff = &out[&10];
        assert_eq!(eff.result.id, 2);
        assert_eq!(eff.source, ResultSource::Backlog);
        assert_eq!(eff.status, ResultStatus::Cleared);
        assert_eq!(eff.attempts, 2);
        assert_eq!(eff.grade().grade, "C");
    }

    #[test]
    fn lower_backlog_leaves_regular_authoritative() {
        let out = resolve(vec![result(1, 10, 35.0, None), result(2, 10, 30.0, Some(1))]);
        let eff = &out[&10];
        assert_eq!(eff.result.id, 1);
        assert_eq!(eff.source, ResultSource::Regular);
        assert_eq!(eff.status, ResultStatus::Failed);
    }

    #[test]
    fn equal_marks_keep_existing_entry() {
        let out = resolve(vec![
            result(1, 10, 35.0, None),
            result(2, 10, 35.0, Some(1)),
            result(3, 10, 38.0, Some(2)),
            result(4, 10, 38.0, Some(3)),
        ]);
        let eff = &out[&10];
        assert_eq!(eff.result.id, 3);
        assert_eq!(eff.status, ResultStatus::FailedAgain);
        assert_eq!(eff.attempts, 4);
    }

    #[test]
    fn backlog_order_follows_insertion_not_input_order() {
        let out = resolve(vec![
            result(4, 10, 38.0, Some(3)),
            result(1, 10, 20.0, None),
            result(3, 10, 38.0, Some(2)),
        ]);
        assert_eq!(out[&10].result.id, 3);
    }

    #[test]
    fn backlog_without_regular_is_taken() {
        let out = resolve(vec![result(5, 11, 70.0, Some(1))]);
        let eff = &out[&11];
        assert_eq!(eff.source, ResultSource::Backlog);
        // Backlog attempts are graded on the capped scale.
        assert_eq!(eff.grade().grade, "B+");
    }

    #[test]
    fn one_entry_per_course() {
        let out = resolve(vec![
            result(1, 10, 80.0, None),
            result(2, 11, 30.0, None),
            result(3, 11, 65.0, Some(1)),
            result(4, 12, 55.0, None),
        ]);
        assert_eq!(out.len(), 3);
        assert_eq!(out[&10].status, ResultStatus::Passed);
        assert_eq!(out[&11].result.marks, 65.0);
        assert_eq!(out[&12].attempts, 1);
    }
}
