use std::collections::HashMap;

use crate::lifecycle::GradeStatus;

/// One fetched grade row, in submission-time-descending order. The fold
/// below never reorders input; group order is first-seen.
#[derive(Debug, Clone)]
pub struct SubmissionRow {
    pub class_id: String,
    pub subject_id: String,
    pub term: String,
    pub exam_type: String,
    pub submitted_by: String,
    pub score: Option<f64>,
    pub status: GradeStatus,
    pub submitted_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub class_id: String,
    pub subject_id: String,
    pub term: String,
    pub exam_type: String,
    pub submitted_by: String,
}

impl GroupKey {
    fn of(row: &SubmissionRow) -> GroupKey {
        GroupKey {
            class_id: row.class_id.clone(),
            subject_id: row.subject_id.clone(),
            term: row.term.clone(),
            exam_type: row.exam_type.clone(),
            submitted_by: row.submitted_by.clone(),
        }
    }
}

/// Explicit fold accumulator. Entries without a numeric score increment
/// count only; min seeds at 100 and max at 0 per group.
#[derive(Debug, Clone)]
struct GroupAcc {
    count: usize,
    scored: usize,
    sum: f64,
    min: f64,
    max: f64,
    status_counts: [usize; 4],
    latest_submitted_at: String,
}

impl GroupAcc {
    fn new(first_submitted_at: &str) -> GroupAcc {
        GroupAcc {
            count: 0,
            scored: 0,
            sum: 0.0,
            min: 100.0,
            max: 0.0,
            status_counts: [0; 4],
            latest_submitted_at: first_submitted_at.to_string(),
        }
    }

    fn fold(&mut self, row: &SubmissionRow) {
        self.count += 1;
        self.status_counts[status_slot(row.status)] += 1;
        if row.submitted_at > self.latest_submitted_at {
            self.latest_submitted_at = row.submitted_at.clone();
        }
        if let Some(score) = row.score {
            self.scored += 1;
            self.sum += score;
            if score < self.min {
                self.min = score;
            }
            if score > self.max {
                self.max = score;
            }
        }
    }

    fn dominant_status(&self) -> GradeStatus {
        // Most frequent member status; ties break toward the earliest
        // lifecycle stage so a half-approved group still reads as pending.
        let mut best = 0;
        for slot in 1..4 {
            if self.status_counts[slot] > self.status_counts[best] {
                best = slot;
            }
        }
        slot_status(best)
    }
}

fn status_slot(s: GradeStatus) -> usize {
    match s {
        GradeStatus::Draft => 0,
        GradeStatus::Submitted => 1,
        GradeStatus::Approved => 2,
        GradeStatus::Released => 3,
    }
}

fn slot_status(slot: usize) -> GradeStatus {
    match slot {
        0 => GradeStatus::Draft,
        1 => GradeStatus::Submitted,
        2 => GradeStatus::Approved,
        _ => GradeStatus::Released,
    }
}

/// Review-ready aggregation of one (class, subject, term, exam, submitter)
/// unit. Derived on every call, never persisted.
#[derive(Debug, Clone)]
pub struct GroupSummary {
    pub key: GroupKey,
    pub count: usize,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub status: GradeStatus,
    pub latest_submitted_at: String,
}

/// Groups rows by composite key, preserving the input's first-seen order
/// (the caller queries submission-time-descending, so groups come out
/// most-recently-submitted first). Averages round to 1 decimal after the
/// fold completes.
pub fn build_groups(rows: &[SubmissionRow]) -> Vec<GroupSummary> {
    let mut order: Vec<GroupKey> = Vec::new();
    let mut accs: HashMap<GroupKey, GroupAcc> = HashMap::new();

    for row in rows {
        let key = GroupKey::of(row);
        let acc = accs.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            GroupAcc::new(&row.submitted_at)
        });
        acc.fold(row);
    }

    order
        .into_iter()
        .map(|key| {
            let acc = &accs[&key];
            let average = if acc.scored > 0 {
                round1(acc.sum / acc.scored as f64)
            } else {
                0.0
            };
            GroupSummary {
                count: acc.count,
                average,
                min: acc.min,
                max: acc.max,
                status: acc.dominant_status(),
                latest_submitted_at: acc.latest_submitted_at.clone(),
                key,
            }
        })
        .collect()
}

pub fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}
