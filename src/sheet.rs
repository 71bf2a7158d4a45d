use std::collections::HashMap;

use crate::validate::GradeDraft;

/// Per-student in-progress edit. A student absent from the map has no input
/// and is excluded from save.
#[derive(Debug, Clone, Copy, Default)]
pub struct SheetCell {
    pub score: Option<f64>,
    pub absent: bool,
}

/// In-memory accumulation of a grading pass over one class + subject +
/// term + exam. Nothing touches the store until save; discarding the sheet
/// loses the edits, which is the intended semantics.
#[derive(Debug, Clone)]
pub struct GradeSheet {
    pub actor_id: String,
    pub class_id: String,
    pub subject_id: String,
    pub term: String,
    pub exam_type: String,
    pub max_score: f64,
    cells: HashMap<String, SheetCell>,
}

impl GradeSheet {
    pub fn new(
        actor_id: &str,
        class_id: &str,
        subject_id: &str,
        term: &str,
        exam_type: &str,
        max_score: f64,
    ) -> GradeSheet {
        GradeSheet {
            actor_id: actor_id.to_string(),
            class_id: class_id.to_string(),
            subject_id: subject_id.to_string(),
            term: term.to_string(),
            exam_type: exam_type.to_string(),
            max_score,
            cells: HashMap::new(),
        }
    }

    /// Accepts a keystroke's value if it parses as a number in
    /// [0, max_score]; anything else is ignored without an error so
    /// incremental typing doesn't flicker. Accepting a score clears the
    /// absent flag. Returns whether the value was taken.
    pub fn set_score(&mut self, student_id: &str, raw: &serde_json::Value) -> bool {
        let parsed = match raw {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        let Some(value) = parsed else {
            return false;
        };
        if !value.is_finite() || value < 0.0 || value > self.max_score {
            return false;
        }
        self.cells.insert(
            student_id.to_string(),
            SheetCell {
                score: Some(value),
                absent: false,
            },
        );
        true
    }

    /// Flips the absence flag. Marking absent clears the score (the student
    /// is excluded from save); unmarking resets the score to 0.
    pub fn toggle_absent(&mut self, student_id: &str) -> bool {
        let cell = self.cells.entry(student_id.to_string()).or_default();
        if cell.absent {
            cell.absent = false;
            cell.score = Some(0.0);
        } else {
            cell.absent = true;
            cell.score = None;
        }
        cell.absent
    }

    pub fn cell(&self, student_id: &str) -> Option<SheetCell> {
        self.cells.get(student_id).copied()
    }

    /// Submission payloads for the batched save: absent students and
    /// students with no recorded score are filtered out; the shared
    /// class/subject/term/exam context is stamped onto each draft.
    /// Output is sorted by student id for deterministic writes.
    pub fn drafts(&self) -> Vec<GradeDraft> {
        let mut out: Vec<GradeDraft> = self
            .cells
            .iter()
            .filter(|(_, cell)| !cell.absent)
            .filter_map(|(student_id, cell)| {
                cell.score.map(|score| GradeDraft {
                    student_id: student_id.clone(),
                    subject_id: self.subject_id.clone(),
                    class_id: self.class_id.clone(),
                    term: self.term.clone(),
                    exam_type: self.exam_type.clone(),
                    score: Some(score),
                    max_score: self.max_score,
                })
            })
            .collect();
        out.sort_by(|a, b| a.student_id.cmp(&b.student_id));
        out
    }
}
