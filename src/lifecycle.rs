use crate::roles::Role;

/// Grade lifecycle states. Transitions are strictly forward; `released` is
/// terminal and marks the row immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradeStatus {
    Draft,
    Submitted,
    Approved,
    Released,
}

impl GradeStatus {
    pub fn parse(s: &str) -> Option<GradeStatus> {
        match s {
            "draft" => Some(GradeStatus::Draft),
            "submitted" => Some(GradeStatus::Submitted),
            "approved" => Some(GradeStatus::Approved),
            "released" => Some(GradeStatus::Released),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GradeStatus::Draft => "draft",
            GradeStatus::Submitted => "submitted",
            GradeStatus::Approved => "approved",
            GradeStatus::Released => "released",
        }
    }

    /// Legal forward transitions. Resubmission (submitted -> submitted,
    /// score updated in place) is not a transition and is handled by the
    /// upsert path.
    pub fn can_transition(self, next: GradeStatus) -> bool {
        matches!(
            (self, next),
            (GradeStatus::Draft, GradeStatus::Submitted)
                | (GradeStatus::Draft, GradeStatus::Approved)
                | (GradeStatus::Submitted, GradeStatus::Approved)
                | (GradeStatus::Approved, GradeStatus::Released)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == GradeStatus::Released
    }
}

/// Status a brand-new entry is created with. Principals auto-approve their
/// own entries; everyone else lands on submitted unless the caller withholds
/// submission with as_draft.
pub fn initial_status(role: Role, as_draft: bool) -> GradeStatus {
    if as_draft {
        return GradeStatus::Draft;
    }
    match role {
        Role::Principal => GradeStatus::Approved,
        _ => GradeStatus::Submitted,
    }
}

/// percentage = score / max_score * 100, rounded to 2 decimals. Never stored
/// independently of score and max_score.
pub fn percentage(score: f64, max_score: f64) -> f64 {
    if max_score <= 0.0 {
        return 0.0;
    }
    round2(100.0 * score / max_score)
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [
            GradeStatus::Draft,
            GradeStatus::Submitted,
            GradeStatus::Approved,
            GradeStatus::Released,
        ] {
            assert_eq!(GradeStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(GradeStatus::parse("pending"), None);
    }

    #[test]
    fn no_backward_transitions() {
        use GradeStatus::*;
        assert!(!Released.can_transition(Approved));
        assert!(!Released.can_transition(Submitted));
        assert!(!Released.can_transition(Draft));
        assert!(!Approved.can_transition(Submitted));
        assert!(!Approved.can_transition(Draft));
        assert!(!Submitted.can_transition(Draft));
    }

    #[test]
    fn forward_transitions_only() {
        use GradeStatus::*;
        assert!(Submitted.can_transition(Approved));
        assert!(Approved.can_transition(Released));
        assert!(Draft.can_transition(Submitted));
        assert!(Draft.can_transition(Approved));
        assert!(!Submitted.can_transition(Released));
        assert!(Released.is_terminal());
    }

    #[test]
    fn principals_auto_approve_their_entries() {
        assert_eq!(initial_status(Role::Principal, false), GradeStatus::Approved);
        assert_eq!(initial_status(Role::Teacher, false), GradeStatus::Submitted);
        assert_eq!(
            initial_status(Role::PlatformAdmin, false),
            GradeStatus::Submitted
        );
        assert_eq!(initial_status(Role::Principal, true), GradeStatus::Draft);
        assert_eq!(initial_status(Role::Teacher, true), GradeStatus::Draft);
    }

    #[test]
    fn percentage_rounds_to_two_decimals() {
        assert_eq!(percentage(85.0, 100.0), 85.0);
        assert_eq!(percentage(1.0, 3.0), 33.33);
        assert_eq!(percentage(2.0, 3.0), 66.67);
        assert_eq!(percentage(17.0, 20.0), 85.0);
        assert_eq!(percentage(50.0, 0.0), 0.0);
    }
}
