use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidTime);
    }
    Ok(())
}

/// Scan one day's lessons for collisions with `candidate`.
///
/// `exclude` is the id of the lesson being edited, so it never conflicts
/// with its own pre-update version. Lessons without time overlap are skipped
/// entirely; an overlapping lesson may contribute a teacher conflict and a
/// student conflict independently. Results come back in scan order
/// (ascending start time). Empty is the only green light.
pub(crate) fn detect_conflicts(
    day: &DaySchedule,
    candidate: &Candidate,
    exclude: Option<Ulid>,
) -> Vec<Conflict> {
    let mut conflicts = Vec::new();

    for existing in day.overlapping(&candidate.span) {
        if exclude == Some(existing.id) {
            continue;
        }

        if candidate.teacher_id == existing.teacher_id {
            conflicts.push(Conflict {
                kind: ConflictKind::Teacher,
                lesson_id: existing.id,
                course_name: existing.course_name.clone(),
                date: existing.date,
                span: existing.span,
            });
        }

        let overlapping_students = candidate
            .student_ids
            .iter()
            .filter(|id| existing.has_student(id))
            .count();
        if overlapping_students > 0 {
            conflicts.push(Conflict {
                kind: ConflictKind::Student {
                    overlapping_students,
                },
                lesson_id: existing.id,
                course_name: existing.course_name.clone(),
                date: existing.date,
                span: existing.span,
            });
        }
    }

    conflicts
}
