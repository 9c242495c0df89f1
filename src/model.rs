use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minutes since midnight — the only time-of-day type.
pub type Minutes = i64;

/// Parse a zero-padded 24-hour `"HH:MM"` string into minutes since midnight.
pub fn parse_hhmm(s: &str) -> Option<Minutes> {
    let (h, m) = s.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let h: i64 = h.parse().ok()?;
    let m: i64 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

pub fn format_hhmm(t: Minutes) -> String {
    format!("{:02}:{:02}", t / 60, t % 60)
}

/// Half-open interval `[start, end)` in minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minutes,
    pub end: Minutes,
}

impl Span {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_min(&self) -> Minutes {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", format_hhmm(self.start), format_hhmm(self.end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Principal,
    Teacher,
    Student,
}

/// A user record, owned by the directory collaborator — the engine only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub role: Role,
    /// Who provisioned this user (None for the bootstrap principal).
    #[serde(default)]
    pub creator_id: Option<Ulid>,
    /// Opaque external auth subject, used for fallback identity resolution.
    #[serde(default)]
    pub credential: Option<String>,
}

/// One scheduled class occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: Ulid,
    pub course_name: String,
    pub teacher_id: Ulid,
    /// Non-empty; insertion order preserved for display.
    pub student_ids: Vec<Ulid>,
    pub date: NaiveDate,
    pub span: Span,
    pub location: String,
    pub remark: String,
    pub creator_id: Ulid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lesson {
    pub fn has_student(&self, id: &Ulid) -> bool {
        self.student_ids.contains(id)
    }

    /// Apply a sparse patch in place. Used on commit and on WAL replay.
    pub fn apply_patch(&mut self, patch: &LessonPatch, updated_at: DateTime<Utc>) {
        if let Some(ref name) = patch.course_name {
            self.course_name = name.clone();
        }
        if let Some(teacher_id) = patch.teacher_id {
            self.teacher_id = teacher_id;
        }
        if let Some(ref students) = patch.student_ids {
            self.student_ids = students.clone();
        }
        if let Some(date) = patch.date {
            self.date = date;
        }
        if let Some(start) = patch.start {
            self.span.start = start;
        }
        if let Some(end) = patch.end {
            self.span.end = end;
        }
        if let Some(ref location) = patch.location {
            self.location = location.clone();
        }
        if let Some(ref remark) = patch.remark {
            self.remark = remark.clone();
        }
        self.updated_at = updated_at;
    }
}

/// Sparse update: only fields explicitly present in the request are changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonPatch {
    pub course_name: Option<String>,
    pub teacher_id: Option<Ulid>,
    pub student_ids: Option<Vec<Ulid>>,
    pub date: Option<NaiveDate>,
    pub start: Option<Minutes>,
    pub end: Option<Minutes>,
    pub location: Option<String>,
    pub remark: Option<String>,
}

/// The proposed lesson state being validated — identical for create and for
/// the post-merge state during update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub date: NaiveDate,
    pub span: Span,
    pub teacher_id: Ulid,
    pub student_ids: Vec<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    Teacher,
    Student { overlapping_students: usize },
}

/// A detected scheduling collision. Produced fresh per validation call,
/// never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub lesson_id: Ulid,
    pub course_name: String,
    pub date: NaiveDate,
    pub span: Span,
}

impl Conflict {
    pub fn message(&self) -> String {
        match self.kind {
            ConflictKind::Teacher => format!(
                "teacher already has \"{}\" at {}",
                self.course_name, self.span
            ),
            ConflictKind::Student {
                overlapping_students,
            } => format!(
                "{} student(s) already have \"{}\" at {}",
                overlapping_students, self.course_name, self.span
            ),
        }
    }
}

/// The event types — flat records. This is the WAL format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    LessonCreated {
        lesson: Lesson,
    },
    LessonUpdated {
        id: Ulid,
        patch: LessonPatch,
        updated_at: DateTime<Utc>,
    },
    LessonDeleted {
        id: Ulid,
    },
}

/// All lessons on a single calendar date, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct DaySchedule {
    pub date: NaiveDate,
    pub lessons: Vec<Lesson>,
}

impl DaySchedule {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            lessons: Vec::new(),
        }
    }

    /// Insert keeping sort order by span.start.
    pub fn insert_lesson(&mut self, lesson: Lesson) {
        let pos = self
            .lessons
            .binary_search_by_key(&lesson.span.start, |l| l.span.start)
            .unwrap_or_else(|e| e);
        self.lessons.insert(pos, lesson);
    }

    pub fn remove_lesson(&mut self, id: Ulid) -> Option<Lesson> {
        if let Some(pos) = self.lessons.iter().position(|l| l.id == id) {
            Some(self.lessons.remove(pos))
        } else {
            None
        }
    }

    pub fn get(&self, id: &Ulid) -> Option<&Lesson> {
        self.lessons.iter().find(|l| l.id == *id)
    }

    /// Return only lessons whose span overlaps the query window.
    /// Uses the sort order to skip lessons starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Lesson> {
        let right_bound = self.lessons.partition_point(|l| l.span.start < query.end);
        self.lessons[..right_bound]
            .iter()
            .filter(move |l| l.span.end > query.start)
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonView {
    pub id: Ulid,
    pub course_name: String,
    pub date: NaiveDate,
    pub span: Span,
    pub location: String,
    pub remark: String,
    pub teacher: Participant,
    pub students: Vec<Participant>,
    pub creator_id: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonDetail {
    pub lesson: LessonView,
    pub creator: Option<Participant>,
    pub can_edit: bool,
}
