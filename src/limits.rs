//! Hard caps. Hitting one returns `LimitExceeded`, never panics.

pub const MAX_COURSE_NAME_LEN: usize = 128;
pub const MAX_FREE_TEXT_LEN: usize = 512;
pub const MAX_STUDENTS_PER_LESSON: usize = 64;
pub const MAX_LESSONS_PER_DAY: usize = 1024;
/// Widest date range a list query may span, inclusive.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 366;
/// Longest accepted request line on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;
