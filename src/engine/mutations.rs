use chrono::{NaiveDate, Utc};
use tokio::sync::{oneshot, OwnedRwLockWriteGuard};
use ulid::Ulid;

use crate::directory::CallerRef;
use crate::limits::*;
use crate::model::*;

use super::conflict::{detect_conflicts, validate_span};
use super::{policy, Engine, EngineError, WalCommand};

/// Fully-specified create request. Times are minutes since midnight; the
/// wire layer owns "HH:MM" parsing.
#[derive(Debug, Clone)]
pub struct CreateLesson {
    pub course_name: String,
    /// Client-supplied teacher. Ignored for teacher callers, who always
    /// schedule themselves.
    pub teacher_id: Option<Ulid>,
    pub student_ids: Vec<Ulid>,
    pub date: NaiveDate,
    pub start: Minutes,
    pub end: Minutes,
    pub location: String,
    pub remark: String,
}

impl Engine {
    /// Create a lesson: authenticate, authorize, validate, scan for
    /// conflicts, persist. Fail-fast at every gate, no partial writes.
    pub async fn create_lesson(
        &self,
        req: CreateLesson,
        caller: &CallerRef,
    ) -> Result<Ulid, EngineError> {
        let user = self.resolve_caller(caller).await?;

        if !policy::can_create(user.role) {
            return Err(EngineError::NoPermission);
        }

        // A teacher always schedules themself, regardless of what the
        // client sent; only a principal picks the teacher.
        let teacher_id = match user.role {
            Role::Teacher => user.id,
            _ => {
                let id = req
                    .teacher_id
                    .ok_or(EngineError::InvalidParams("teacher is required"))?;
                let teacher = self
                    .directory
                    .get(&id)
                    .await
                    .ok_or(EngineError::InvalidParams("teacher not found"))?;
                if teacher.role != Role::Teacher {
                    return Err(EngineError::InvalidParams("teacher not found"));
                }
                id
            }
        };

        validate_course_name(&req.course_name)?;
        validate_students(&req.student_ids)?;
        validate_free_text(&req.location, &req.remark)?;
        validate_span(&Span {
            start: req.start,
            end: req.end,
        })?;
        let span = Span::new(req.start, req.end);

        let day = self.day_entry(req.date);
        let mut guard = day.write_owned().await;

        if guard.lessons.len() >= MAX_LESSONS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many lessons on this day"));
        }

        let candidate = Candidate {
            date: req.date,
            span,
            teacher_id,
            student_ids: req.student_ids.clone(),
        };
        let conflicts = detect_conflicts(&guard, &candidate, None);
        if !conflicts.is_empty() {
            metrics::counter!(crate::observability::CONFLICTS_DETECTED_TOTAL)
                .increment(conflicts.len() as u64);
            drop(guard);
            self.drop_day_if_empty(req.date);
            return Err(EngineError::Conflicts(conflicts));
        }

        let now = Utc::now();
        let lesson = Lesson {
            id: Ulid::new(),
            course_name: req.course_name,
            teacher_id,
            student_ids: req.student_ids,
            date: req.date,
            span,
            location: req.location,
            remark: req.remark,
            creator_id: user.id,
            created_at: now,
            updated_at: now,
        };
        let id = lesson.id;

        let event = Event::LessonCreated {
            lesson: lesson.clone(),
        };
        self.wal_append(&event).await?;
        self.lesson_to_date.insert(id, req.date);
        guard.insert_lesson(lesson);
        drop(guard);
        self.notify.send(req.date, &event);
        Ok(id)
    }

    /// Update a lesson from a sparse patch. The merged candidate (patch
    /// over stored record) is what gets re-validated and conflict-scanned,
    /// with the lesson's own id excluded from the scan.
    pub async fn update_lesson(
        &self,
        id: Ulid,
        req: LessonPatch,
        caller: &CallerRef,
    ) -> Result<Ulid, EngineError> {
        let user = self.resolve_caller(caller).await?;

        let lesson = self.get_lesson(&id).await.ok_or(EngineError::NotFound(id))?;
        if !policy::can_modify(&user, &lesson) {
            return Err(EngineError::NoPermission);
        }

        // Early check when the request carries both bounds; the merged pair
        // is re-validated below either way.
        if let (Some(start), Some(end)) = (req.start, req.end) {
            if start >= end {
                return Err(EngineError::InvalidTime);
            }
        }

        let mut patch = req;
        // Only a principal may reassign the teacher; anyone else's attempt
        // is dropped rather than rejected.
        if patch.teacher_id.is_some() && user.role != Role::Principal {
            patch.teacher_id = None;
        }
        if let Some(new_teacher) = patch.teacher_id {
            let teacher = self
                .directory
                .get(&new_teacher)
                .await
                .ok_or(EngineError::InvalidParams("teacher not found"))?;
            if teacher.role != Role::Teacher {
                return Err(EngineError::InvalidParams("teacher not found"));
            }
        }
        if let Some(ref students) = patch.student_ids {
            validate_students(students)?;
        }
        if let Some(ref name) = patch.course_name {
            validate_course_name(name)?;
        }
        validate_free_text(
            patch.location.as_deref().unwrap_or(""),
            patch.remark.as_deref().unwrap_or(""),
        )?;

        let (mut old_guard, mut new_guard, old_date, target_date) =
            self.lock_for_update(id, patch.date).await?;

        // Re-read under the lock; the snapshot above may be stale.
        let current = match old_guard.get(&id) {
            Some(l) => l.clone(),
            None => {
                return self.abort_update(
                    old_guard,
                    new_guard,
                    old_date,
                    target_date,
                    EngineError::NotFound(id),
                );
            }
        };
        if !policy::can_modify(&user, &current) {
            return self.abort_update(
                old_guard,
                new_guard,
                old_date,
                target_date,
                EngineError::NoPermission,
            );
        }

        let now = Utc::now();
        let mut merged = current.clone();
        merged.apply_patch(&patch, now);
        if merged.span.start >= merged.span.end {
            return self.abort_update(
                old_guard,
                new_guard,
                old_date,
                target_date,
                EngineError::InvalidTime,
            );
        }

        let candidate = Candidate {
            date: merged.date,
            span: merged.span,
            teacher_id: merged.teacher_id,
            student_ids: merged.student_ids.clone(),
        };
        let scan_day: &DaySchedule = new_guard.as_deref().unwrap_or(&*old_guard);
        if scan_day.lessons.len() >= MAX_LESSONS_PER_DAY && new_guard.is_some() {
            return self.abort_update(
                old_guard,
                new_guard,
                old_date,
                target_date,
                EngineError::LimitExceeded("too many lessons on this day"),
            );
        }
        let conflicts = detect_conflicts(scan_day, &candidate, Some(id));
        if !conflicts.is_empty() {
            metrics::counter!(crate::observability::CONFLICTS_DETECTED_TOTAL)
                .increment(conflicts.len() as u64);
            return self.abort_update(
                old_guard,
                new_guard,
                old_date,
                target_date,
                EngineError::Conflicts(conflicts),
            );
        }

        let event = Event::LessonUpdated {
            id,
            patch: patch.clone(),
            updated_at: now,
        };
        if let Err(e) = self.wal_append(&event).await {
            return self.abort_update(old_guard, new_guard, old_date, target_date, e);
        }

        old_guard.remove_lesson(id);
        match new_guard.as_mut() {
            Some(target) => {
                self.lesson_to_date.insert(id, target_date);
                target.insert_lesson(merged);
            }
            None => old_guard.insert_lesson(merged),
        }
        drop(new_guard);
        drop(old_guard);
        if target_date != old_date {
            self.drop_day_if_empty(old_date);
        }

        self.notify.send(target_date, &event);
        if target_date != old_date {
            self.notify.send(old_date, &event);
        }
        Ok(id)
    }

    /// Delete a lesson. Same ownership rule as update; no conflict check —
    /// removing a lesson cannot introduce overlap, and nothing references
    /// lessons, so there is no cascade.
    pub async fn delete_lesson(&self, id: Ulid, caller: &CallerRef) -> Result<Ulid, EngineError> {
        let user = self.resolve_caller(caller).await?;

        let lesson = self.get_lesson(&id).await.ok_or(EngineError::NotFound(id))?;
        if !policy::can_modify(&user, &lesson) {
            return Err(EngineError::NoPermission);
        }

        let (mut guard, date) = self.lock_lesson_day(id).await?;
        if guard.get(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }

        let event = Event::LessonDeleted { id };
        self.wal_append(&event).await?;
        guard.remove_lesson(id);
        self.lesson_to_date.remove(&id);
        drop(guard);
        self.drop_day_if_empty(date);
        self.notify.send(date, &event);
        Ok(id)
    }

    /// Bail out of an update while holding the partition guards.
    /// `lock_for_update` may have created the target partition for a
    /// cross-date move; a rejected move must not leave it behind empty.
    fn abort_update(
        &self,
        old_guard: OwnedRwLockWriteGuard<DaySchedule>,
        new_guard: Option<OwnedRwLockWriteGuard<DaySchedule>>,
        old_date: NaiveDate,
        target_date: NaiveDate,
        err: EngineError,
    ) -> Result<Ulid, EngineError> {
        drop(new_guard);
        drop(old_guard);
        if target_date != old_date {
            self.drop_day_if_empty(target_date);
        }
        Err(err)
    }

    /// Lock the partition currently holding `id`. Re-resolves if a
    /// concurrent update moved the lesson to another date between lookup
    /// and lock.
    async fn lock_lesson_day(
        &self,
        id: Ulid,
    ) -> Result<(OwnedRwLockWriteGuard<DaySchedule>, NaiveDate), EngineError> {
        loop {
            let date = self
                .lesson_to_date
                .get(&id)
                .map(|e| *e.value())
                .ok_or(EngineError::NotFound(id))?;
            let day = self.day(date).ok_or(EngineError::NotFound(id))?;
            let guard = day.write_owned().await;
            if guard.get(&id).is_some() {
                return Ok((guard, date));
            }
            // Moved or deleted while we waited for the lock; try again.
        }
    }

    /// Lock the partition(s) an update touches: the lesson's current date
    /// and, when the patch moves it, the target date. Locks are taken in
    /// date order so concurrent cross-date updates cannot deadlock.
    async fn lock_for_update(
        &self,
        id: Ulid,
        patch_date: Option<NaiveDate>,
    ) -> Result<
        (
            OwnedRwLockWriteGuard<DaySchedule>,
            Option<OwnedRwLockWriteGuard<DaySchedule>>,
            NaiveDate,
            NaiveDate,
        ),
        EngineError,
    > {
        loop {
            let old_date = self
                .lesson_to_date
                .get(&id)
                .map(|e| *e.value())
                .ok_or(EngineError::NotFound(id))?;
            let target_date = patch_date.unwrap_or(old_date);

            if target_date == old_date {
                let day = self.day(old_date).ok_or(EngineError::NotFound(id))?;
                let guard = day.write_owned().await;
                if guard.get(&id).is_some() {
                    return Ok((guard, None, old_date, target_date));
                }
                continue;
            }

            let old_day = self.day(old_date).ok_or(EngineError::NotFound(id))?;
            let new_day = self.day_entry(target_date);
            let (first_guard, second_guard) = if old_date < target_date {
                let a = old_day.write_owned().await;
                let b = new_day.write_owned().await;
                (a, b)
            } else {
                let b = new_day.write_owned().await;
                let a = old_day.write_owned().await;
                (a, b)
            };
            if first_guard.get(&id).is_some() {
                return Ok((first_guard, Some(second_guard), old_date, target_date));
            }
            drop(second_guard);
            drop(first_guard);
            self.drop_day_if_empty(target_date);
        }
    }

    /// Compact the WAL down to one create event per live lesson.
    ///
    /// Takes each day's read lock in turn; a mutation holding the write
    /// guard (it spans the group-commit round trip) just delays that day's
    /// snapshot, it never fails the compaction.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        let days: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for day in days {
            let guard = day.read().await;
            for lesson in &guard.lessons {
                events.push(Event::LessonCreated {
                    lesson: lesson.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn validate_course_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidParams("course name is required"));
    }
    if name.len() > MAX_COURSE_NAME_LEN {
        return Err(EngineError::LimitExceeded("course name too long"));
    }
    Ok(())
}

fn validate_students(student_ids: &[Ulid]) -> Result<(), EngineError> {
    if student_ids.is_empty() {
        return Err(EngineError::InvalidParams("at least one student is required"));
    }
    if student_ids.len() > MAX_STUDENTS_PER_LESSON {
        return Err(EngineError::LimitExceeded("too many students"));
    }
    Ok(())
}

fn validate_free_text(location: &str, remark: &str) -> Result<(), EngineError> {
    if location.len() > MAX_FREE_TEXT_LEN {
        return Err(EngineError::LimitExceeded("location too long"));
    }
    if remark.len() > MAX_FREE_TEXT_LEN {
        return Err(EngineError::LimitExceeded("remark too long"));
    }
    Ok(())
}
