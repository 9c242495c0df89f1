use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::directory::CallerRef;
use crate::limits::*;
use crate::model::*;

use super::{policy, Engine, EngineError};

#[derive(Debug, Clone)]
pub struct ListLessons {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Student filter wins over everything else.
    pub filter_student_id: Option<Ulid>,
    /// Honored only for principal callers.
    pub filter_teacher_id: Option<Ulid>,
}

impl Engine {
    /// Role-scoped calendar listing, ordered by (date, start) ascending.
    ///
    /// An unresolvable caller gets an empty page, not an error — logged-out
    /// calendar views are allowed, they just see nothing.
    pub async fn list_lessons(
        &self,
        req: ListLessons,
        caller: &CallerRef,
    ) -> Result<Vec<LessonView>, EngineError> {
        let Some(user) = self.directory.resolve(caller).await else {
            return Ok(Vec::new());
        };

        if req.end_date < req.start_date {
            return Ok(Vec::new());
        }
        if (req.end_date - req.start_date).num_days() > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("date range too wide"));
        }

        let keep = |lesson: &Lesson| -> bool {
            if let Some(sid) = req.filter_student_id {
                return lesson.has_student(&sid);
            }
            if user.role == Role::Principal {
                if let Some(tid) = req.filter_teacher_id {
                    return lesson.teacher_id == tid;
                }
                return true;
            }
            match user.role {
                Role::Teacher => lesson.teacher_id == user.id,
                Role::Student => lesson.has_student(&user.id),
                Role::Principal => true,
            }
        };

        let mut dates: Vec<NaiveDate> = self
            .state
            .iter()
            .map(|e| *e.key())
            .filter(|d| *d >= req.start_date && *d <= req.end_date)
            .collect();
        dates.sort();

        let mut names: HashMap<Ulid, String> = HashMap::new();
        let mut out = Vec::new();
        for date in dates {
            let Some(day) = self.day(date) else { continue };
            let guard = day.read().await;
            for lesson in &guard.lessons {
                if keep(lesson) {
                    out.push(self.lesson_view(lesson, &mut names).await);
                }
            }
        }
        Ok(out)
    }

    /// Full lesson view for one id, including who may edit it.
    pub async fn lesson_detail(
        &self,
        id: Ulid,
        caller: &CallerRef,
    ) -> Result<LessonDetail, EngineError> {
        let user = self.resolve_caller(caller).await?;
        let lesson = self.get_lesson(&id).await.ok_or(EngineError::NotFound(id))?;

        if !policy::can_view(&user, &lesson) {
            return Err(EngineError::NoPermission);
        }

        let mut names = HashMap::new();
        let view = self.lesson_view(&lesson, &mut names).await;
        let creator = self.directory.get(&lesson.creator_id).await.map(|u| Participant {
            id: u.id,
            name: u.name,
        });

        Ok(LessonDetail {
            lesson: view,
            creator,
            can_edit: policy::can_modify(&user, &lesson),
        })
    }

    async fn lesson_view(&self, lesson: &Lesson, names: &mut HashMap<Ulid, String>) -> LessonView {
        let teacher = Participant {
            id: lesson.teacher_id,
            name: self.display_name(lesson.teacher_id, names).await,
        };
        let mut students = Vec::with_capacity(lesson.student_ids.len());
        for &sid in &lesson.student_ids {
            students.push(Participant {
                id: sid,
                name: self.display_name(sid, names).await,
            });
        }
        LessonView {
            id: lesson.id,
            course_name: lesson.course_name.clone(),
            date: lesson.date,
            span: lesson.span,
            location: lesson.location.clone(),
            remark: lesson.remark.clone(),
            teacher,
            students,
            creator_id: lesson.creator_id,
        }
    }

    async fn display_name(&self, id: Ulid, names: &mut HashMap<Ulid, String>) -> String {
        if let Some(name) = names.get(&id) {
            return name.clone();
        }
        let name = match self.directory.get(&id).await {
            Some(user) => user.name,
            None => "unknown".to_string(),
        };
        names.insert(id, name.clone());
        name
    }
}
