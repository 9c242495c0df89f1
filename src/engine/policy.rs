//! Role/permission decision table.
//!
//! | Role      | Create | Edit/Delete own | Edit/Delete others' | View |
//! |-----------|--------|-----------------|---------------------|------|
//! | principal | yes    | yes             | yes                 | all  |
//! | teacher   | yes    | yes             | no                  | own  |
//! | student   | no     | no              | no                  | participant only |

use crate::model::{Lesson, Role, User};

/// Only principals and teachers may create lessons.
pub fn can_create(role: Role) -> bool {
    !matches!(role, Role::Student)
}

/// Edit and delete share one ownership rule.
pub fn can_modify(user: &User, lesson: &Lesson) -> bool {
    match user.role {
        Role::Principal => true,
        Role::Teacher => lesson.teacher_id == user.id,
        Role::Student => false,
    }
}

pub fn can_view(user: &User, lesson: &Lesson) -> bool {
    match user.role {
        Role::Principal => true,
        Role::Teacher => lesson.teacher_id == user.id,
        Role::Student => lesson.has_student(&user.id),
    }
}
