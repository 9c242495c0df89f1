//! Line-delimited JSON protocol.
//!
//! Every request is a single JSON object on one line carrying an `action`
//! field plus caller identification (`userId` and/or `credential`). Every
//! response is a single line with a `{success, code?, data?, message?}`
//! envelope. Connections that issued `watch` also receive unsolicited
//! `{"event": ...}` lines when a watched date changes.

use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;
use ulid::Ulid;

use crate::directory::CallerRef;
use crate::engine::{CreateLesson, Engine, EngineError, ListLessons};
use crate::limits::MAX_LINE_LEN;
use crate::model::{
    Conflict, ConflictKind, Event, LessonPatch, LessonView, Minutes, format_hhmm, parse_hhmm,
};
use crate::observability;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    Create {
        #[serde(flatten)]
        caller: CallerRef,
        course_name: String,
        #[serde(default)]
        teacher_id: Option<Ulid>,
        #[serde(default)]
        student_ids: Vec<Ulid>,
        date: String,
        start_time: String,
        end_time: String,
        #[serde(default)]
        location: String,
        #[serde(default)]
        remark: String,
    },
    #[serde(rename_all = "camelCase")]
    Update {
        #[serde(flatten)]
        caller: CallerRef,
        lesson_id: Ulid,
        #[serde(default)]
        course_name: Option<String>,
        #[serde(default)]
        teacher_id: Option<Ulid>,
        #[serde(default)]
        student_ids: Option<Vec<Ulid>>,
        #[serde(default)]
        date: Option<String>,
        #[serde(default)]
        start_time: Option<String>,
        #[serde(default)]
        end_time: Option<String>,
        #[serde(default)]
        location: Option<String>,
        #[serde(default)]
        remark: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Delete {
        #[serde(flatten)]
        caller: CallerRef,
        lesson_id: Ulid,
    },
    #[serde(rename_all = "camelCase")]
    List {
        #[serde(flatten)]
        caller: CallerRef,
        start_date: String,
        end_date: String,
        #[serde(default)]
        filter_teacher_id: Option<Ulid>,
        #[serde(default)]
        filter_student_id: Option<Ulid>,
    },
    #[serde(rename_all = "camelCase")]
    Detail {
        #[serde(flatten)]
        caller: CallerRef,
        lesson_id: Ulid,
    },
    Watch {
        date: String,
    },
}

fn parse_date(s: &str) -> Result<NaiveDate, EngineError> {
    s.parse()
        .map_err(|_| EngineError::InvalidParams("date must be YYYY-MM-DD"))
}

fn parse_time(s: &str) -> Result<Minutes, EngineError> {
    parse_hhmm(s).ok_or(EngineError::InvalidParams("time must be HH:MM"))
}

fn view_json(v: &LessonView) -> Value {
    json!({
        "id": v.id,
        "courseName": v.course_name,
        "date": v.date,
        "startTime": format_hhmm(v.span.start),
        "endTime": format_hhmm(v.span.end),
        "teacher": v.teacher,
        "students": v.students,
        "location": v.location,
        "remark": v.remark,
    })
}

fn conflict_json(c: &Conflict) -> Value {
    let mut obj = json!({
        "lessonId": c.lesson_id,
        "courseName": c.course_name,
        "date": c.date,
        "time": c.span.to_string(),
        "message": c.message(),
    });
    match c.kind {
        ConflictKind::Teacher => {
            obj["kind"] = json!("teacher");
        }
        ConflictKind::Student {
            overlapping_students,
        } => {
            obj["kind"] = json!("student");
            obj["studentCount"] = json!(overlapping_students);
        }
    }
    obj
}

fn ok_line(data: Value) -> String {
    json!({ "success": true, "data": data }).to_string()
}

fn err_line(e: &EngineError) -> String {
    let mut obj = json!({
        "success": false,
        "code": e.code(),
        "message": e.to_string(),
    });
    if let EngineError::Conflicts(conflicts) = e {
        obj["data"] = json!({
            "conflicts": conflicts.iter().map(conflict_json).collect::<Vec<_>>(),
        });
    }
    obj.to_string()
}

fn event_line(ev: &Event) -> String {
    let body = match ev {
        Event::LessonCreated { lesson } => json!({
            "type": "created",
            "lessonId": lesson.id,
            "date": lesson.date,
        }),
        Event::LessonUpdated { id, updated_at, .. } => json!({
            "type": "updated",
            "lessonId": id,
            "updatedAt": updated_at,
        }),
        Event::LessonDeleted { id } => json!({
            "type": "deleted",
            "lessonId": id,
        }),
    };
    json!({ "event": body }).to_string()
}

async fn handle_request(
    engine: &Arc<Engine>,
    req: Request,
    events: &mpsc::UnboundedSender<Event>,
) -> Result<Value, EngineError> {
    match req {
        Request::Create {
            caller,
            course_name,
            teacher_id,
            student_ids,
            date,
            start_time,
            end_time,
            location,
            remark,
        } => {
            let req = CreateLesson {
                course_name,
                teacher_id,
                student_ids,
                date: parse_date(&date)?,
                start: parse_time(&start_time)?,
                end: parse_time(&end_time)?,
                location,
                remark,
            };
            let id = engine.create_lesson(req, &caller).await?;
            Ok(json!({ "lessonId": id }))
        }
        Request::Update {
            caller,
            lesson_id,
            course_name,
            teacher_id,
            student_ids,
            date,
            start_time,
            end_time,
            location,
            remark,
        } => {
            let patch = LessonPatch {
                course_name,
                teacher_id,
                student_ids,
                date: date.as_deref().map(parse_date).transpose()?,
                start: start_time.as_deref().map(parse_time).transpose()?,
                end: end_time.as_deref().map(parse_time).transpose()?,
                location,
                remark,
            };
            engine.update_lesson(lesson_id, patch, &caller).await?;
            Ok(json!({ "lessonId": lesson_id }))
        }
        Request::Delete { caller, lesson_id } => {
            engine.delete_lesson(lesson_id, &caller).await?;
            Ok(json!({ "lessonId": lesson_id }))
        }
        Request::List {
            caller,
            start_date,
            end_date,
            filter_teacher_id,
            filter_student_id,
        } => {
            let req = ListLessons {
                start_date: parse_date(&start_date)?,
                end_date: parse_date(&end_date)?,
                filter_teacher_id,
                filter_student_id,
            };
            let views = engine.list_lessons(req, &caller).await?;
            Ok(json!({
                "lessons": views.iter().map(view_json).collect::<Vec<_>>(),
            }))
        }
        Request::Detail { caller, lesson_id } => {
            let detail = engine.lesson_detail(lesson_id, &caller).await?;
            let mut obj = view_json(&detail.lesson);
            obj["creator"] = json!(detail.creator);
            obj["canEdit"] = json!(detail.can_edit);
            Ok(obj)
        }
        Request::Watch { date } => {
            let date = parse_date(&date)?;
            let rx = engine.notify.subscribe(date);
            spawn_forwarder(rx, events.clone());
            Ok(json!({ "watching": date }))
        }
    }
}

/// Bridges one broadcast subscription into the connection's outbound event
/// queue. Ends when the connection closes.
fn spawn_forwarder(mut rx: broadcast::Receiver<Event>, tx: mpsc::UnboundedSender<Event>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                ev = rx.recv() => match ev {
                    Ok(ev) => {
                        if tx.send(ev).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "watch subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

async fn dispatch_line(
    engine: &Arc<Engine>,
    line: &str,
    events: &mpsc::UnboundedSender<Event>,
) -> String {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            counter!(
                observability::REQUESTS_TOTAL,
                "action" => "invalid",
                "status" => "INVALID_REQUEST"
            )
            .increment(1);
            return json!({
                "success": false,
                "code": "INVALID_REQUEST",
                "message": e.to_string(),
            })
            .to_string();
        }
    };

    let action = observability::action_label(&req);
    let started = Instant::now();
    let result = handle_request(engine, req, events).await;
    histogram!(observability::REQUEST_DURATION_SECONDS, "action" => action)
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(data) => {
            counter!(observability::REQUESTS_TOTAL, "action" => action, "status" => "ok")
                .increment(1);
            ok_line(data)
        }
        Err(e) => {
            counter!(observability::REQUESTS_TOTAL, "action" => action, "status" => e.code())
                .increment(1);
            err_line(&e)
        }
    }
}

/// Serves one client connection until EOF or an I/O error.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    loop {
        tokio::select! {
            line = framed.next() => match line {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let reply = dispatch_line(&engine, &line, &event_tx).await;
                    framed.send(reply).await?;
                }
                Some(Err(e)) => return Err(e),
                None => break,
            },
            Some(ev) = event_rx.recv() => {
                framed.send(event_line(&ev)).await?;
            }
        }
    }
    Ok(())
}
