use crate::calc::{self, Category, ManualValue, SubjectType};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct SubjectRow {
    subject_type: SubjectType,
    max_collected_score: f64,
    max_exam_score: f64,
}

fn load_subject(conn: &Connection, subject_id: &str) -> Result<Option<SubjectRow>, rusqlite::Error> {
    conn.query_row(
        "SELECT subject_type, max_collected_score, max_exam_score FROM subjects WHERE id = ?",
        [subject_id],
        |r| {
            let subject_type: String = r.get(0)?;
            Ok(SubjectRow {
                subject_type: SubjectType::parse(&subject_type).unwrap_or(SubjectType::Main),
                max_collected_score: r.get(1)?,
                max_exam_score: r.get(2)?,
            })
        },
    )
    .optional()
}

fn load_assignment_defs(
    conn: &Connection,
    subject_id: &str,
) -> Result<Vec<calc::AssignmentDef>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, title, max_score, classroom_id, category
         FROM assignments WHERE subject_id = ?",
    )?;
    let rows = stmt.query_map([subject_id], |r| {
        let category: Option<String> = r.get(4)?;
        Ok(calc::AssignmentDef {
            id: r.get(0)?,
            title: r.get(1)?,
            max_score: r.get(2)?,
            classroom_id: r.get(3)?,
            category: category.as_deref().and_then(Category::parse),
        })
    })?;
    rows.collect()
}

fn handle_grades_bulk_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let title = match req.params.get("title").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing title", None),
    };
    if title.is_empty() {
        return err(&req.id, "bad_params", "title must not be empty", None);
    }
    let classroom_id = req
        .params
        .get("classroomId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let Some(grades_arr) = req.params.get("grades").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing grades[]", None);
    };

    let subject = match load_subject(conn, &subject_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let is_aggregate = calc::is_aggregate_title(&title);
    let aggregate_category = if title == calc::AGGREGATE_EXAM_TITLE {
        Category::Exam
    } else {
        Category::Collected
    };

    // A manual aggregate save is only open while its category has no real
    // assignments under the requested scope.
    if is_aggregate {
        if subject.subject_type == SubjectType::Activity && aggregate_category == Category::Exam {
            return err(
                &req.id,
                "bad_params",
                "activity subjects have no exam category",
                None,
            );
        }
        let defs = match load_assignment_defs(conn, &subject_id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if calc::has_real_assignments(
            &defs,
            subject.subject_type,
            aggregate_category,
            classroom_id.as_deref(),
        ) {
            return err(
                &req.id,
                "manual_entry_closed",
                "category has real assignments; manual totals are ignored",
                Some(json!({ "title": title })),
            );
        }
    }

    let cap = match (subject.subject_type, aggregate_category) {
        (SubjectType::Activity, _) => subject.max_collected_score,
        (SubjectType::Main, Category::Collected) => subject.max_collected_score,
        (SubjectType::Main, Category::Exam) => subject.max_exam_score,
    };
    let max_score = match req.params.get("maxScore").and_then(|v| v.as_f64()) {
        Some(v) if v.is_finite() && v > 0.0 => {
            if is_aggregate {
                cap
            } else {
                v
            }
        }
        Some(_) => return err(&req.id, "bad_params", "maxScore must be > 0", None),
        None if is_aggregate => cap,
        None => return err(&req.id, "bad_params", "missing maxScore", None),
    };

    // Validate the whole batch before writing anything: a bad value rejects
    // the batch, an over-cap manual value is clamped and reported.
    let mut resolved: Vec<(String, f64)> = Vec::with_capacity(grades_arr.len());
    let mut warnings: Vec<serde_json::Value> = Vec::new();
    for (i, entry) in grades_arr.iter().enumerate() {
        let Some(obj) = entry.as_object() else {
            return err(
                &req.id,
                "bad_params",
                "grades[] entries must be objects",
                Some(json!({ "index": i })),
            );
        };
        let student_id = match obj.get("studentId").and_then(|v| v.as_str()) {
            Some(v) => v.to_string(),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "missing studentId",
                    Some(json!({ "index": i })),
                )
            }
        };
        let Some(grade) = obj.get("grade").and_then(|v| v.as_f64()) else {
            return err(
                &req.id,
                "bad_params",
                "grade must be a number",
                Some(json!({ "index": i, "studentId": student_id })),
            );
        };

        let enrolled: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM students WHERE id = ? AND subject_id = ?",
                (&student_id, &subject_id),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if enrolled.is_none() {
            return err(
                &req.id,
                "not_found",
                "student not enrolled in subject",
                Some(json!({ "studentId": student_id })),
            );
        }

        let stored = if is_aggregate {
            match calc::resolve_manual_value(grade, cap) {
                Ok(ManualValue::Accepted(v)) => v,
                Ok(ManualValue::Clamped { entered, stored }) => {
                    warnings.push(json!({
                        "studentId": student_id,
                        "entered": entered,
                        "stored": stored,
                        "max": cap,
                        "message": format!("grade must not exceed {}", cap)
                    }));
                    stored
                }
                Err(e) => {
                    return err(
                        &req.id,
                        &e.code,
                        e.message,
                        Some(json!({ "index": i, "studentId": student_id })),
                    )
                }
            }
        } else {
            if !grade.is_finite() || grade < 0.0 {
                return err(
                    &req.id,
                    "bad_params",
                    "negative grades are not allowed",
                    Some(json!({ "index": i, "studentId": student_id })),
                );
            }
            grade
        };
        resolved.push((student_id, stored));
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let assignment_id =
        match db::find_assignment_id(&tx, &subject_id, &title, classroom_id.as_deref()) {
            Ok(Some(id)) => {
                if let Err(e) = tx.execute(
                    "UPDATE assignments SET max_score = ?, updated_at = ? WHERE id = ?",
                    (max_score, db::now_rfc3339(), &id),
                ) {
                    let _ = tx.rollback();
                    return err(&req.id, "db_insert_failed", e.to_string(), None);
                }
                id
            }
            Ok(None) => {
                let id = Uuid::new_v4().to_string();
                if let Err(e) = tx.execute(
                    "INSERT INTO assignments(id, subject_id, title, max_score, classroom_id, category, updated_at)
                     VALUES(?, ?, ?, ?, ?, NULL, ?)",
                    (
                        &id,
                        &subject_id,
                        &title,
                        max_score,
                        classroom_id.as_deref(),
                        db::now_rfc3339(),
                    ),
                ) {
                    let _ = tx.rollback();
                    return err(
                        &req.id,
                        "db_insert_failed",
                        e.to_string(),
                        Some(json!({ "table": "assignments" })),
                    );
                }
                id
            }
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };

    for (student_id, grade) in &resolved {
        if let Err(e) = tx.execute(
            "INSERT INTO grade_records(assignment_id, student_id, grade, updated_at)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(assignment_id, student_id) DO UPDATE SET
               grade = excluded.grade,
               updated_at = excluded.updated_at",
            (&assignment_id, student_id, grade, db::now_rfc3339()),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "grade_records" })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "assignmentId": assignment_id,
            "updated": resolved.len(),
            "warnings": warnings
        }),
    )
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let classroom_id = req
        .params
        .get("classroomId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut stmt = match conn.prepare(
        "SELECT g.student_id, a.title, a.classroom_id, g.grade
         FROM grade_records g
         JOIN assignments a ON a.id = g.assignment_id
         WHERE a.subject_id = ?1
           AND (?2 IS NULL OR a.classroom_id IS NULL OR a.classroom_id = ?2)
         ORDER BY a.updated_at, a.id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((&subject_id, classroom_id.as_deref()), |row| {
            let student_id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let classroom_id: Option<String> = row.get(2)?;
            let grade: f64 = row.get(3)?;
            Ok(json!({
                "studentId": student_id,
                "title": title,
                "classroomId": classroom_id,
                "grade": grade
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(grades) => ok(&req.id, json!({ "grades": grades })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.bulkUpsert" => Some(handle_grades_bulk_upsert(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        _ => None,
    }
}
