use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn handle_students_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let Some(entries) = req.params.get("students").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing students[]", None);
    };

    match db::subject_exists(conn, &subject_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let next_sort: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE subject_id = ?",
        [&subject_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut student_ids: Vec<String> = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let Some(obj) = entry.as_object() else {
            return err(
                &req.id,
                "bad_params",
                "students[] entries must be objects",
                Some(json!({ "index": i })),
            );
        };
        let display_name = match obj.get("displayName").and_then(|v| v.as_str()) {
            Some(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "missing displayName",
                    Some(json!({ "index": i })),
                )
            }
        };
        let classroom_id = obj
            .get("classroomId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let classroom_name = obj
            .get("classroomName")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let student_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO students(id, subject_id, display_name, classroom_id, classroom_name, sort_order, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &student_id,
                &subject_id,
                &display_name,
                classroom_id.as_deref(),
                classroom_name.as_deref(),
                next_sort + i as i64,
                db::now_rfc3339(),
            ),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            );
        }
        student_ids.push(student_id);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "studentIds": student_ids, "enrolled": student_ids.len() }),
    )
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, display_name, classroom_id, classroom_name
         FROM students
         WHERE subject_id = ?
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&subject_id], |row| {
            let id: String = row.get(0)?;
            let display_name: String = row.get(1)?;
            let classroom_id: Option<String> = row.get(2)?;
            let classroom_name: Option<String> = row.get(3)?;
            Ok(json!({
                "studentId": id,
                "displayName": display_name,
                "classroomId": classroom_id,
                "classroomName": classroom_name
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.enroll" => Some(handle_students_enroll(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        _ => None,
    }
}
