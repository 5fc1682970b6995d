use crate::calc::{self, Category};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn handle_assignments_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    // Aggregate stand-ins are written only through grades.bulkUpsert.
    if calc::is_aggregate_title(&title) {
        return err(
            &req.id,
            "bad_params",
            "reserved aggregate title",
            Some(json!({ "title": title })),
        );
    }
    let max_score = match req.params.get("maxScore").and_then(|v| v.as_f64()) {
        Some(v) if v.is_finite() && v > 0.0 => v,
        _ => return err(&req.id, "bad_params", "maxScore must be > 0", None),
    };
    let classroom_id = req
        .params
        .get("classroomId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let category = match req.params.get("category").and_then(|v| v.as_str()) {
        None => None,
        Some(s) => match Category::parse(s) {
            Some(c) => Some(c),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "category must be 'collected' or 'exam'",
                    Some(json!({ "category": s })),
                )
            }
        },
    };
    let category_str = category.map(|c| match c {
        Category::Collected => "collected",
        Category::Exam => "exam",
    });

    match db::subject_exists(conn, &subject_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let existing = match db::find_assignment_id(conn, &subject_id, &title, classroom_id.as_deref())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let assignment_id = match existing {
        Some(id) => {
            if let Err(e) = conn.execute(
                "UPDATE assignments SET max_score = ?, category = ?, updated_at = ? WHERE id = ?",
                (max_score, category_str, db::now_rfc3339(), &id),
            ) {
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            if let Err(e) = conn.execute(
                "INSERT INTO assignments(id, subject_id, title, max_score, classroom_id, category, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
                (
                    &id,
                    &subject_id,
                    &title,
                    max_score,
                    classroom_id.as_deref(),
                    category_str,
                    db::now_rfc3339(),
                ),
            ) {
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "assignments" })),
                );
            }
            id
        }
    };

    ok(
        &req.id,
        json!({
            "assignmentId": assignment_id,
            "title": title,
            "maxScore": max_score,
            "classroomId": classroom_id
        }),
    )
}

fn handle_assignments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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
        "SELECT id, title, max_score, classroom_id, category
         FROM assignments
         WHERE subject_id = ?1
           AND (?2 IS NULL OR classroom_id IS NULL OR classroom_id = ?2)
         ORDER BY updated_at, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((&subject_id, classroom_id.as_deref()), |row| {
            let id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let max_score: f64 = row.get(2)?;
            let classroom_id: Option<String> = row.get(3)?;
            let category: Option<String> = row.get(4)?;
            Ok(json!({
                "assignmentId": id,
                "title": title,
                "maxScore": max_score,
                "classroomId": classroom_id,
                "category": category,
                "isAggregate": calc::is_aggregate_title(&title)
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(assignments) => ok(&req.id, json!({ "assignments": assignments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_assignments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let title = match req.params.get("title").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing title", None),
    };
    let classroom_id = req
        .params
        .get("classroomId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let assignment_id =
        match db::find_assignment_id(conn, &subject_id, &title, classroom_id.as_deref()) {
            Ok(Some(id)) => id,
            Ok(None) => return err(&req.id, "not_found", "assignment not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM grade_records WHERE assignment_id = ?",
        [&assignment_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM assignments WHERE id = ?", [&assignment_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "deleted": true, "assignmentId": assignment_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.upsert" => Some(handle_assignments_upsert(state, req)),
        "assignments.list" => Some(handle_assignments_list(state, req)),
        "assignments.delete" => Some(handle_assignments_delete(state, req)),
        _ => None,
    }
}
