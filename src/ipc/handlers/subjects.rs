use crate::calc::SubjectType;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn parse_cap(params: &serde_json::Value, key: &str) -> Result<Option<f64>, String> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(n) = v.as_f64() else {
                return Err(format!("{} must be a number", key));
            };
            if !n.is_finite() || n < 0.0 {
                return Err(format!("{} must be >= 0", key));
            }
            Ok(Some(n))
        }
    }
}

fn handle_subject_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }

    let subject_type = match req.params.get("subjectType").and_then(|v| v.as_str()) {
        None => SubjectType::Main,
        Some(s) => match SubjectType::parse(s) {
            Some(t) => t,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "subjectType must be 'main' or 'activity'",
                    Some(json!({ "subjectType": s })),
                )
            }
        },
    };

    let max_collected = match parse_cap(&req.params, "maxCollectedScore") {
        Ok(v) => v.unwrap_or(100.0),
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let max_exam = match parse_cap(&req.params, "maxExamScore") {
        Ok(v) => v.unwrap_or(100.0),
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name, subject_type, max_collected_score, max_exam_score, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &subject_id,
            &name,
            subject_type.as_str(),
            max_collected,
            max_exam,
            db::now_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(
        &req.id,
        json!({
            "subjectId": subject_id,
            "name": name,
            "subjectType": subject_type.as_str(),
            "maxCollectedScore": max_collected,
            "maxExamScore": max_exam
        }),
    )
}

fn handle_subject_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };

    let row: Option<(String, String, f64, f64)> = match conn
        .query_row(
            "SELECT name, subject_type, max_collected_score, max_exam_score
             FROM subjects WHERE id = ?",
            [&subject_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let Some((name, subject_type, max_collected, max_exam)) = row else {
        return err(&req.id, "not_found", "subject not found", None);
    };

    ok(
        &req.id,
        json!({
            "subjectId": subject_id,
            "name": name,
            "subjectType": subject_type,
            "maxCollectedScore": max_collected,
            "maxExamScore": max_exam
        }),
    )
}

fn handle_subject_update_scoring(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    match db::subject_exists(conn, &subject_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let patch_value = serde_json::Value::Object(patch.clone());
    let subject_type = match patch.get("subjectType").and_then(|v| v.as_str()) {
        None => None,
        Some(s) => match SubjectType::parse(s) {
            Some(t) => Some(t),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "subjectType must be 'main' or 'activity'",
                    Some(json!({ "subjectType": s })),
                )
            }
        },
    };
    let max_collected = match parse_cap(&patch_value, "maxCollectedScore") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let max_exam = match parse_cap(&patch_value, "maxExamScore") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    if let Some(t) = subject_type {
        if let Err(e) = conn.execute(
            "UPDATE subjects SET subject_type = ?, updated_at = ? WHERE id = ?",
            (t.as_str(), db::now_rfc3339(), &subject_id),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Some(v) = max_collected {
        if let Err(e) = conn.execute(
            "UPDATE subjects SET max_collected_score = ?, updated_at = ? WHERE id = ?",
            (v, db::now_rfc3339(), &subject_id),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Some(v) = max_exam {
        if let Err(e) = conn.execute(
            "UPDATE subjects SET max_exam_score = ?, updated_at = ? WHERE id = ?",
            (v, db::now_rfc3339(), &subject_id),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }

    handle_subject_get(state, req)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subject.create" => Some(handle_subject_create(state, req)),
        "subject.get" => Some(handle_subject_get(state, req)),
        "subject.updateScoring" => Some(handle_subject_update_scoring(state, req)),
        _ => None,
    }
}
