use crate::calc::{
    self, Category, ManualEntry, RosterStudent, SubjectConfig, SubjectType, SummarySnapshot,
};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

fn load_subject_config(
    conn: &Connection,
    subject_id: &str,
) -> Result<Option<(SubjectConfig, String)>, rusqlite::Error> {
    conn.query_row(
        "SELECT name, subject_type, max_collected_score, max_exam_score
         FROM subjects WHERE id = ?",
        [subject_id],
        |r| {
            let name: String = r.get(0)?;
            let subject_type: String = r.get(1)?;
            Ok((
                SubjectConfig {
                    id: subject_id.to_string(),
                    subject_type: SubjectType::parse(&subject_type).unwrap_or(SubjectType::Main),
                    max_collected_score: r.get(2)?,
                    max_exam_score: r.get(3)?,
                },
                name,
            ))
        },
    )
    .optional()
}

fn handle_summary_subject(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    // One transaction for the whole snapshot: summaries are never computed
    // against a half-updated record set.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let (subject, subject_name) = match load_subject_config(&tx, &subject_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let students_rows: Result<Vec<(RosterStudent, Option<String>)>, rusqlite::Error> = (|| {
        let mut stmt = tx.prepare(
            "SELECT id, display_name, classroom_id, classroom_name
             FROM students WHERE subject_id = ? ORDER BY sort_order",
        )?;
        let rows = stmt.query_map([&subject_id], |r| {
            let classroom_name: Option<String> = r.get(3)?;
            Ok((
                RosterStudent {
                    id: r.get(0)?,
                    display_name: r.get(1)?,
                    classroom_id: r.get(2)?,
                },
                classroom_name,
            ))
        })?;
        rows.collect()
    })();
    let students_rows = match students_rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let assignments: Result<Vec<calc::AssignmentDef>, rusqlite::Error> = (|| {
        let mut stmt = tx.prepare(
            "SELECT id, title, max_score, classroom_id, category
             FROM assignments WHERE subject_id = ? ORDER BY updated_at, id",
        )?;
        let rows = stmt.query_map([&subject_id], |r| {
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
    })();
    let assignments = match assignments {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let scores: Result<HashMap<String, HashMap<String, f64>>, rusqlite::Error> = (|| {
        let mut stmt = tx.prepare(
            "SELECT g.assignment_id, g.student_id, g.grade
             FROM grade_records g
             JOIN assignments a ON a.id = g.assignment_id
             WHERE a.subject_id = ?",
        )?;
        let rows = stmt.query_map([&subject_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
            ))
        })?;
        let mut map: HashMap<String, HashMap<String, f64>> = HashMap::new();
        for row in rows {
            let (assignment_id, student_id, grade) = row?;
            map.entry(assignment_id).or_default().insert(student_id, grade);
        }
        Ok(map)
    })();
    let scores = match scores {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    // Unsaved manual entries ride along with the request; they were
    // validated at input time, so reject rather than silently repair here.
    let mut manual_entries: Vec<ManualEntry> = Vec::new();
    if let Some(raw_entries) = req.params.get("manualEntries").and_then(|v| v.as_array()) {
        for (i, entry) in raw_entries.iter().enumerate() {
            let Some(obj) = entry.as_object() else {
                return err(
                    &req.id,
                    "bad_params",
                    "manualEntries[] entries must be objects",
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
            let category = match obj.get("category").and_then(|v| v.as_str()) {
                Some(s) => match Category::parse(s) {
                    Some(c) => c,
                    None => {
                        return err(
                            &req.id,
                            "bad_params",
                            "category must be 'collected' or 'exam'",
                            Some(json!({ "index": i })),
                        )
                    }
                },
                None => {
                    return err(
                        &req.id,
                        "bad_params",
                        "missing category",
                        Some(json!({ "index": i })),
                    )
                }
            };
            let Some(value) = obj.get("value").and_then(|v| v.as_f64()) else {
                return err(
                    &req.id,
                    "bad_params",
                    "value must be a number",
                    Some(json!({ "index": i, "studentId": student_id })),
                );
            };
            let cap = subject.category_cap(category);
            let value = match calc::resolve_manual_value(value, cap) {
                Ok(v) => v.stored(),
                Err(e) => {
                    return err(
                        &req.id,
                        &e.code,
                        e.message,
                        Some(json!({ "index": i, "studentId": student_id })),
                    )
                }
            };
            manual_entries.push(ManualEntry {
                student_id,
                category,
                value,
            });
        }
    }

    // Distinct classrooms in roster order, for the scope picker.
    let mut classes: Vec<serde_json::Value> = Vec::new();
    let mut seen_classes: Vec<Option<String>> = Vec::new();
    for (s, classroom_name) in &students_rows {
        if seen_classes.contains(&s.classroom_id) {
            continue;
        }
        seen_classes.push(s.classroom_id.clone());
        classes.push(json!({
            "classroomId": s.classroom_id,
            "classroomName": classroom_name
        }));
    }

    let scope = classroom_id.as_deref();
    let subject_type = subject.subject_type;
    let has_real_collected =
        calc::has_real_assignments(&assignments, subject_type, Category::Collected, scope);
    let has_real_exam = match subject_type {
        SubjectType::Main => {
            calc::has_real_assignments(&assignments, subject_type, Category::Exam, scope)
        }
        SubjectType::Activity => false,
    };

    let snapshot = SummarySnapshot {
        subject,
        students: students_rows.into_iter().map(|(s, _)| s).collect(),
        assignments,
        scores,
        manual_entries,
        classroom_id,
    };
    let summaries = calc::compute_summaries(&snapshot);

    let students_json = match serde_json::to_value(&summaries) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_json", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "subject": {
                "subjectId": snapshot.subject.id,
                "name": subject_name,
                "subjectType": snapshot.subject.subject_type,
                "maxCollectedScore": snapshot.subject.max_collected_score,
                "maxExamScore": snapshot.subject.max_exam_score,
                "totalMaxScore": snapshot.subject.total_max_score()
            },
            "classroomId": snapshot.classroom_id,
            "classes": classes,
            "hasRealCollectedAssignments": has_real_collected,
            "hasRealExamAssignments": has_real_exam,
            "students": students_json
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "summary.subject" => Some(handle_summary_subject(state, req)),
        _ => None,
    }
}
