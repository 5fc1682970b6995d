use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

const AGGREGATE_COLLECTED_TITLE: &str = "คะแนนเก็บรวม";
const AGGREGATE_EXAM_TITLE: &str = "คะแนนสอบรวม";

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradesumd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradesumd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn first_student(result: &serde_json::Value) -> serde_json::Value {
    result
        .get("students")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .cloned()
        .expect("first student")
}

#[test]
fn manual_collected_total_fills_the_missing_category() {
    let workspace = temp_dir("gradesum-manual-fallback");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subject_id = request_ok(
        &mut stdin,
        &mut reader,
        "subj",
        "subject.create",
        json!({ "name": "วิทยาศาสตร์", "maxCollectedScore": 100, "maxExamScore": 100 }),
    )
    .get("subjectId")
    .and_then(|v| v.as_str())
    .expect("subjectId")
    .to_string();
    let student_id = request_ok(
        &mut stdin,
        &mut reader,
        "enroll",
        "students.enroll",
        json!({ "subjectId": subject_id, "students": [{ "displayName": "เด็กชายพิชิต เรียนดี" }] }),
    )
    .get("studentIds")
    .and_then(|v| v.as_array())
    .and_then(|a| a.first())
    .and_then(|v| v.as_str())
    .expect("studentId")
    .to_string();

    // Only a real exam assignment exists; collected stays manual.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "grades.bulkUpsert",
        json!({
            "subjectId": subject_id,
            "title": "final",
            "maxScore": 30,
            "grades": [{ "studentId": student_id, "grade": 30 }]
        }),
    );

    let sum = request_ok(
        &mut stdin,
        &mut reader,
        "sum1",
        "summary.subject",
        json!({ "subjectId": subject_id }),
    );
    assert_eq!(
        sum.get("hasRealCollectedAssignments").and_then(|v| v.as_bool()),
        Some(false)
    );
    assert_eq!(
        sum.get("hasRealExamAssignments").and_then(|v| v.as_bool()),
        Some(true)
    );
    let s = first_student(&sum);
    assert_eq!(s.get("collectedScore").and_then(|v| v.as_f64()), Some(0.0));
    assert_eq!(s.get("collectedSource").and_then(|v| v.as_str()), Some("manualAggregate"));
    assert_eq!(s.get("examScore").and_then(|v| v.as_f64()), Some(100.0));

    // Unsaved entry rides along with the request: 45 + 100 of 200 -> 73%.
    let sum = request_ok(
        &mut stdin,
        &mut reader,
        "sum2",
        "summary.subject",
        json!({
            "subjectId": subject_id,
            "manualEntries": [{ "studentId": student_id, "category": "collected", "value": 45 }]
        }),
    );
    let s = first_student(&sum);
    assert_eq!(s.get("collectedScore").and_then(|v| v.as_f64()), Some(45.0));
    assert_eq!(s.get("totalScore").and_then(|v| v.as_f64()), Some(145.0));
    assert_eq!(s.get("totalMaxScore").and_then(|v| v.as_f64()), Some(200.0));
    assert_eq!(s.get("percentage").and_then(|v| v.as_i64()), Some(73));
    assert_eq!(s.get("letterGrade").and_then(|v| v.as_str()), Some("B"));

    // Persist the manual total under the reserved aggregate title.
    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "save",
        "grades.bulkUpsert",
        json!({
            "subjectId": subject_id,
            "title": AGGREGATE_COLLECTED_TITLE,
            "grades": [{ "studentId": student_id, "grade": 45 }]
        }),
    );
    assert_eq!(saved.get("updated").and_then(|v| v.as_i64()), Some(1));

    let sum = request_ok(
        &mut stdin,
        &mut reader,
        "sum3",
        "summary.subject",
        json!({ "subjectId": subject_id }),
    );
    // Still no real collected assignments: the stand-in is not one.
    assert_eq!(
        sum.get("hasRealCollectedAssignments").and_then(|v| v.as_bool()),
        Some(false)
    );
    let s = first_student(&sum);
    assert_eq!(s.get("collectedScore").and_then(|v| v.as_f64()), Some(45.0));
    assert_eq!(s.get("collectedSource").and_then(|v| v.as_str()), Some("manualAggregate"));
    // The stand-in stays out of the drill-down list.
    let details = s
        .get("assignmentDetails")
        .and_then(|v| v.as_array())
        .expect("assignmentDetails");
    assert!(details
        .iter()
        .all(|d| d.get("title").and_then(|v| v.as_str()) != Some(AGGREGATE_COLLECTED_TITLE)));

    // An unsaved entry takes precedence over the persisted total.
    let sum = request_ok(
        &mut stdin,
        &mut reader,
        "sum4",
        "summary.subject",
        json!({
            "subjectId": subject_id,
            "manualEntries": [{ "studentId": student_id, "category": "collected", "value": 50 }]
        }),
    );
    let s = first_student(&sum);
    assert_eq!(s.get("collectedScore").and_then(|v| v.as_f64()), Some(50.0));

    let _ = child.kill();
}

#[test]
fn manual_save_is_closed_once_real_assignments_exist() {
    let workspace = temp_dir("gradesum-manual-closed");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subject_id = request_ok(
        &mut stdin,
        &mut reader,
        "subj",
        "subject.create",
        json!({ "name": "ภาษาอังกฤษ" }),
    )
    .get("subjectId")
    .and_then(|v| v.as_str())
    .expect("subjectId")
    .to_string();
    let student_id = request_ok(
        &mut stdin,
        &mut reader,
        "enroll",
        "students.enroll",
        json!({ "subjectId": subject_id, "students": [{ "displayName": "เด็กหญิงแก้วตา ใสศรี" }] }),
    )
    .get("studentIds")
    .and_then(|v| v.as_array())
    .and_then(|a| a.first())
    .and_then(|v| v.as_str())
    .expect("studentId")
    .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "grades.bulkUpsert",
        json!({
            "subjectId": subject_id,
            "title": "สอบกลางภาค",
            "maxScore": 40,
            "grades": [{ "studentId": student_id, "grade": 35 }]
        }),
    );

    // The exam category has a real assignment, so its aggregate is refused.
    let resp = request(
        &mut stdin,
        &mut reader,
        "closed",
        "grades.bulkUpsert",
        json!({
            "subjectId": subject_id,
            "title": AGGREGATE_EXAM_TITLE,
            "grades": [{ "studentId": student_id, "grade": 20 }]
        }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resp.pointer("/error/code").and_then(|v| v.as_str()),
        Some("manual_entry_closed")
    );

    // A manual exam entry on the summary request is ignored the same way.
    let sum = request_ok(
        &mut stdin,
        &mut reader,
        "sum",
        "summary.subject",
        json!({
            "subjectId": subject_id,
            "manualEntries": [{ "studentId": student_id, "category": "exam", "value": 10 }]
        }),
    );
    let s = first_student(&sum);
    assert_eq!(s.get("examSource").and_then(|v| v.as_str()), Some("perAssignment"));
    // round(35/40 * 100) = 88
    assert_eq!(s.get("examScore").and_then(|v| v.as_f64()), Some(88.0));

    let _ = child.kill();
}
