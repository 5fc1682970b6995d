use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

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

fn request_ok(
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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn rank_fixture(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
    grades: &[f64],
) -> Vec<(f64, i64)> {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subject_id = request_ok(
        stdin,
        reader,
        "subj",
        "subject.create",
        json!({ "name": "สังคมศึกษา", "maxCollectedScore": 100, "maxExamScore": 0 }),
    )
    .get("subjectId")
    .and_then(|v| v.as_str())
    .expect("subjectId")
    .to_string();

    let entries: Vec<serde_json::Value> = (0..grades.len())
        .map(|i| json!({ "displayName": format!("นักเรียนคนที่ {}", i + 1) }))
        .collect();
    let student_ids: Vec<String> = request_ok(
        stdin,
        reader,
        "enroll",
        "students.enroll",
        json!({ "subjectId": subject_id, "students": entries }),
    )
    .get("studentIds")
    .and_then(|v| v.as_array())
    .expect("studentIds")
    .iter()
    .map(|v| v.as_str().expect("studentId").to_string())
    .collect();

    let grade_rows: Vec<serde_json::Value> = student_ids
        .iter()
        .zip(grades.iter())
        .map(|(sid, g)| json!({ "studentId": sid, "grade": g }))
        .collect();
    let _ = request_ok(
        stdin,
        reader,
        "g1",
        "grades.bulkUpsert",
        json!({
            "subjectId": subject_id,
            "title": "คะแนนรวมภาคเรียน",
            "maxScore": 100,
            "grades": grade_rows
        }),
    );

    let sum = request_ok(
        stdin,
        reader,
        "sum",
        "summary.subject",
        json!({ "subjectId": subject_id }),
    );
    sum.get("students")
        .and_then(|v| v.as_array())
        .expect("students")
        .iter()
        .map(|s| {
            (
                s.get("totalScore").and_then(|v| v.as_f64()).expect("total"),
                s.get("rank").and_then(|v| v.as_i64()).expect("rank"),
            )
        })
        .collect()
}

#[test]
fn tied_leaders_share_rank_and_next_jumps_to_position() {
    let workspace = temp_dir("gradesum-rank-113");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let ranked = rank_fixture(&mut stdin, &mut reader, &workspace, &[90.0, 90.0, 70.0]);
    assert_eq!(
        ranked,
        vec![(90.0, 1), (90.0, 1), (70.0, 3)],
        "expected the 1,1,3 pattern"
    );
    let _ = child.kill();
}

#[test]
fn mid_list_ties_skip_the_following_rank() {
    let workspace = temp_dir("gradesum-rank-1224");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let ranked = rank_fixture(
        &mut stdin,
        &mut reader,
        &workspace,
        &[80.0, 95.0, 60.0, 80.0],
    );
    assert_eq!(ranked, vec![(95.0, 1), (80.0, 2), (80.0, 2), (60.0, 4)]);
    let _ = child.kill();
}

#[test]
fn distinct_totals_rank_strictly() {
    let workspace = temp_dir("gradesum-rank-strict");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let ranked = rank_fixture(&mut stdin, &mut reader, &workspace, &[55.0, 85.0, 70.0]);
    assert_eq!(ranked, vec![(85.0, 1), (70.0, 2), (55.0, 3)]);
    for pair in ranked.windows(2) {
        assert!(pair[0].0 > pair[1].0);
        assert!(pair[0].1 < pair[1].1);
    }
    let _ = child.kill();
}
