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
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
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
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
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

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value["error"]["code"].as_str().expect("error code")
}

#[test]
fn grade_actions_leave_an_audit_trail() {
    let workspace = temp_dir("gradebook-audit");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let school = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "schools.create",
        json!({ "name": "Northside Academy" }),
    );
    let school_id = school["schoolId"].as_str().expect("schoolId").to_string();

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        json!({ "schoolId": school_id, "name": "T. Okafor", "role": "teacher" }),
    );
    let teacher_id = teacher["userId"].as_str().expect("userId").to_string();
    let principal = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "users.create",
        json!({ "schoolId": school_id, "name": "P. Mensah", "role": "principal" }),
    );
    let principal_id = principal["userId"].as_str().expect("userId").to_string();

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "classes.create",
        json!({ "schoolId": school_id, "name": "Grade 8D" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "classes.assignTeacher",
        json!({ "classId": class_id, "userId": teacher_id }),
    );
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "subjects.create",
        json!({ "schoolId": school_id, "name": "Mathematics" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.create",
        json!({ "classId": class_id, "lastName": "Ibrahim", "firstName": "Sade" }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.submit",
        json!({
            "actorId": teacher_id,
            "studentId": student_id,
            "subjectId": subject_id,
            "classId": class_id,
            "term": "T1",
            "examType": "midterm",
            "score": 77.0
        }),
    );
    let entry_id = submitted["entryId"].as_str().expect("entryId").to_string();

    request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "grades.approve",
        json!({
            "actorId": principal_id,
            "classId": class_id,
            "subjectId": subject_id,
            "term": "T1",
            "examType": "midterm",
            "submittedBy": teacher_id
        }),
    );

    let audit = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "audit.list",
        json!({ "actorId": principal_id }),
    );
    let entries = audit["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 2);

    // Newest first: the approval, then the submission.
    assert_eq!(entries[0]["action"].as_str(), Some("grades.approve"));
    assert_eq!(entries[0]["actorId"].as_str(), Some(principal_id.as_str()));
    assert_eq!(entries[0]["success"].as_bool(), Some(true));
    assert_eq!(entries[0]["newValue"]["status"].as_str(), Some("approved"));
    assert_eq!(entries[0]["metadata"]["count"].as_u64(), Some(1));

    assert_eq!(entries[1]["action"].as_str(), Some("grades.submit"));
    assert_eq!(entries[1]["actorId"].as_str(), Some(teacher_id.as_str()));
    assert_eq!(entries[1]["targetId"].as_str(), Some(entry_id.as_str()));
    assert_eq!(entries[1]["newValue"]["score"].as_f64(), Some(77.0));
}

#[test]
fn denied_actions_are_recorded_with_success_false() {
    let workspace = temp_dir("gradebook-audit-denied");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let school = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "schools.create",
        json!({ "name": "Northside Academy" }),
    );
    let school_id = school["schoolId"].as_str().expect("schoolId").to_string();

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        json!({ "schoolId": school_id, "name": "T. Okafor", "role": "teacher" }),
    );
    let teacher_id = teacher["userId"].as_str().expect("userId").to_string();
    let principal = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "users.create",
        json!({ "schoolId": school_id, "name": "P. Mensah", "role": "principal" }),
    );
    let principal_id = principal["userId"].as_str().expect("userId").to_string();

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "classes.create",
        json!({ "schoolId": school_id, "name": "Grade 8D" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "classes.assignTeacher",
        json!({ "classId": class_id, "userId": teacher_id }),
    );
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "subjects.create",
        json!({ "schoolId": school_id, "name": "Mathematics" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.create",
        json!({ "classId": class_id, "lastName": "Ibrahim", "firstName": "Sade" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.submit",
        json!({
            "actorId": teacher_id,
            "studentId": student["studentId"].as_str().expect("studentId"),
            "subjectId": subject_id,
            "classId": class_id,
            "term": "T1",
            "examType": "midterm",
            "score": 77.0
        }),
    );

    // Teacher attempts the principal-only approval.
    let resp = request(
        &mut stdin,
        &mut reader,
        "10",
        "grades.approve",
        json!({
            "actorId": teacher_id,
            "classId": class_id,
            "subjectId": subject_id,
            "term": "T1",
            "examType": "midterm",
            "submittedBy": teacher_id
        }),
    );
    assert_eq!(error_code(&resp), "permission_denied");

    let audit = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "audit.list",
        json!({ "actorId": principal_id }),
    );
    let entries = audit["entries"].as_array().expect("entries");
    let denied: Vec<_> = entries
        .iter()
        .filter(|e| e["success"].as_bool() == Some(false))
        .collect();
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0]["action"].as_str(), Some("grades.approve"));
    assert_eq!(
        denied[0]["metadata"]["error"].as_str(),
        Some("permission_denied")
    );

    // The audit log itself is role-gated.
    let resp = request(
        &mut stdin,
        &mut reader,
        "12",
        "audit.list",
        json!({ "actorId": teacher_id }),
    );
    assert_eq!(error_code(&resp), "permission_denied");
}
