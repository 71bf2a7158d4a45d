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

struct World {
    teacher_id: String,
    class_id: String,
    subject_id: String,
    student_id: String,
}

fn setup_world(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> World {
    let school = request_ok(
        stdin,
        reader,
        "w1",
        "schools.create",
        json!({ "name": "Northside Academy" }),
    );
    let school_id = school["schoolId"].as_str().expect("schoolId").to_string();

    let teacher = request_ok(
        stdin,
        reader,
        "w2",
        "users.create",
        json!({ "schoolId": school_id, "name": "T. Okafor", "role": "teacher" }),
    );
    let teacher_id = teacher["userId"].as_str().expect("userId").to_string();

    let class = request_ok(
        stdin,
        reader,
        "w3",
        "classes.create",
        json!({ "schoolId": school_id, "name": "Grade 8D" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();

    request_ok(
        stdin,
        reader,
        "w4",
        "classes.assignTeacher",
        json!({ "classId": class_id, "userId": teacher_id }),
    );

    let subject = request_ok(
        stdin,
        reader,
        "w5",
        "subjects.create",
        json!({ "schoolId": school_id, "name": "Mathematics", "code": "MAT" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();

    let student = request_ok(
        stdin,
        reader,
        "w6",
        "students.create",
        json!({ "classId": class_id, "lastName": "Ibrahim", "firstName": "Sade" }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();

    World {
        teacher_id,
        class_id,
        subject_id,
        student_id,
    }
}

#[test]
fn resubmission_updates_in_place_without_duplicates() {
    let workspace = temp_dir("gradebook-resubmit");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let w = setup_world(&mut stdin, &mut reader);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.submit",
        json!({
            "actorId": w.teacher_id,
            "studentId": w.student_id,
            "subjectId": w.subject_id,
            "classId": w.class_id,
            "term": "T1",
            "examType": "midterm",
            "score": 80.0
        }),
    );
    assert_eq!(first["status"].as_str(), Some("submitted"));
    assert_eq!(first["resubmission"].as_bool(), Some(false));
    let first_id = first["entryId"].as_str().expect("entryId").to_string();

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.submit",
        json!({
            "actorId": w.teacher_id,
            "studentId": w.student_id,
            "subjectId": w.subject_id,
            "classId": w.class_id,
            "term": "T1",
            "examType": "midterm",
            "score": 92.5
        }),
    );
    assert_eq!(second["resubmission"].as_bool(), Some(true));
    assert_eq!(second["entryId"].as_str(), Some(first_id.as_str()));
    assert_eq!(second["status"].as_str(), Some("submitted"));
    assert_eq!(second["score"].as_f64(), Some(92.5));
    assert_eq!(second["percentage"].as_f64(), Some(92.5));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.list",
        json!({
            "actorId": w.teacher_id,
            "classId": w.class_id,
            "subjectId": w.subject_id
        }),
    );
    let entries = listed["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 1, "second submission must not duplicate");
    assert_eq!(entries[0]["score"].as_f64(), Some(92.5));
    assert_eq!(entries[0]["percentage"].as_f64(), Some(92.5));

    // A different exam type is a different natural key.
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.submit",
        json!({
            "actorId": w.teacher_id,
            "studentId": w.student_id,
            "subjectId": w.subject_id,
            "classId": w.class_id,
            "term": "T1",
            "examType": "final",
            "score": 71.0
        }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grades.list",
        json!({
            "actorId": w.teacher_id,
            "classId": w.class_id,
            "subjectId": w.subject_id
        }),
    );
    assert_eq!(listed["entries"].as_array().expect("entries").len(), 2);
}
