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

#[test]
fn export_import_preserves_grades() {
    let workspace = temp_dir("gradebook-backup-src");
    let workspace2 = temp_dir("gradebook-backup-dst");
    let bundle = workspace2.join("bundle.zip");

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
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.create",
        json!({ "schoolId": school_id, "name": "Grade 8D" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "classes.assignTeacher",
        json!({ "classId": class_id, "userId": teacher_id }),
    );
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "subjects.create",
        json!({ "schoolId": school_id, "name": "Mathematics" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.create",
        json!({ "classId": class_id, "lastName": "Ibrahim", "firstName": "Sade" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grades.submit",
        json!({
            "actorId": teacher_id,
            "studentId": student["studentId"].as_str().expect("studentId"),
            "subjectId": subject_id,
            "classId": class_id,
            "term": "T1",
            "examType": "midterm",
            "score": 81.0
        }),
    );

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "backup.export",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        exported["bundleFormat"].as_str(),
        Some("gradebook-workspace-v1")
    );
    let sha = exported["dbSha256"].as_str().expect("dbSha256");
    assert_eq!(sha.len(), 64);

    // Restore into a fresh workspace and read the same data back.
    request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "workspace.select",
        json!({ "path": workspace2.to_string_lossy() }),
    );
    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "backup.import",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        imported["bundleFormatDetected"].as_str(),
        Some("gradebook-workspace-v1")
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "grades.list",
        json!({ "actorId": teacher_id, "classId": class_id }),
    );
    let entries = listed["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["score"].as_f64(), Some(81.0));
}

#[test]
fn corrupted_bundle_is_refused() {
    let workspace = temp_dir("gradebook-backup-corrupt");
    let bogus = workspace.join("not-a-bundle.zip");
    std::fs::write(&bogus, b"definitely not a zip archive").expect("write bogus bundle");

    let (_child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "backup.import",
        json!({ "inPath": bogus.to_string_lossy() }),
    );
    assert_eq!(resp["ok"].as_bool(), Some(false));
    assert_eq!(
        resp["error"]["code"].as_str(),
        Some("backup_import_failed")
    );

    // The daemon reopened the workspace and keeps serving.
    let health = request_ok(&mut stdin, &mut reader, "3", "health", json!({}));
    assert!(health["workspacePath"]
        .as_str()
        .expect("workspacePath")
        .contains("gradebook-backup-corrupt"));
}
