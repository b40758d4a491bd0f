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
    let exe = env!("CARGO_BIN_EXE_scorebookd");
    let mut child = Command::new(exe)
        .env_remove("SCOREBOOK_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn scorebookd");
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
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

fn str_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {key} in {value}"))
        .to_string()
}

fn list_students(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    params: serde_json::Value,
) -> Vec<serde_json::Value> {
    request_ok(stdin, reader, id, "students.list", params)
        .get("students")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

#[test]
fn class_capacity_and_membership() {
    let workspace = temp_dir("scorebook-students-classes");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let small = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Morning A", "description": "weekday mornings", "maxStudents": 1 }),
    );
    let small_id = str_field(&small, "classId");
    let big = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "name": "Evening" }),
    );
    let big_id = str_field(&big, "classId");

    let dup = request(
        &mut stdin,
        &mut reader,
        "4",
        "classes.create",
        json!({ "name": "Morning A" }),
    );
    assert_eq!(error_code(&dup), Some("conflict"));

    let bad_cap = request(
        &mut stdin,
        &mut reader,
        "5",
        "classes.create",
        json!({ "name": "Nobody", "maxStudents": 0 }),
    );
    assert_eq!(error_code(&bad_cap), Some("bad_params"));

    let rina = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.create",
        json!({ "name": "Rina", "level": "beginner 2", "classId": small_id }),
    );
    let rina_id = str_field(&rina, "studentId");

    let full = request(
        &mut stdin,
        &mut reader,
        "7",
        "students.create",
        json!({ "name": "Sari", "level": "Beginner 2", "classId": small_id }),
    );
    assert_eq!(error_code(&full), Some("conflict"));

    let sari = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.create",
        json!({ "name": "Sari", "level": "Beginner 2", "classId": big_id }),
    );
    let sari_id = str_field(&sari, "studentId");

    let move_into_full = request(
        &mut stdin,
        &mut reader,
        "9",
        "students.update",
        json!({ "studentId": sari_id, "patch": { "classId": small_id } }),
    );
    assert_eq!(error_code(&move_into_full), Some("conflict"));

    // Re-saving a student's own class does not count against the cap.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.update",
        json!({ "studentId": rina_id, "patch": { "classId": small_id, "level": "Elementary 1" } }),
    );

    let bad_level = request(
        &mut stdin,
        &mut reader,
        "11",
        "students.update",
        json!({ "studentId": rina_id, "patch": { "level": "Master" } }),
    );
    assert_eq!(error_code(&bad_level), Some("bad_params"));

    let classes = request_ok(&mut stdin, &mut reader, "12", "classes.list", json!({}));
    let morning = classes
        .get("classes")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .find(|c| c.get("name").and_then(|v| v.as_str()) == Some("Morning A"))
        .expect("Morning A listed");
    assert_eq!(morning.get("studentCount").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(morning.get("isFull").and_then(|v| v.as_bool()), Some(true));

    let in_small = list_students(
        &mut stdin,
        &mut reader,
        "13",
        json!({ "filters": { "classId": small_id } }),
    );
    assert_eq!(in_small.len(), 1);
    assert_eq!(in_small[0].get("level").and_then(|v| v.as_str()), Some("Elementary 1"));
    assert_eq!(in_small[0].get("className").and_then(|v| v.as_str()), Some("Morning A"));

    let shrink = request(
        &mut stdin,
        &mut reader,
        "14",
        "classes.update",
        json!({ "classId": big_id, "patch": { "maxStudents": 1, "description": "late" } }),
    );
    assert_eq!(shrink.get("ok").and_then(|v| v.as_bool()), Some(true));

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "classes.delete",
        json!({ "classId": small_id }),
    );
    assert_eq!(deleted.get("unassignedStudents").and_then(|v| v.as_u64()), Some(1));
    let everyone = list_students(&mut stdin, &mut reader, "16", json!({}));
    assert_eq!(everyone.len(), 2, "students outlive their class");
    let rina_row = everyone
        .iter()
        .find(|s| s.get("id").and_then(|v| v.as_str()) == Some(rina_id.as_str()))
        .expect("rina");
    assert_eq!(rina_row.get("classId"), Some(&serde_json::Value::Null));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn deleting_a_student_removes_their_scores() {
    let workspace = temp_dir("scorebook-students-delete");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "name": "Tono", "level": "Senior 3" }),
    );
    let student_id = str_field(&student, "studentId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "scores.save",
        json!({
            "year": 2026, "semester": "mid", "category": "writing",
            "entries": [{ "studentId": student_id, "midTerm": 66 }]
        }),
    );

    let found = list_students(
        &mut stdin,
        &mut reader,
        "4",
        json!({ "filters": { "q": "TON" }, "sortBy": "name_asc" }),
    );
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("active").and_then(|v| v.as_bool()), Some(true));

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.delete",
        json!({ "studentId": student_id }),
    );
    assert_eq!(deleted.get("scoresDeleted").and_then(|v| v.as_u64()), Some(1));

    let again = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.delete",
        json!({ "studentId": student_id }),
    );
    assert_eq!(error_code(&again), Some("not_found"));

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "reports.studentScores",
        json!({ "year": 2026, "semester": "mid" }),
    );
    assert_eq!(
        report.get("students").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn student_profile_fields_are_validated_and_stored() {
    let workspace = temp_dir("scorebook-students-profile");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({
            "name": "Putri",
            "level": "Junior 2",
            "gender": "female",
            "age": 13,
            "dateOfBirth": "2012-02-29",
            "contactNumber": "+6281234567890",
            "address": "  Jl. Merdeka 1, Bandung "
        }),
    );
    let putri_id = str_field(&created, "studentId");

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.get",
        json!({ "studentId": putri_id }),
    );
    let student = fetched.get("student").cloned().expect("student");
    assert_eq!(str_field(&student, "gender"), "Female");
    assert_eq!(student.get("age").and_then(|v| v.as_i64()), Some(13));
    assert_eq!(str_field(&student, "dateOfBirth"), "2012-02-29");
    assert_eq!(str_field(&student, "contactNumber"), "+6281234567890");
    assert_eq!(str_field(&student, "address"), "Jl. Merdeka 1, Bandung");

    for (id, field, params) in [
        ("4", "contactNumber", json!({ "name": "A", "level": "Junior 2", "contactNumber": "0812345678" })),
        ("5", "gender", json!({ "name": "B", "level": "Junior 2", "gender": "unknown" })),
        ("6", "age", json!({ "name": "C", "level": "Junior 2", "age": -3 })),
        ("7", "dateOfBirth", json!({ "name": "D", "level": "Junior 2", "dateOfBirth": "2099-01-01" })),
    ] {
        let rejected = request(&mut stdin, &mut reader, id, "students.create", params);
        assert_eq!(error_code(&rejected), Some("bad_params"));
        assert_eq!(
            rejected.pointer("/error/details/field").and_then(|v| v.as_str()),
            Some(field)
        );
    }
    assert_eq!(list_students(&mut stdin, &mut reader, "8", json!({})).len(), 1);

    let bad_patch = request(
        &mut stdin,
        &mut reader,
        "9",
        "students.update",
        json!({ "studentId": putri_id, "patch": { "contactNumber": "+62 812" } }),
    );
    assert_eq!(error_code(&bad_patch), Some("bad_params"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.update",
        json!({ "studentId": putri_id, "patch": { "address": null, "age": 14 } }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "students.get",
        json!({ "studentId": putri_id }),
    )
    .get("student")
    .cloned()
    .expect("student");
    assert_eq!(student.get("address"), Some(&serde_json::Value::Null));
    assert_eq!(student.get("age").and_then(|v| v.as_i64()), Some(14));
    assert_eq!(str_field(&student, "contactNumber"), "+6281234567890");

    let missing = request(
        &mut stdin,
        &mut reader,
        "12",
        "students.get",
        json!({ "studentId": "nobody" }),
    );
    assert_eq!(error_code(&missing), Some("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
