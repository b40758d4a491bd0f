use crate::ipc::error::ok;
use crate::ipc::helpers::{db_conn, db_err, required_str, student_filters, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::roster::{self, StudentSort};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn parse_level(v: &serde_json::Value) -> Result<&'static str, HandlerErr> {
    v.as_str().and_then(roster::normalize_level).ok_or_else(|| {
        HandlerErr::new("bad_params", "level must be one of the known levels")
            .with_details(json!({ "level": v, "levels": roster::LEVELS }))
    })
}

/// IPC key, column and patch assignment of each optional profile field.
const PROFILE_FIELDS: [(&str, &str, &str); 5] = [
    ("gender", "gender", "gender = ?"),
    ("age", "age", "age = ?"),
    ("dateOfBirth", "date_of_birth", "date_of_birth = ?"),
    ("contactNumber", "contact_number", "contact_number = ?"),
    ("address", "address", "address = ?"),
];

/// Validates one profile field. `null` and blank strings clear it.
fn profile_value(key: &str, v: &serde_json::Value) -> Result<Value, HandlerErr> {
    if v.is_null() || v.as_str().is_some_and(|s| s.trim().is_empty()) {
        return Ok(Value::Null);
    }
    let text = || {
        v.as_str()
            .ok_or_else(|| HandlerErr::new("bad_params", format!("{key} must be a string")))
    };
    let value = match key {
        "gender" => Value::Text(roster::parse_gender(text()?)?.as_str().to_string()),
        "age" => {
            let age = v.as_i64().ok_or(roster::ProfileError::Age)?;
            Value::Integer(roster::check_age(age)?)
        }
        "dateOfBirth" => {
            let today = chrono::Local::now().date_naive();
            let date = roster::parse_date_of_birth(text()?, today)?;
            Value::Text(date.format("%Y-%m-%d").to_string())
        }
        "contactNumber" => Value::Text(roster::check_contact_number(text()?)?),
        "address" => Value::Text(roster::check_address(text()?)?),
        _ => return Err(HandlerErr::new("bad_params", format!("unknown field {key}"))),
    };
    Ok(value)
}

/// Fails with `conflict` when the class is already at `max_students`.
fn ensure_class_has_room(
    conn: &Connection,
    class_id: &str,
    student_id: Option<&str>,
) -> Result<(), HandlerErr> {
    let capacity = roster::class_capacity(conn, class_id, student_id)
        .map_err(|e| db_err("db_query_failed", e))?
        .ok_or_else(|| {
            HandlerErr::new("not_found", "class not found")
                .with_details(json!({ "classId": class_id }))
        })?;
    if capacity.is_full() {
        return Err(HandlerErr::new("conflict", "class is full").with_details(json!({
            "classId": class_id,
            "maxStudents": capacity.max_students,
            "enrolled": capacity.enrolled
        })));
    }
    Ok(())
}

fn students_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let filters = student_filters(req)?;
    let sort = match req.params.get("sortBy").and_then(|v| v.as_str()) {
        None => StudentSort::default(),
        Some(raw) => StudentSort::parse(raw).ok_or_else(|| {
            HandlerErr::new("bad_params", "sortBy must be one of: name_asc, name_desc")
        })?,
    };
    let students =
        roster::list_students(conn, &filters, sort).map_err(|e| db_err("db_query_failed", e))?;
    Ok(json!({ "students": students }))
}

fn students_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = required_str(req, "studentId")?;
    let student = roster::get_student(conn, &student_id)
        .map_err(|e| db_err("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;
    Ok(json!({ "student": student }))
}

fn students_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let name = required_str(req, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::new("bad_params", "name must not be empty"));
    }
    let level = parse_level(
        req.params
            .get("level")
            .ok_or_else(|| HandlerErr::new("bad_params", "missing level"))?,
    )?;
    let class_id = req
        .params
        .get("classId")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let mut columns: Vec<&str> = vec!["id", "name", "level", "class_id", "active", "updated_at"];
    let mut bind_values: Vec<Value> = Vec::new();
    for (key, column, _) in PROFILE_FIELDS {
        if let Some(v) = req.params.get(key) {
            columns.push(column);
            bind_values.push(profile_value(key, v)?);
        }
    }

    if let Some(class_id) = class_id.as_deref() {
        ensure_class_has_room(conn, class_id, None)?;
    }

    let student_id = Uuid::new_v4().to_string();
    let mut values = vec![
        Value::Text(student_id.clone()),
        Value::Text(name),
        Value::Text(level.to_string()),
        class_id.map(Value::Text).unwrap_or(Value::Null),
        Value::Integer(i64::from(active)),
        Value::Text(chrono::Utc::now().to_rfc3339()),
    ];
    values.extend(bind_values);
    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO students({}) VALUES({})",
        columns.join(", "),
        placeholders
    );
    conn.execute(&sql, params_from_iter(values))
        .map_err(|e| db_err("db_insert_failed", e).with_details(json!({ "table": "students" })))?;

    info!(target: "scorebook::ipc", student_id = %student_id, "student created");
    Ok(json!({ "studentId": student_id }))
}

fn students_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = required_str(req, "studentId")?;
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::new("bad_params", "missing/invalid patch"));
    };

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "student not found"));
    }

    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("name") {
        let Some(s) = v.as_str().map(|s| s.trim().to_string()) else {
            return Err(HandlerErr::new("bad_params", "patch.name must be a string"));
        };
        if s.is_empty() {
            return Err(HandlerErr::new("bad_params", "name must not be empty"));
        }
        set_parts.push("name = ?");
        bind_values.push(Value::Text(s));
    }
    if let Some(v) = patch.get("level") {
        set_parts.push("level = ?");
        bind_values.push(Value::Text(parse_level(v)?.to_string()));
    }
    if let Some(v) = patch.get("classId") {
        match v {
            serde_json::Value::Null => {
                set_parts.push("class_id = NULL");
            }
            serde_json::Value::String(s) if s.is_empty() => {
                set_parts.push("class_id = NULL");
            }
            serde_json::Value::String(s) => {
                ensure_class_has_room(conn, s, Some(student_id.as_str()))?;
                set_parts.push("class_id = ?");
                bind_values.push(Value::Text(s.clone()));
            }
            _ => {
                return Err(HandlerErr::new(
                    "bad_params",
                    "patch.classId must be a string or null",
                ))
            }
        }
    }
    for (key, _, assignment) in PROFILE_FIELDS {
        if let Some(v) = patch.get(key) {
            set_parts.push(assignment);
            bind_values.push(profile_value(key, v)?);
        }
    }
    if let Some(v) = patch.get("active") {
        let Some(b) = v.as_bool() else {
            return Err(HandlerErr::new("bad_params", "patch.active must be a boolean"));
        };
        set_parts.push("active = ?");
        bind_values.push(Value::Integer(i64::from(b)));
    }

    if set_parts.is_empty() {
        return Err(HandlerErr::new("bad_params", "patch has no updatable fields"));
    }
    set_parts.push("updated_at = ?");
    bind_values.push(Value::Text(chrono::Utc::now().to_rfc3339()));

    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(student_id));
    conn.execute(&sql, params_from_iter(bind_values))
        .map_err(|e| db_err("db_update_failed", e).with_details(json!({ "table": "students" })))?;
    Ok(json!({ "ok": true }))
}

fn students_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = required_str(req, "studentId")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    let scores_deleted = tx
        .execute("DELETE FROM scores WHERE student_id = ?", [&student_id])
        .map_err(|e| db_err("db_delete_failed", e).with_details(json!({ "table": "scores" })))?;
    let deleted = tx
        .execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| db_err("db_delete_failed", e).with_details(json!({ "table": "students" })))?;
    if deleted == 0 {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    tx.commit().map_err(|e| db_err("db_tx_failed", e))?;

    info!(target: "scorebook::ipc", student_id = %student_id, scores_deleted, "student deleted");
    Ok(json!({ "ok": true, "scoresDeleted": scores_deleted }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => students_list(state, req),
        "students.get" => students_get(state, req),
        "students.create" => students_create(state, req),
        "students.update" => students_update(state, req),
        "students.delete" => students_delete(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
