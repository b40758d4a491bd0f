use chrono::NaiveDate;
use regex::Regex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;

pub const LEVELS: [&str; 11] = [
    "Beginner 1",
    "Beginner 2",
    "Elementary 1",
    "Elementary 2",
    "Elementary 3",
    "Junior 1",
    "Junior 2",
    "Junior 3",
    "Senior 1",
    "Senior 2",
    "Senior 3",
];

/// Canonical spelling of a level, matched case-insensitively.
pub fn normalize_level(raw: &str) -> Option<&'static str> {
    let wanted = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    LEVELS
        .iter()
        .copied()
        .find(|level| level.eq_ignore_ascii_case(&wanted))
}

pub const MAX_AGE: i64 = 150;
pub const MAX_ADDRESS_LEN: usize = 255;

/// Indonesian mobile numbers in international form.
static CONTACT_NUMBER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\+62\d{9,13}$").expect("contact number pattern compiles")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "male" => Some(Self::Male),
            "female" => Some(Self::Female),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Male => "Male",
            Self::Female => "Female",
        }
    }
}

impl ToSql for Gender {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Gender {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Gender::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown gender '{s}'").into()))
    }
}

/// A student profile field that failed validation. Messages use the IPC
/// field names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    #[error("gender must be one of: Male, Female")]
    Gender,
    #[error("age must be a whole number between 0 and {}", MAX_AGE)]
    Age,
    #[error("dateOfBirth must be a date formatted YYYY-MM-DD and not in the future")]
    DateOfBirth,
    #[error("contactNumber must start with +62 followed by 9-13 digits")]
    ContactNumber,
    #[error("address must be at most {} characters", MAX_ADDRESS_LEN)]
    Address,
}

impl ProfileError {
    pub fn field(&self) -> &'static str {
        match self {
            Self::Gender => "gender",
            Self::Age => "age",
            Self::DateOfBirth => "dateOfBirth",
            Self::ContactNumber => "contactNumber",
            Self::Address => "address",
        }
    }
}

pub fn parse_gender(raw: &str) -> Result<Gender, ProfileError> {
    Gender::parse(raw).ok_or(ProfileError::Gender)
}

pub fn check_age(age: i64) -> Result<i64, ProfileError> {
    if (0..=MAX_AGE).contains(&age) {
        Ok(age)
    } else {
        Err(ProfileError::Age)
    }
}

pub fn parse_date_of_birth(raw: &str, today: NaiveDate) -> Result<NaiveDate, ProfileError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .ok()
        .filter(|d| *d <= today)
        .ok_or(ProfileError::DateOfBirth)
}

pub fn check_contact_number(raw: &str) -> Result<String, ProfileError> {
    let trimmed = raw.trim();
    if CONTACT_NUMBER_PATTERN.is_match(trimmed) {
        Ok(trimmed.to_string())
    } else {
        Err(ProfileError::ContactNumber)
    }
}

pub fn check_address(raw: &str) -> Result<String, ProfileError> {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= MAX_ADDRESS_LEN {
        Ok(trimmed.to_string())
    } else {
        Err(ProfileError::Address)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentFilters {
    /// Case-insensitive substring of the student's name.
    pub q: Option<String>,
    pub class_id: Option<String>,
    pub level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StudentSort {
    /// Order the students were added in.
    #[default]
    Insertion,
    NameAsc,
    NameDesc,
}

impl StudentSort {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "" => Some(Self::Insertion),
            "name_asc" => Some(Self::NameAsc),
            "name_desc" => Some(Self::NameDesc),
            _ => None,
        }
    }

    fn order_by(self) -> &'static str {
        match self {
            Self::Insertion => "s.rowid",
            Self::NameAsc => "s.name COLLATE NOCASE, s.rowid",
            Self::NameDesc => "s.name COLLATE NOCASE DESC, s.rowid",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub name: String,
    pub level: String,
    pub class_id: Option<String>,
    pub class_name: Option<String>,
    pub gender: Option<Gender>,
    pub age: Option<i64>,
    pub date_of_birth: Option<String>,
    pub contact_number: Option<String>,
    pub address: Option<String>,
    pub active: bool,
    pub updated_at: Option<String>,
}

const STUDENT_SELECT: &str = "SELECT s.id, s.name, s.level, s.class_id, c.name, s.gender, s.age,
            s.date_of_birth, s.contact_number, s.address, s.active, s.updated_at
         FROM students s
         LEFT JOIN classes c ON c.id = s.class_id";

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    let active: i64 = row.get(10)?;
    Ok(Student {
        id: row.get(0)?,
        name: row.get(1)?,
        level: row.get(2)?,
        class_id: row.get(3)?,
        class_name: row.get(4)?,
        gender: row.get(5)?,
        age: row.get(6)?,
        date_of_birth: row.get(7)?,
        contact_number: row.get(8)?,
        address: row.get(9)?,
        active: active != 0,
        updated_at: row.get(11)?,
    })
}

pub fn get_student(conn: &Connection, student_id: &str) -> rusqlite::Result<Option<Student>> {
    let sql = format!("{STUDENT_SELECT} WHERE s.id = ?");
    conn.query_row(&sql, [student_id], student_from_row).optional()
}

pub fn list_students(
    conn: &Connection,
    filters: &StudentFilters,
    sort: StudentSort,
) -> rusqlite::Result<Vec<Student>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if let Some(q) = filters.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        clauses.push("instr(lower(s.name), lower(?)) > 0");
        binds.push(Value::Text(q.to_string()));
    }
    if let Some(class_id) = filters.class_id.as_deref().filter(|c| !c.is_empty()) {
        clauses.push("s.class_id = ?");
        binds.push(Value::Text(class_id.to_string()));
    }
    if let Some(level) = filters.level.as_deref().filter(|l| !l.trim().is_empty()) {
        // Unknown levels match nobody rather than everybody.
        let level = normalize_level(level).unwrap_or_default();
        clauses.push("s.level = ?");
        binds.push(Value::Text(level.to_string()));
    }

    let mut sql = String::from(STUDENT_SELECT);
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY ");
    sql.push_str(sort.order_by());

    let mut stmt = conn.prepare(&sql)?;
    let students = stmt
        .query_map(params_from_iter(binds), student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(students)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassCapacity {
    pub max_students: Option<i64>,
    pub enrolled: i64,
}

impl ClassCapacity {
    pub fn is_full(&self) -> bool {
        matches!(self.max_students, Some(max) if self.enrolled >= max)
    }
}

/// Enrollment for a class, not counting `except_student`. `None` if the
/// class does not exist.
pub fn class_capacity(
    conn: &Connection,
    class_id: &str,
    except_student: Option<&str>,
) -> rusqlite::Result<Option<ClassCapacity>> {
    let Some(max_students) = conn
        .query_row(
            "SELECT max_students FROM classes WHERE id = ?",
            [class_id],
            |r| r.get::<_, Option<i64>>(0),
        )
        .optional()?
    else {
        return Ok(None);
    };
    let enrolled: i64 = conn.query_row(
        "SELECT COUNT(*) FROM students WHERE class_id = ? AND id IS NOT ?",
        (class_id, except_student),
        |r| r.get(0),
    )?;
    Ok(Some(ClassCapacity {
        max_students,
        enrolled,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        conn.execute(
            "INSERT INTO classes(id, name, max_students) VALUES('c1', 'Morning A', 2), ('c2', 'Evening', NULL)",
            [],
        )
        .expect("classes");
        for (id, name, level, class_id) in [
            ("s1", "Rina Wijaya", "Junior 1", Some("c1")),
            ("s2", "andi", "Senior 3", Some("c1")),
            ("s3", "Bayu", "Junior 1", None),
        ] {
            conn.execute(
                "INSERT INTO students(id, name, level, class_id) VALUES(?, ?, ?, ?)",
                (id, name, level, class_id),
            )
            .expect("student");
        }
        conn
    }

    fn ids(students: &[Student]) -> Vec<&str> {
        students.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn levels_normalize_case_and_spacing() {
        assert_eq!(normalize_level("junior  2"), Some("Junior 2"));
        assert_eq!(normalize_level(" BEGINNER 1 "), Some("Beginner 1"));
        assert_eq!(normalize_level("Junior 4"), None);
    }

    #[test]
    fn sorting_follows_the_requested_order() {
        let conn = setup();
        let all = StudentFilters::default();
        let by_insert = list_students(&conn, &all, StudentSort::Insertion).expect("list");
        assert_eq!(ids(&by_insert), vec!["s1", "s2", "s3"]);
        let asc = list_students(&conn, &all, StudentSort::NameAsc).expect("list");
        assert_eq!(ids(&asc), vec!["s2", "s3", "s1"]);
        let desc = list_students(&conn, &all, StudentSort::NameDesc).expect("list");
        assert_eq!(ids(&desc), vec!["s1", "s3", "s2"]);
        assert_eq!(StudentSort::parse("bogus"), None);
    }

    #[test]
    fn filters_combine() {
        let conn = setup();
        let by_name = StudentFilters {
            q: Some("WIJ".into()),
            ..Default::default()
        };
        assert_eq!(
            ids(&list_students(&conn, &by_name, StudentSort::Insertion).expect("list")),
            vec!["s1"]
        );

        let by_class_and_level = StudentFilters {
            class_id: Some("c1".into()),
            level: Some("junior 1".into()),
            ..Default::default()
        };
        let found = list_students(&conn, &by_class_and_level, StudentSort::Insertion).expect("list");
        assert_eq!(ids(&found), vec!["s1"]);
        assert_eq!(found[0].class_name.as_deref(), Some("Morning A"));

        let unknown_level = StudentFilters {
            level: Some("Expert".into()),
            ..Default::default()
        };
        assert!(list_students(&conn, &unknown_level, StudentSort::Insertion)
            .expect("list")
            .is_empty());
    }

    #[test]
    fn profile_fields_are_validated() {
        assert_eq!(parse_gender(" female "), Ok(Gender::Female));
        assert_eq!(parse_gender("other"), Err(ProfileError::Gender));

        assert_eq!(check_age(12), Ok(12));
        assert_eq!(check_age(-1), Err(ProfileError::Age));
        assert_eq!(check_age(MAX_AGE + 1), Err(ProfileError::Age));

        let today = NaiveDate::from_ymd_opt(2025, 6, 1).expect("date");
        assert_eq!(
            parse_date_of_birth("2012-02-29", today),
            Ok(NaiveDate::from_ymd_opt(2012, 2, 29).expect("date"))
        );
        assert_eq!(parse_date_of_birth("2013-02-29", today), Err(ProfileError::DateOfBirth));
        assert_eq!(parse_date_of_birth("01/02/2012", today), Err(ProfileError::DateOfBirth));
        assert_eq!(parse_date_of_birth("2025-06-02", today), Err(ProfileError::DateOfBirth));

        assert_eq!(check_contact_number("+628123456789"), Ok("+628123456789".to_string()));
        assert_eq!(check_contact_number("+62812345678"), Ok("+62812345678".to_string()));
        for bad in ["08123456789", "+6281234567", "+6281234567890123", "+62 812 3456 789", "+1234567890123"] {
            assert_eq!(check_contact_number(bad), Err(ProfileError::ContactNumber), "{bad}");
        }

        assert!(check_address(&"a".repeat(MAX_ADDRESS_LEN)).is_ok());
        assert_eq!(check_address(&"a".repeat(MAX_ADDRESS_LEN + 1)), Err(ProfileError::Address));
        assert_eq!(ProfileError::ContactNumber.field(), "contactNumber");
    }

    #[test]
    fn get_student_reads_the_full_record() {
        let conn = setup();
        conn.execute(
            "UPDATE students SET gender = 'Female', age = 13, date_of_birth = '2012-02-29',
                contact_number = '+628123456789', address = 'Jl. Merdeka 1'
             WHERE id = 's1'",
            [],
        )
        .expect("profile");
        let rina = get_student(&conn, "s1").expect("query").expect("student");
        assert_eq!(rina.gender, Some(Gender::Female));
        assert_eq!(rina.age, Some(13));
        assert_eq!(rina.date_of_birth.as_deref(), Some("2012-02-29"));
        assert_eq!(rina.contact_number.as_deref(), Some("+628123456789"));
        assert_eq!(rina.class_name.as_deref(), Some("Morning A"));

        let bayu = get_student(&conn, "s3").expect("query").expect("student");
        assert_eq!(bayu.gender, None);
        assert!(bayu.active);
        assert!(get_student(&conn, "nobody").expect("query").is_none());
    }

    #[test]
    fn capacity_counts_other_students() {
        let conn = setup();
        let full = class_capacity(&conn, "c1", None).expect("query").expect("class");
        assert!(full.is_full());
        let moving_within = class_capacity(&conn, "c1", Some("s1")).expect("query").expect("class");
        assert!(!moving_within.is_full());
        let open = class_capacity(&conn, "c2", None).expect("query").expect("class");
        assert!(!open.is_full());
        assert!(class_capacity(&conn, "missing", None).expect("query").is_none());
    }
}
