use crate::formula::{self, Bindings, EvalError};
use crate::roster::{self, Student, StudentFilters, StudentSort};
use crate::score_config::{self, Category, ConfigSet, ScoreConfig, Semester};
use crate::scores::{self, Marks, Score, ScoreError};
use rusqlite::Connection;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::warn;

/// Two-decimal rounding used for stored marks: `round(100*x) / 100`.
pub fn round_off_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Resizes an exercise list to exactly `n` entries: keeps the first `n`
/// values and pads with zeros.
pub fn fit_exercise_scores(current: &[f64], n: u32) -> Vec<f64> {
    let n = n as usize;
    let mut out: Vec<f64> = current.iter().copied().take(n).collect();
    out.resize(n, 0.0);
    out
}

/// Sum of the exercise marks that fall inside the configured capacity.
pub fn exercise_sum(config: &ScoreConfig, marks: &Marks) -> f64 {
    marks
        .exercise_scores
        .iter()
        .take(config.num_exercises as usize)
        .sum()
}

pub fn score_sum(config: &ScoreConfig, marks: &Marks) -> f64 {
    exercise_sum(config, marks) + marks.mid_term.unwrap_or(0.0) + marks.finals.unwrap_or(0.0)
}

pub fn bindings(config: &ScoreConfig, marks: &Marks) -> Bindings {
    Bindings {
        ex_sum: exercise_sum(config, marks),
        mid_term: marks.mid_term.unwrap_or(0.0),
        finals: marks.finals.unwrap_or(0.0),
        num_exercises: f64::from(config.num_exercises),
    }
}

pub fn try_final_score(config: &ScoreConfig, marks: &Marks) -> Result<f64, EvalError> {
    formula::evaluate(&config.formula, &bindings(config, marks))
}

/// Final score as displayed: a formula that cannot be evaluated shows 0,
/// with the error kept next to it.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalScore {
    pub value: f64,
    pub error: Option<EvalError>,
}

impl FinalScore {
    fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}

pub fn final_score(config: &ScoreConfig, marks: &Marks) -> FinalScore {
    match try_final_score(config, marks) {
        Ok(value) => FinalScore { value, error: None },
        Err(e) => {
            warn!(
                target: "scorebook::formula",
                formula = %config.formula,
                error = %e,
                "formula evaluation failed; reporting 0"
            );
            FinalScore {
                value: 0.0,
                error: Some(e),
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }
}

impl From<rusqlite::Error> for CalcError {
    fn from(e: rusqlite::Error) -> Self {
        CalcError::new("db_query_failed", e.to_string())
    }
}

impl From<score_config::ScoreConfigError> for CalcError {
    fn from(e: score_config::ScoreConfigError) -> Self {
        CalcError::new("db_query_failed", e.to_string())
    }
}

impl From<ScoreError> for CalcError {
    fn from(e: ScoreError) -> Self {
        CalcError::new("db_query_failed", e.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSheetRow {
    pub student_id: String,
    pub student_name: String,
    pub level: String,
    pub class_id: Option<String>,
    pub score_id: Option<String>,
    pub exercise_scores: Vec<f64>,
    pub mid_term: Option<f64>,
    pub finals: Option<f64>,
    pub score_sum: f64,
    pub final_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formula_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSheet {
    pub config: ScoreConfig,
    pub rows: Vec<ScoreSheetRow>,
}

/// The score entry sheet: one row per matching student, stored or blank.
pub fn compute_score_sheet(
    conn: &Connection,
    year: u32,
    semester: Semester,
    category: Category,
    filters: &StudentFilters,
) -> Result<ScoreSheet, CalcError> {
    let config = score_config::resolve(conn, year, semester, category)?;
    let students = roster::list_students(conn, filters, StudentSort::NameAsc)?;
    let stored = scores::scores_for_term(conn, year, semester)?;

    let mut rows = Vec::with_capacity(students.len());
    for student in students {
        let score = stored.get(&(student.id.clone(), category));
        let mut marks = score.map(|s| s.marks.clone()).unwrap_or_default();
        marks.exercise_scores = fit_exercise_scores(&marks.exercise_scores, config.num_exercises);
        let result = final_score(&config, &marks);
        rows.push(ScoreSheetRow {
            score_sum: score_sum(&config, &marks),
            final_score: result.value,
            formula_error: result.error_message(),
            score_id: score.map(|s| s.id.clone()),
            student_id: student.id,
            student_name: student.name,
            level: student.level,
            class_id: student.class_id,
            exercise_scores: marks.exercise_scores,
            mid_term: marks.mid_term,
            finals: marks.finals,
        });
    }
    Ok(ScoreSheet { config, rows })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentReportRow {
    pub student_id: String,
    pub name: String,
    pub level: String,
    pub class_id: Option<String>,
    /// `None` where the student has no score for that category.
    pub scores: BTreeMap<&'static str, Option<f64>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub formula_errors: BTreeMap<&'static str, String>,
}

fn category_result(configs: &ConfigSet, stored: &Score) -> FinalScore {
    let config = configs.governing(stored.year, stored.semester, stored.category);
    final_score(config, &stored.marks)
}

pub fn compute_student_scores(
    conn: &Connection,
    year: u32,
    semester: Semester,
    filters: &StudentFilters,
    sort: StudentSort,
) -> Result<Vec<StudentReportRow>, CalcError> {
    let configs = ConfigSet::load(conn)?;
    let students = roster::list_students(conn, filters, sort)?;
    let stored = scores::scores_for_term(conn, year, semester)?;

    let mut out = Vec::with_capacity(students.len());
    for Student {
        id,
        name,
        level,
        class_id,
        ..
    } in students
    {
        let mut scores = BTreeMap::new();
        let mut formula_errors = BTreeMap::new();
        for category in Category::ALL {
            let value = stored.get(&(id.clone(), category)).map(|score| {
                let result = category_result(&configs, score);
                if let Some(e) = result.error_message() {
                    formula_errors.insert(category.as_str(), e);
                }
                result.value
            });
            scores.insert(category.as_str(), value);
        }
        out.push(StudentReportRow {
            student_id: id,
            name,
            level,
            class_id,
            scores,
            formula_errors,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopScorer {
    pub student_id: String,
    pub name: String,
    pub final_score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryTop {
    pub category: Category,
    pub top: Option<TopScorer>,
}

/// Highest final score per category; ties go to the alphabetically first name.
pub fn compute_top_scorers(
    conn: &Connection,
    year: u32,
    semester: Semester,
) -> Result<Vec<CategoryTop>, CalcError> {
    let rows = compute_student_scores(
        conn,
        year,
        semester,
        &StudentFilters::default(),
        StudentSort::NameAsc,
    )?;

    Ok(Category::ALL
        .into_iter()
        .map(|category| {
            let top = rows
                .iter()
                .filter_map(|row| {
                    let value = row.scores.get(category.as_str()).copied().flatten()?;
                    Some((row, value))
                })
                .min_by(|(a, av), (b, bv)| {
                    bv.partial_cmp(av)
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
                })
                .map(|(row, value)| TopScorer {
                    student_id: row.student_id.clone(),
                    name: row.name.clone(),
                    final_score: value,
                });
            CategoryTop { category, top }
        })
        .collect())
}

/// Report-card band for one category. The score is shown with two decimals
/// and banded on its whole part.
pub fn score_comment(score: f64) -> &'static str {
    let whole = round_off_2_decimals(score).trunc();
    if whole >= 96.0 {
        "Excellent"
    } else if whole >= 91.0 {
        "Very good"
    } else if whole >= 81.0 {
        "Good"
    } else if whole >= 71.0 {
        "Fairly Good"
    } else if whole >= 56.0 {
        "Average"
    } else {
        "Poor"
    }
}

pub fn overall_comment(average: f64) -> &'static str {
    const LADDER: [(f64, &str); 9] = [
        (96.0, "Excellent!! Teruskan prestasi yang luar biasa!"),
        (91.0, "Very Good!! Teruskan kerja yang hebat!"),
        (86.0, "Great!! Teruskan usaha yang baik!"),
        (81.0, "Good!! Tingkatkan terus kemampuan!"),
        (76.0, "Satisfactory plus! Terus berlatih untuk kemajuan!"),
        (71.0, "Satisfactory! Perlu latihan tambahan untuk meningkat!"),
        (66.0, "Fair! Perlu lebih banyak latihan rutin!"),
        (60.0, "Passing! Perlu bimbingan tambahan!"),
        (50.0, "Needs improvement! Perlu perhatian khusus dan latihan intensif!"),
    ];
    LADDER
        .iter()
        .find(|(floor, _)| average >= *floor)
        .map(|(_, comment)| *comment)
        .unwrap_or("Requires immediate attention!. Perlu program remedial!")
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryGrade {
    pub category: Category,
    /// Two-decimal final score; `None` when nothing was entered.
    pub score: Option<f64>,
    pub comment: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formula_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub student: Student,
    pub year: u32,
    pub semester: Semester,
    pub grades: Vec<CategoryGrade>,
    /// Mean of the graded categories only; 0 when none are graded.
    pub average: f64,
    pub overall_comment: &'static str,
}

pub fn compute_report_card(
    conn: &Connection,
    student_id: &str,
    year: u32,
    semester: Semester,
) -> Result<ReportCard, CalcError> {
    let Some(student) = roster::get_student(conn, student_id)? else {
        return Err(CalcError::new("not_found", "student not found"));
    };
    let configs = ConfigSet::load(conn)?;
    let stored = scores::scores_for_term(conn, year, semester)?;

    let grades: Vec<CategoryGrade> = Category::ALL
        .into_iter()
        .map(|category| match stored.get(&(student.id.clone(), category)) {
            Some(score) => {
                let result = category_result(&configs, score);
                let shown = round_off_2_decimals(result.value);
                CategoryGrade {
                    category,
                    score: Some(shown),
                    comment: Some(score_comment(shown)),
                    formula_error: result.error_message(),
                }
            }
            None => CategoryGrade {
                category,
                score: None,
                comment: None,
                formula_error: None,
            },
        })
        .collect();

    let graded: Vec<f64> = grades.iter().filter_map(|g| g.score).collect();
    let average = if graded.is_empty() {
        0.0
    } else {
        graded.iter().sum::<f64>() / graded.len() as f64
    };

    Ok(ReportCard {
        student,
        year,
        semester,
        grades,
        average,
        overall_comment: overall_comment(average),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::score_config::ConfigScope;
    use crate::scores::ScoreEntry;

    fn config(num_exercises: u32, formula: &str) -> ScoreConfig {
        ScoreConfig {
            num_exercises,
            formula: formula.to_string(),
            ..ScoreConfig::builtin_default()
        }
    }

    fn marks(ex: &[f64], mid: Option<f64>, fin: Option<f64>) -> Marks {
        Marks {
            exercise_scores: ex.to_vec(),
            mid_term: mid,
            finals: fin,
        }
    }

    #[test]
    fn rounding_is_two_decimals() {
        assert_eq!(round_off_2_decimals(62.857142), 62.86);
        assert_eq!(round_off_2_decimals(90.454), 90.45);
        assert_eq!(round_off_2_decimals(80.0), 80.0);
    }

    #[test]
    fn fitting_pads_and_truncates() {
        assert_eq!(fit_exercise_scores(&[1.0, 2.0], 4), vec![1.0, 2.0, 0.0, 0.0]);
        assert_eq!(fit_exercise_scores(&[1.0, 2.0, 3.0], 2), vec![1.0, 2.0]);
        assert!(fit_exercise_scores(&[], 0).is_empty());
    }

    #[test]
    fn default_formula_matches_hand_computation() {
        let cfg = ScoreConfig::builtin_default();
        let m = marks(&[80.0, 90.0, 70.0, 60.0, 50.0], Some(75.0), Some(15.0));
        let expected = (350.0 + 75.0 + 15.0) / 7.0;
        assert!((final_score(&cfg, &m).value - expected).abs() < 1e-9);
        assert_eq!(score_sum(&cfg, &m), 440.0);
    }

    #[test]
    fn exercises_beyond_capacity_are_ignored() {
        let cfg = config(2, "ex_sum");
        let m = marks(&[10.0, 20.0, 30.0], None, None);
        assert_eq!(final_score(&cfg, &m).value, 30.0);
        assert_eq!(score_sum(&cfg, &m), 30.0);
    }

    #[test]
    fn missing_marks_count_as_zero() {
        let cfg = ScoreConfig::builtin_default();
        let m = marks(&[], None, None);
        assert_eq!(final_score(&cfg, &m), FinalScore { value: 0.0, error: None });
        let b = bindings(&cfg, &m);
        assert_eq!(b.num_exercises, 5.0);
        assert_eq!(b.mid_term, 0.0);
    }

    #[test]
    fn evaluation_errors_become_zero_but_stay_visible() {
        let cfg = config(5, "ex_sum / (mid_term - finals)");
        let m = marks(&[10.0], Some(50.0), Some(50.0));
        assert!(matches!(try_final_score(&cfg, &m), Err(EvalError::DivisionByZero)));
        let shown = final_score(&cfg, &m);
        assert_eq!(shown.value, 0.0);
        assert_eq!(shown.error, Some(EvalError::DivisionByZero));
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        score_config::ensure_global_default(&conn).expect("global default");
        for (id, name) in [("s1", "Citra"), ("s2", "Ayu"), ("s3", "Budi")] {
            conn.execute(
                "INSERT INTO students(id, name, level) VALUES(?, ?, 'Senior 2')",
                (id, name),
            )
            .expect("student");
        }
        conn
    }

    fn save(conn: &Connection, category: Category, student: &str, ex: f64, mid: f64, fin: f64) {
        scores::save_scores(
            conn,
            2025,
            Semester::Mid,
            category,
            &[ScoreEntry {
                student_id: student.to_string(),
                exercise_scores: vec![Some(ex)],
                mid_term: Some(mid),
                finals: Some(fin),
            }],
        )
        .expect("save scores");
    }

    #[test]
    fn score_sheet_lists_every_student_with_blank_rows() {
        let conn = setup();
        save(&conn, Category::Reading, "s1", 70.0, 70.0, 70.0);
        let sheet = compute_score_sheet(
            &conn,
            2025,
            Semester::Mid,
            Category::Reading,
            &StudentFilters::default(),
        )
        .expect("sheet");
        assert_eq!(sheet.rows.len(), 3);
        let names: Vec<&str> = sheet.rows.iter().map(|r| r.student_name.as_str()).collect();
        assert_eq!(names, vec!["Ayu", "Budi", "Citra"]);

        let blank = &sheet.rows[0];
        assert!(blank.score_id.is_none());
        assert_eq!(blank.exercise_scores, vec![0.0; 5]);
        assert_eq!(blank.final_score, 0.0);

        let citra = &sheet.rows[2];
        assert!(citra.score_id.is_some());
        assert_eq!(citra.score_sum, 210.0);
        assert!((citra.final_score - 30.0).abs() < 1e-9);
    }

    #[test]
    fn student_report_uses_each_categorys_config() {
        let conn = setup();
        score_config::save(
            &conn,
            ConfigScope {
                year: Some(2025),
                semester: Some(Semester::Mid),
                category: Some(Category::Speaking),
            },
            1,
            "finals",
        )
        .expect("speaking config");
        save(&conn, Category::Reading, "s2", 70.0, 70.0, 70.0);
        save(&conn, Category::Speaking, "s2", 10.0, 20.0, 95.5);

        let rows = compute_student_scores(
            &conn,
            2025,
            Semester::Mid,
            &StudentFilters::default(),
            StudentSort::NameAsc,
        )
        .expect("report");
        let ayu = &rows[0];
        assert_eq!(ayu.name, "Ayu");
        assert!((ayu.scores["reading"].expect("reading") - 30.0).abs() < 1e-9);
        assert_eq!(ayu.scores["speaking"], Some(95.5));
        assert_eq!(ayu.scores["writing"], None);
        assert_eq!(rows[1].scores["reading"], None);
    }

    #[test]
    fn top_scorers_break_ties_by_name() {
        let conn = setup();
        save(&conn, Category::Writing, "s1", 90.0, 90.0, 90.0);
        save(&conn, Category::Writing, "s3", 90.0, 90.0, 90.0);
        save(&conn, Category::Writing, "s2", 10.0, 10.0, 10.0);

        let tops = compute_top_scorers(&conn, 2025, Semester::Mid).expect("tops");
        assert_eq!(tops.len(), 4);
        let writing = tops
            .iter()
            .find(|t| t.category == Category::Writing)
            .and_then(|t| t.top.as_ref())
            .expect("writing top");
        assert_eq!(writing.name, "Budi");
        assert!(tops
            .iter()
            .filter(|t| t.category != Category::Writing)
            .all(|t| t.top.is_none()));
    }

    #[test]
    fn top_scorer_ties_ignore_letter_case() {
        let conn = setup();
        conn.execute(
            "INSERT INTO students(id, name, level) VALUES('s4', 'adi', 'Senior 2')",
            [],
        )
        .expect("student");
        save(&conn, Category::Reading, "s3", 80.0, 80.0, 80.0);
        save(&conn, Category::Reading, "s4", 80.0, 80.0, 80.0);

        let tops = compute_top_scorers(&conn, 2025, Semester::Mid).expect("tops");
        let reading = tops
            .iter()
            .find(|t| t.category == Category::Reading)
            .and_then(|t| t.top.as_ref())
            .expect("reading top");
        assert_eq!(reading.name, "adi");
    }

    #[test]
    fn score_comments_follow_the_report_bands() {
        assert_eq!(score_comment(100.0), "Excellent");
        assert_eq!(score_comment(96.0), "Excellent");
        assert_eq!(score_comment(95.99), "Very good");
        assert_eq!(score_comment(95.999), "Excellent");
        assert_eq!(score_comment(91.0), "Very good");
        assert_eq!(score_comment(90.5), "Good");
        assert_eq!(score_comment(81.0), "Good");
        assert_eq!(score_comment(80.99), "Fairly Good");
        assert_eq!(score_comment(71.0), "Fairly Good");
        assert_eq!(score_comment(56.0), "Average");
        assert_eq!(score_comment(55.99), "Poor");
        assert_eq!(score_comment(0.0), "Poor");
    }

    #[test]
    fn overall_comment_ladder() {
        assert_eq!(overall_comment(97.0), "Excellent!! Teruskan prestasi yang luar biasa!");
        assert_eq!(overall_comment(86.0), "Great!! Teruskan usaha yang baik!");
        assert_eq!(overall_comment(85.99), "Good!! Tingkatkan terus kemampuan!");
        assert_eq!(overall_comment(60.0), "Passing! Perlu bimbingan tambahan!");
        assert_eq!(
            overall_comment(50.0),
            "Needs improvement! Perlu perhatian khusus dan latihan intensif!"
        );
        assert_eq!(
            overall_comment(49.99),
            "Requires immediate attention!. Perlu program remedial!"
        );
    }

    #[test]
    fn report_card_averages_only_graded_categories() {
        let conn = setup();
        score_config::save(
            &conn,
            ConfigScope {
                year: Some(2025),
                semester: Some(Semester::Mid),
                category: None,
            },
            1,
            "finals",
        )
        .expect("term config");
        save(&conn, Category::Reading, "s1", 0.0, 0.0, 96.0);
        save(&conn, Category::Writing, "s1", 0.0, 0.0, 84.333);

        let card = compute_report_card(&conn, "s1", 2025, Semester::Mid).expect("card");
        assert_eq!(card.student.name, "Citra");
        let reading = &card.grades[0];
        assert_eq!(reading.category, Category::Reading);
        assert_eq!(reading.score, Some(96.0));
        assert_eq!(reading.comment, Some("Excellent"));
        let writing = &card.grades[1];
        assert_eq!(writing.score, Some(84.33));
        assert_eq!(writing.comment, Some("Good"));
        assert!(card.grades[2..].iter().all(|g| g.score.is_none() && g.comment.is_none()));
        assert!((card.average - 90.165).abs() < 1e-9);
        assert_eq!(card.overall_comment, "Great!! Teruskan usaha yang baik!");

        let empty = compute_report_card(&conn, "s2", 2025, Semester::Final).expect("card");
        assert_eq!(empty.average, 0.0);
        assert_eq!(
            empty.overall_comment,
            "Requires immediate attention!. Perlu program remedial!"
        );

        let missing = compute_report_card(&conn, "nobody", 2025, Semester::Mid);
        assert!(matches!(missing, Err(e) if e.code == "not_found"));
    }
}
