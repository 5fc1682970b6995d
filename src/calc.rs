use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Reserved titles for persisted manual category totals. A record saved
/// under one of these stands in for a whole category and is not a real
/// per-task assignment.
pub const AGGREGATE_COLLECTED_TITLE: &str = "คะแนนเก็บรวม";
pub const AGGREGATE_EXAM_TITLE: &str = "คะแนนสอบรวม";

/// Title substrings (matched case-insensitively) that classify an
/// assignment as an exam when no explicit category tag is set.
const EXAM_TITLE_KEYWORDS: [&str; 5] = ["กลางภาค", "ปลายภาค", "final", "midterm", "คะแนนสอบ"];

pub fn is_exam_title(title: &str) -> bool {
    let t = title.to_lowercase();
    EXAM_TITLE_KEYWORDS.iter().any(|kw| t.contains(kw))
}

pub fn is_aggregate_title(title: &str) -> bool {
    title == AGGREGATE_COLLECTED_TITLE || title == AGGREGATE_EXAM_TITLE
}

/// Round-half-up to the nearest integer. Only correct for the non-negative
/// values produced here.
pub fn round_half_up(x: f64) -> f64 {
    (x + 0.5).floor()
}

/// Clamp a raw score into `[0, max]` before any aggregation use.
pub fn clamp_score(raw: f64, max: f64) -> f64 {
    raw.max(0.0).min(max)
}

/// Integer percentage with the shared divide-by-zero guard: a zero max
/// yields 0 rather than NaN.
pub fn percentage_of(score: f64, max: f64) -> i64 {
    if max > 0.0 {
        round_half_up(score / max * 100.0) as i64
    } else {
        0
    }
}

/// Scale a category's raw sum onto the subject's configured cap.
fn scale_to_cap(raw_score: f64, raw_max: f64, cap: f64) -> f64 {
    if raw_max > 0.0 {
        round_half_up(raw_score / raw_max * cap)
    } else {
        0.0
    }
}

pub fn letter_grade(percentage: i64) -> &'static str {
    if percentage >= 80 {
        "A"
    } else if percentage >= 75 {
        "B+"
    } else if percentage >= 70 {
        "B"
    } else if percentage >= 65 {
        "C+"
    } else if percentage >= 60 {
        "C"
    } else if percentage >= 55 {
        "D+"
    } else if percentage >= 50 {
        "D"
    } else {
        "F"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    Main,
    Activity,
}

impl SubjectType {
    pub fn parse(s: &str) -> Option<SubjectType> {
        match s {
            "main" => Some(SubjectType::Main),
            "activity" => Some(SubjectType::Activity),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubjectType::Main => "main",
            SubjectType::Activity => "activity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Collected,
    Exam,
}

impl Category {
    pub fn parse(s: &str) -> Option<Category> {
        match s {
            "collected" => Some(Category::Collected),
            "exam" => Some(Category::Exam),
            _ => None,
        }
    }

    /// The reserved title a manual total for this category is persisted
    /// under. Activity subjects use the collected title for their single
    /// category.
    pub fn aggregate_title(self) -> &'static str {
        match self {
            Category::Collected => AGGREGATE_COLLECTED_TITLE,
            Category::Exam => AGGREGATE_EXAM_TITLE,
        }
    }

    pub fn of_title(title: &str) -> Category {
        if is_exam_title(title) {
            Category::Exam
        } else {
            Category::Collected
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubjectConfig {
    pub id: String,
    pub subject_type: SubjectType,
    pub max_collected_score: f64,
    pub max_exam_score: f64,
}

impl SubjectConfig {
    /// Constant across all students of the subject.
    pub fn total_max_score(&self) -> f64 {
        match self.subject_type {
            SubjectType::Activity => self.max_collected_score,
            SubjectType::Main => self.max_collected_score + self.max_exam_score,
        }
    }

    pub fn category_cap(&self, category: Category) -> f64 {
        match (self.subject_type, category) {
            (SubjectType::Activity, _) => self.max_collected_score,
            (SubjectType::Main, Category::Collected) => self.max_collected_score,
            (SubjectType::Main, Category::Exam) => self.max_exam_score,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RosterStudent {
    pub id: String,
    pub display_name: String,
    pub classroom_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AssignmentDef {
    pub id: String,
    pub title: String,
    pub max_score: f64,
    pub classroom_id: Option<String>,
    /// Explicit category tag. When absent the title keywords decide.
    pub category: Option<Category>,
}

impl AssignmentDef {
    pub fn is_aggregate(&self) -> bool {
        is_aggregate_title(&self.title)
    }

    pub fn effective_category(&self) -> Category {
        self.category.unwrap_or_else(|| Category::of_title(&self.title))
    }

    /// A scoped assignment only counts for students of that classroom;
    /// unscoped assignments apply to everyone.
    pub fn applies_to_student(&self, student_classroom: Option<&str>) -> bool {
        match self.classroom_id.as_deref() {
            None => true,
            Some(a) => Some(a) == student_classroom,
        }
    }

    /// Visibility under the currently selected classroom scope. No selected
    /// scope sees every assignment.
    pub fn visible_in_scope(&self, scope: Option<&str>) -> bool {
        match (self.classroom_id.as_deref(), scope) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(a), Some(c)) => a == c,
        }
    }
}

/// Transient, pre-save manual total for a category. Validated at input
/// time; never persisted until an explicit save.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualEntry {
    pub student_id: String,
    pub category: Category,
    pub value: f64,
}

/// Everything the engine reads, loaded as one consistent snapshot. The
/// engine itself holds no ambient state and never touches storage.
#[derive(Debug, Clone)]
pub struct SummarySnapshot {
    pub subject: SubjectConfig,
    pub students: Vec<RosterStudent>,
    pub assignments: Vec<AssignmentDef>,
    /// assignment id -> student id -> raw (unclamped) grade.
    pub scores: HashMap<String, HashMap<String, f64>>,
    pub manual_entries: Vec<ManualEntry>,
    /// Selected classroom scope; `None` means all classrooms.
    pub classroom_id: Option<String>,
}

/// Where a category total came from. Makes the manual-override branching an
/// explicit case split instead of a string comparison at each use site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ScoreSource {
    /// Scaled sum of per-assignment records.
    PerAssignment,
    /// Manual aggregate total: an unsaved entry, or the persisted record
    /// under the reserved title.
    ManualAggregate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentDetail {
    pub assignment_id: String,
    pub title: String,
    pub score: f64,
    pub max_score: f64,
    pub is_exam: bool,
    pub percentage: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSummary {
    pub student_id: String,
    pub display_name: String,
    pub classroom_id: Option<String>,
    pub collected_score: f64,
    pub exam_score: f64,
    /// For activity subjects the single category reports through
    /// `collected_source`; `exam_source` stays `PerAssignment`.
    pub collected_source: ScoreSource,
    pub exam_source: ScoreSource,
    pub total_score: f64,
    pub total_max_score: f64,
    pub percentage: i64,
    pub letter_grade: String,
    pub rank: i64,
    pub assignment_details: Vec<AssignmentDetail>,
}

/// Outcome of validating a manual aggregate value against a category cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ManualValue {
    Accepted(f64),
    /// Entered above the cap: the clamped value is accepted, but callers
    /// must surface a warning.
    Clamped { entered: f64, stored: f64 },
}

impl ManualValue {
    pub fn stored(self) -> f64 {
        match self {
            ManualValue::Accepted(v) => v,
            ManualValue::Clamped { stored, .. } => stored,
        }
    }
}

/// Negative or non-finite input is rejected outright (the field is cleared,
/// nothing is stored); input above the cap is clamped and accepted.
pub fn resolve_manual_value(value: f64, cap: f64) -> Result<ManualValue, CalcError> {
    if !value.is_finite() || value < 0.0 {
        return Err(CalcError::new(
            "bad_params",
            "grade must be a non-negative number",
        ));
    }
    if value > cap {
        Ok(ManualValue::Clamped {
            entered: value,
            stored: cap,
        })
    } else {
        Ok(ManualValue::Accepted(value))
    }
}

/// Whether at least one real (non-aggregate) assignment exists for the
/// category under the selected scope. Decides between the aggregator
/// output and the manual-aggregate path, and whether manual entry is open.
pub fn has_real_assignments(
    assignments: &[AssignmentDef],
    subject_type: SubjectType,
    category: Category,
    scope: Option<&str>,
) -> bool {
    assignments.iter().any(|a| {
        if !a.visible_in_scope(scope) || a.is_aggregate() {
            return false;
        }
        match subject_type {
            // Activity subjects have a single category fed by everything.
            SubjectType::Activity => true,
            SubjectType::Main => a.effective_category() == category,
        }
    })
}

/// The engine entry point: aggregate, resolve overrides, classify, rank.
/// Pure over the snapshot; recomputed wholesale, never patched.
pub fn compute_summaries(snap: &SummarySnapshot) -> Vec<StudentSummary> {
    let scope = snap.classroom_id.as_deref();
    let subject_type = snap.subject.subject_type;

    let has_real_collected =
        has_real_assignments(&snap.assignments, subject_type, Category::Collected, scope);
    let has_real_exam =
        has_real_assignments(&snap.assignments, subject_type, Category::Exam, scope);

    let mut manual: HashMap<(String, Category), f64> = HashMap::new();
    for e in &snap.manual_entries {
        manual.insert((e.student_id.clone(), e.category), e.value);
    }

    let mut summaries: Vec<StudentSummary> = snap
        .students
        .iter()
        .filter(|s| match scope {
            None => true,
            Some(c) => s.classroom_id.as_deref() == Some(c),
        })
        .map(|s| summarize_student(snap, s, has_real_collected, has_real_exam, &manual))
        .collect();

    summaries.sort_by(|a, b| {
        b.total_score
            .partial_cmp(&a.total_score)
            .unwrap_or(Ordering::Equal)
    });
    assign_ranks(&mut summaries);
    summaries
}

fn summarize_student(
    snap: &SummarySnapshot,
    student: &RosterStudent,
    has_real_collected: bool,
    has_real_exam: bool,
    manual: &HashMap<(String, Category), f64>,
) -> StudentSummary {
    let subject = &snap.subject;
    let student_class = student.classroom_id.as_deref();

    // (raw sum of clamped scores, raw sum of assignment maxima)
    let mut raw_collected = (0.0_f64, 0.0_f64);
    let mut raw_exam = (0.0_f64, 0.0_f64);
    let mut raw_activity = (0.0_f64, 0.0_f64);
    let mut details: Vec<AssignmentDetail> = Vec::new();

    for a in &snap.assignments {
        if !a.applies_to_student(student_class) {
            continue;
        }
        let raw = snap
            .scores
            .get(&a.id)
            .and_then(|m| m.get(&student.id))
            .copied()
            .unwrap_or(0.0);
        let score = clamp_score(raw, a.max_score);

        match subject.subject_type {
            SubjectType::Activity => {
                raw_activity.0 += score;
                raw_activity.1 += a.max_score;
            }
            SubjectType::Main => match a.effective_category() {
                Category::Exam => {
                    raw_exam.0 += score;
                    raw_exam.1 += a.max_score;
                }
                Category::Collected => {
                    raw_collected.0 += score;
                    raw_collected.1 += a.max_score;
                }
            },
        }

        // Aggregate stand-ins are not real assignments; keep them out of
        // the drill-down list.
        if !a.is_aggregate() {
            details.push(AssignmentDetail {
                assignment_id: a.id.clone(),
                title: a.title.clone(),
                score,
                max_score: a.max_score,
                is_exam: a.effective_category() == Category::Exam,
                percentage: percentage_of(score, a.max_score),
            });
        }
    }

    let total_max_score = subject.total_max_score();
    let collected_score;
    let exam_score;
    let total_score;
    let collected_source;
    let exam_source;

    match subject.subject_type {
        SubjectType::Activity => {
            let source = if has_real_collected {
                ScoreSource::PerAssignment
            } else {
                ScoreSource::ManualAggregate
            };
            total_score = match source {
                ScoreSource::PerAssignment => {
                    scale_to_cap(raw_activity.0, raw_activity.1, subject.max_collected_score)
                }
                ScoreSource::ManualAggregate => manual_aggregate_value(
                    snap,
                    student,
                    Category::Collected,
                    subject.max_collected_score,
                    manual,
                ),
            };
            collected_score = 0.0;
            exam_score = 0.0;
            collected_source = source;
            exam_source = ScoreSource::PerAssignment;
        }
        SubjectType::Main => {
            let (c, c_src) = resolve_category(
                snap,
                student,
                Category::Collected,
                raw_collected,
                subject.max_collected_score,
                has_real_collected,
                manual,
            );
            let (e, e_src) = resolve_category(
                snap,
                student,
                Category::Exam,
                raw_exam,
                subject.max_exam_score,
                has_real_exam,
                manual,
            );
            collected_score = c;
            exam_score = e;
            collected_source = c_src;
            exam_source = e_src;
            total_score = collected_score + exam_score;
        }
    }

    let percentage = percentage_of(total_score, total_max_score);
    StudentSummary {
        student_id: student.id.clone(),
        display_name: student.display_name.clone(),
        classroom_id: student.classroom_id.clone(),
        collected_score,
        exam_score,
        collected_source,
        exam_source,
        total_score,
        total_max_score,
        percentage,
        letter_grade: letter_grade(percentage).to_string(),
        rank: 0,
        assignment_details: details,
    }
}

/// Per-category override resolution: the aggregator output wins whenever
/// real assignments exist; otherwise the manual aggregate path is used and
/// any manual entry for a real-assignment category is ignored entirely.
fn resolve_category(
    snap: &SummarySnapshot,
    student: &RosterStudent,
    category: Category,
    raw: (f64, f64),
    cap: f64,
    has_real: bool,
    manual: &HashMap<(String, Category), f64>,
) -> (f64, ScoreSource) {
    if has_real {
        (scale_to_cap(raw.0, raw.1, cap), ScoreSource::PerAssignment)
    } else {
        (
            manual_aggregate_value(snap, student, category, cap, manual),
            ScoreSource::ManualAggregate,
        )
    }
}

/// Unsaved entry takes precedence over the persisted aggregate record;
/// both are clamped to the cap on use.
fn manual_aggregate_value(
    snap: &SummarySnapshot,
    student: &RosterStudent,
    category: Category,
    cap: f64,
    manual: &HashMap<(String, Category), f64>,
) -> f64 {
    if let Some(v) = manual.get(&(student.id.clone(), category)) {
        return clamp_score(*v, cap);
    }
    persisted_aggregate(snap, student, category)
        .map(|v| clamp_score(v, cap))
        .unwrap_or(0.0)
}

/// The persisted record under the category's reserved title for this
/// student. A record scoped to the student's classroom beats an unscoped
/// one.
fn persisted_aggregate(
    snap: &SummarySnapshot,
    student: &RosterStudent,
    category: Category,
) -> Option<f64> {
    let title = category.aggregate_title();
    let student_class = student.classroom_id.as_deref();
    let mut unscoped: Option<f64> = None;
    for a in &snap.assignments {
        if a.title != title || !a.applies_to_student(student_class) {
            continue;
        }
        let Some(v) = snap.scores.get(&a.id).and_then(|m| m.get(&student.id)) else {
            continue;
        };
        if a.classroom_id.is_some() {
            return Some(*v);
        }
        unscoped = Some(*v);
    }
    unscoped
}

/// Competition rank over summaries already sorted by total descending.
/// Ties share a rank; the next strictly-lower total takes its 1-based list
/// position, so the sequence may skip numbers (90, 90, 70 -> 1, 1, 3).
fn assign_ranks(summaries: &mut [StudentSummary]) {
    let mut rank: i64 = 1;
    for i in 0..summaries.len() {
        if i > 0 && summaries[i].total_score < summaries[i - 1].total_score {
            rank = (i as i64) + 1;
        }
        summaries[i].rank = rank;
    }
}
