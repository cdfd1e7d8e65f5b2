use crate::file_info::ParsingProblem;
use crate::text::Document;
use once_cell::sync::Lazy;
use regex::Regex;

pub const DOMAIN_META: &str = ";;!domain:";
pub const PROBLEM_META: &str = ";;!problem:";

static PLAN_STEP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:(\d+\.\d*|\d+|\.\d+)\s*:)?\s*\(\s*([^)]*?)\s*\)\s*(?:\[\s*(\d+\.\d*|\d+|\.\d+)\s*\])?\s*(?:;.*)?$",
    )
    .expect("valid plan step pattern")
});

#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    pub time: f64,
    pub action_name: String,
    pub parameters: Vec<String>,
    pub duration: Option<f64>,
    /// Zero-based source line.
    pub line: u32,
}

impl PlanStep {
    pub fn end_time(&self) -> f64 {
        self.time + self.duration.unwrap_or(0.0)
    }

    /// `name arg1 arg2`
    pub fn full_action_name(&self) -> String {
        std::iter::once(self.action_name.as_str())
            .chain(self.parameters.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanInfo {
    /// From a `;;!domain: name` meta comment.
    pub domain_name: Option<String>,
    /// From a `;;!problem: name` meta comment.
    pub problem_name: Option<String>,
    pub steps: Vec<PlanStep>,
}

impl PlanInfo {
    pub fn makespan(&self) -> f64 {
        self.steps
            .iter()
            .map(PlanStep::end_time)
            .fold(0.0, f64::max)
    }

    pub fn mentions_action(&self, name: &str) -> bool {
        self.steps
            .iter()
            .any(|step| step.action_name.eq_ignore_ascii_case(name))
    }
}

/// Parses a `.plan` file line by line.
///
/// Steps without an explicit time start `epsilon` after the previous step
/// ends; the first one starts at zero.
pub fn parse_plan(document: &Document, epsilon: f64, problems: &mut Vec<ParsingProblem>) -> PlanInfo {
    let mut plan = PlanInfo::default();
    let mut previous_end: Option<f64> = None;

    for line_number in 0..document.line_count() {
        let Some(line) = document.line(line_number) else {
            continue;
        };
        let trimmed = line.trim();
        if let Some(name) = trimmed.strip_prefix(DOMAIN_META) {
            plan.domain_name = Some(name.trim().to_string());
            continue;
        }
        if let Some(name) = trimmed.strip_prefix(PROBLEM_META) {
            plan.problem_name = Some(name.trim().to_string());
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with(';') {
            continue;
        }

        let Some(caps) = PLAN_STEP.captures(line) else {
            if let Some(span) = document.line_span(line_number) {
                problems.push(ParsingProblem::warning(
                    format!("Invalid plan step: {}", trimmed),
                    document.range_of(span),
                ));
            }
            continue;
        };

        let mut words = caps[2].split_whitespace().map(str::to_string);
        let Some(action_name) = words.next() else {
            continue;
        };
        let time = match caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) {
            Some(time) => time,
            None => previous_end.map(|end| end + epsilon).unwrap_or(0.0),
        };
        let step = PlanStep {
            time,
            action_name,
            parameters: words.collect(),
            duration: caps.get(3).and_then(|m| m.as_str().parse::<f64>().ok()),
            line: line_number as u32,
        };
        previous_end = Some(step.end_time());
        plan.steps.push(step);
    }

    plan
}
