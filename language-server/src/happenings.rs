use crate::file_info::ParsingProblem;
use crate::text::Document;
use once_cell::sync::Lazy;
use regex::Regex;
use tower_lsp::lsp_types::Range;

static HAPPENING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:(\d+\.\d*|\d+|\.\d+)\s*:)?\s*(?:(start|end)\s+)?\(\s*([^)]*?)\s*\)\s*(?:#\s*(\d+))?\s*(?:;.*)?$",
    )
    .expect("valid happening pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HappeningType {
    Start,
    End,
    Instantaneous,
}

impl HappeningType {
    pub fn label(self) -> &'static str {
        match self {
            HappeningType::Start => "start",
            HappeningType::End => "end",
            HappeningType::Instantaneous => "instantaneous",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Happening {
    pub time: f64,
    pub action_name: String,
    pub parameters: Vec<String>,
    pub kind: HappeningType,
    /// Tells apart concurrently running invocations of the same action.
    pub counter: u32,
    /// Zero-based source line.
    pub line: u32,
}

impl Happening {
    pub fn full_action_name(&self) -> String {
        std::iter::once(self.action_name.as_str())
            .chain(self.parameters.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn key(&self) -> (String, u32) {
        (self.full_action_name().to_ascii_lowercase(), self.counter)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HappeningsInfo {
    pub happenings: Vec<Happening>,
}

impl HappeningsInfo {
    pub fn makespan(&self) -> f64 {
        self.happenings
            .iter()
            .map(|happening| happening.time)
            .fold(0.0, f64::max)
    }

    pub fn mentions_action(&self, name: &str) -> bool {
        self.happenings
            .iter()
            .any(|happening| happening.action_name.eq_ignore_ascii_case(name))
    }
}

/// Accumulates happenings in file order and checks them as they arrive.
#[derive(Debug)]
pub struct HappeningsBuilder {
    epsilon: f64,
    makespan: f64,
    happenings: Vec<Happening>,
    open_starts: Vec<usize>,
    problems: Vec<ParsingProblem>,
}

impl HappeningsBuilder {
    pub fn new(epsilon: f64) -> Self {
        Self {
            epsilon,
            makespan: 0.0,
            happenings: Vec::new(),
            open_starts: Vec::new(),
            problems: Vec::new(),
        }
    }

    /// Latest time seen so far.
    pub fn makespan(&self) -> f64 {
        self.makespan
    }

    /// Time given to a happening that does not state one.
    pub fn default_time(&self) -> f64 {
        if self.happenings.is_empty() {
            0.0
        } else {
            self.makespan + self.epsilon
        }
    }

    pub fn add(&mut self, happening: Happening, range: Range) {
        if happening.time < self.makespan {
            self.problems.push(ParsingProblem::error(
                format!(
                    "Time must not go backwards: {} is before {}",
                    happening.time, self.makespan
                ),
                range,
            ));
        }

        match happening.kind {
            HappeningType::Start => {
                if self.find_open_start(&happening).is_some() {
                    self.problems.push(ParsingProblem::error(
                        format!(
                            "Action '{}' #{} is already running; use a different counter",
                            happening.full_action_name(),
                            happening.counter
                        ),
                        range,
                    ));
                } else {
                    self.open_starts.push(self.happenings.len());
                }
            }
            HappeningType::End => match self.find_open_start(&happening) {
                Some(position) => {
                    self.open_starts.remove(position);
                }
                None => self.problems.push(ParsingProblem::error(
                    format!(
                        "No matching start for end of '{}' #{}",
                        happening.full_action_name(),
                        happening.counter
                    ),
                    range,
                )),
            },
            HappeningType::Instantaneous => {}
        }

        self.makespan = self.makespan.max(happening.time);
        self.happenings.push(happening);
    }

    pub fn add_problem(&mut self, problem: ParsingProblem) {
        self.problems.push(problem);
    }

    fn find_open_start(&self, happening: &Happening) -> Option<usize> {
        let key = happening.key();
        self.open_starts
            .iter()
            .position(|&index| self.happenings[index].key() == key)
    }

    /// Reports every start still waiting for its end at `end_of_file`.
    pub fn finish(mut self, end_of_file: Range) -> (HappeningsInfo, Vec<ParsingProblem>) {
        for &index in &self.open_starts {
            let start = &self.happenings[index];
            self.problems.push(ParsingProblem::error(
                format!(
                    "Action '{}' #{} started on line {} never ends",
                    start.full_action_name(),
                    start.counter,
                    start.line + 1
                ),
                end_of_file,
            ));
        }
        (
            HappeningsInfo {
                happenings: self.happenings,
            },
            self.problems,
        )
    }
}

/// Parses a `.happenings` file, e.g. `1.5: start (drive t1 a b) #2`.
pub fn parse_happenings(
    document: &Document,
    epsilon: f64,
    problems: &mut Vec<ParsingProblem>,
) -> HappeningsInfo {
    let mut builder = HappeningsBuilder::new(epsilon);

    for line_number in 0..document.line_count() {
        let (Some(line), Some(span)) = (document.line(line_number), document.line_span(line_number))
        else {
            continue;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') {
            continue;
        }
        let range = document.range_of(span);

        let parsed = HAPPENING.captures(line).and_then(|caps| {
            let mut words = caps[3].split_whitespace().map(str::to_string);
            let action_name = words.next()?;
            let kind = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
                Some(word) if word == "start" => HappeningType::Start,
                Some(_) => HappeningType::End,
                None => HappeningType::Instantaneous,
            };
            Some(Happening {
                time: caps
                    .get(1)
                    .and_then(|m| m.as_str().parse::<f64>().ok())
                    .unwrap_or_else(|| builder.default_time()),
                action_name,
                parameters: words.collect(),
                kind,
                counter: caps
                    .get(4)
                    .and_then(|m| m.as_str().parse::<u32>().ok())
                    .unwrap_or(0),
                line: line_number as u32,
            })
        });

        match parsed {
            Some(happening) => builder.add(happening, range),
            None => builder.add_problem(ParsingProblem::error(
                format!("Invalid happening: {}", trimmed),
                range,
            )),
        }
    }

    let end = document.end_position();
    let (info, found) = builder.finish(Range { start: end, end });
    problems.extend(found);
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> (HappeningsInfo, Vec<ParsingProblem>) {
        let mut problems = Vec::new();
        let info = parse_happenings(&Document::new(text), 0.001, &mut problems);
        (info, problems)
    }

    #[test]
    fn matched_start_and_end_are_clean() {
        let (info, problems) = parse("0: start (drive)\n1: end (drive)");
        assert!(problems.is_empty());
        assert_eq!(info.happenings.len(), 2);
        assert_eq!(info.happenings[0].kind, HappeningType::Start);
        assert_eq!(info.happenings[1].kind, HappeningType::End);
        assert_eq!(info.makespan(), 1.0);
    }

    #[test]
    fn reports_start_without_end_at_end_of_file() {
        let text = "0: start (drive)";
        let (_, problems) = parse(text);
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].range.start, Document::new(text).end_position());
    }

    #[test]
    fn reports_end_without_start() {
        let (_, problems) = parse("0: (load a)\n1: end (drive t1)");
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].range.start.line, 1);
    }

    #[test]
    fn counters_allow_concurrent_duplicates() {
        let (info, problems) = parse(
            "0: start (drive t1)\n0: start (drive t1) #1\n2: end (drive t1) #1\n3: end (drive t1)",
        );
        assert!(problems.is_empty());
        assert_eq!(info.happenings[1].counter, 1);
    }

    #[test]
    fn rejects_duplicate_open_start() {
        let (_, problems) = parse("0: start (drive)\n1: start (drive)\n2: end (drive)");
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].range.start.line, 1);
    }

    #[test]
    fn rejects_time_going_backwards() {
        let (_, problems) = parse("5: (a)\n3: (b)");
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].range.start.line, 1);
    }

    #[test]
    fn untimed_happenings_follow_makespan() {
        let (info, problems) = parse("; trace\n(a)\n2: (b)\n(c)\n\ngarbage");
        assert_eq!(info.happenings[0].time, 0.0);
        assert!((info.happenings[2].time - 2.001).abs() < 1e-9);
        assert_eq!(problems.len(), 1);
        assert!(info.mentions_action("C"));
    }
}
