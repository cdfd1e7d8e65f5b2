use crate::file_info::{parse_typed_list, ParsingProblem, TypeObjects, TypedEntry};
use crate::syntax::{SyntaxNode, SyntaxTree};
use crate::text::Document;
use std::ops::Range as Span;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitValue {
    Bool(bool),
    Number(f64),
}

/// A grounded atom such as `(distance a b)`.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundAtom {
    pub name: String,
    pub arguments: Vec<String>,
    pub span: Span<usize>,
}

impl GroundAtom {
    /// `name arg1 arg2`, the form used as a variable name.
    pub fn full_name(&self) -> String {
        std::iter::once(self.name.as_str())
            .chain(self.arguments.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The four shapes an `:init` entry can take.
#[derive(Debug, Clone, PartialEq)]
pub enum InitEntry {
    /// `(pred a b)` or `(not (pred a b))`
    Literal { atom: GroundAtom, positive: bool },
    /// `(= (func a b) 3.5)`
    FluentAssign { atom: GroundAtom, value: f64 },
    /// `(at 12 (pred a b))`
    TimedLiteral { time: f64, atom: GroundAtom, positive: bool },
    /// `(at 12 (= (func a b) 3.5))`
    TimedFluent { time: f64, atom: GroundAtom, value: f64 },
}

impl InitEntry {
    pub fn atom(&self) -> &GroundAtom {
        match self {
            InitEntry::Literal { atom, .. }
            | InitEntry::FluentAssign { atom, .. }
            | InitEntry::TimedLiteral { atom, .. }
            | InitEntry::TimedFluent { atom, .. } => atom,
        }
    }

    pub fn to_timed_value(&self) -> TimedVariableValue {
        let (time, value) = match self {
            InitEntry::Literal { positive, .. } => (0.0, InitValue::Bool(*positive)),
            InitEntry::FluentAssign { value, .. } => (0.0, InitValue::Number(*value)),
            InitEntry::TimedLiteral { time, positive, .. } => (*time, InitValue::Bool(*positive)),
            InitEntry::TimedFluent { time, value, .. } => (*time, InitValue::Number(*value)),
        };
        TimedVariableValue {
            time,
            variable_name: self.atom().full_name(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimedVariableValue {
    pub time: f64,
    pub variable_name: String,
    pub value: InitValue,
}

impl TimedVariableValue {
    /// The lifted name, e.g. `distance` for `distance a b`.
    pub fn lifted_name(&self) -> &str {
        self.variable_name
            .split_whitespace()
            .next()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProblemSections {
    pub objects: Option<Span<usize>>,
    pub init: Option<Span<usize>>,
    pub goal: Option<Span<usize>>,
    pub metric: Option<Span<usize>>,
}

#[derive(Debug)]
pub struct ProblemInfo {
    pub name: String,
    pub domain_name: String,
    pub domain_name_span: Span<usize>,
    pub objects: Vec<TypeObjects>,
    pub object_entries: Vec<TypedEntry>,
    pub init_entries: Vec<InitEntry>,
    pub inits: Vec<TimedVariableValue>,
    pub sections: ProblemSections,
    /// Text produced by a pre-processor, when the file declared one.
    pub preprocessed_text: Option<String>,
}

impl ProblemInfo {
    pub fn is_for_domain(&self, domain_name: &str) -> bool {
        self.domain_name.eq_ignore_ascii_case(domain_name)
    }

    pub fn object_type(&self, object: &str) -> Option<&str> {
        TypeObjects::type_of(&self.objects, object)
    }
}

/// Parses `(define (problem ...) (:domain ...) ...)`. Returns `None` when
/// either header part is missing.
pub fn try_problem(
    document: &Document,
    tree: &SyntaxTree,
    problems: &mut Vec<ParsingProblem>,
) -> Option<ProblemInfo> {
    let define = tree.get_define_node()?;
    let header = tree.child_brackets_named(define, "problem").next()?;
    let domain_ref = tree.child_brackets_named(define, ":domain").next()?;

    let name = first_terminal_text(tree, header).unwrap_or_default();
    let domain_node = tree
        .arguments(domain_ref)
        .into_iter()
        .find(|node| node.is_terminal());
    let domain_name = domain_node
        .map(|node| tree.node_text(node).to_string())
        .unwrap_or_default();
    if domain_name.is_empty() {
        problems.push(ParsingProblem::error(
            "Domain name is missing",
            document.range_of(domain_ref.span.clone()),
        ));
    }

    let mut problem = ProblemInfo {
        name,
        domain_name,
        domain_name_span: domain_node
            .map(|node| node.span.clone())
            .unwrap_or(domain_ref.span.clone()),
        objects: Vec::new(),
        object_entries: Vec::new(),
        init_entries: Vec::new(),
        inits: Vec::new(),
        sections: ProblemSections::default(),
        preprocessed_text: None,
    };

    for section in tree.significant_children(define).filter(|node| node.is_bracket()) {
        let Some(keyword) = tree.name(section).map(str::to_ascii_lowercase) else {
            continue;
        };
        match keyword.as_str() {
            ":objects" => {
                problem.sections.objects = Some(section.span.clone());
                problem.object_entries = parse_typed_list(tree, &tree.arguments(section));
                problem.objects = TypeObjects::group(&problem.object_entries);
            }
            ":init" => {
                problem.sections.init = Some(section.span.clone());
                for node in tree.arguments(section).into_iter().filter(|node| node.is_bracket()) {
                    match parse_init_entry(tree, node) {
                        Some(entry) => problem.init_entries.push(entry),
                        None => problems.push(ParsingProblem::warning(
                            format!(
                                "Unrecognized initial state entry: {}",
                                tree.node_text(node).trim()
                            ),
                            document.range_of(node.span.clone()),
                        )),
                    }
                }
                problem.inits = problem
                    .init_entries
                    .iter()
                    .map(InitEntry::to_timed_value)
                    .collect();
            }
            ":goal" => problem.sections.goal = Some(section.span.clone()),
            ":metric" => problem.sections.metric = Some(section.span.clone()),
            _ => {}
        }
    }

    Some(problem)
}

fn first_terminal_text(tree: &SyntaxTree, node: &SyntaxNode) -> Option<String> {
    tree.arguments(node)
        .into_iter()
        .find(|child| child.is_terminal())
        .map(|child| tree.node_text(child).to_string())
}

fn parse_init_entry(tree: &SyntaxTree, node: &SyntaxNode) -> Option<InitEntry> {
    let name = tree.name(node)?;
    let arguments = tree.arguments(node);

    if name.eq_ignore_ascii_case("at") && arguments.len() == 2 && arguments[1].is_bracket() {
        if let Ok(time) = tree.node_text(arguments[0]).parse::<f64>() {
            return match parse_init_entry(tree, arguments[1])? {
                InitEntry::Literal { atom, positive } => Some(InitEntry::TimedLiteral {
                    time,
                    atom,
                    positive,
                }),
                InitEntry::FluentAssign { atom, value } => {
                    Some(InitEntry::TimedFluent { time, atom, value })
                }
                _ => None,
            };
        }
    }

    if name == "=" {
        let atom = arguments
            .first()
            .filter(|node| node.is_bracket())
            .and_then(|node| parse_atom(tree, node))?;
        let value = arguments
            .get(1)
            .filter(|node| node.is_terminal())
            .and_then(|node| tree.node_text(node).parse::<f64>().ok())?;
        return Some(InitEntry::FluentAssign { atom, value });
    }

    if name.eq_ignore_ascii_case("not") {
        let atom = arguments
            .first()
            .filter(|node| node.is_bracket())
            .and_then(|node| parse_atom(tree, node))?;
        return Some(InitEntry::Literal {
            atom,
            positive: false,
        });
    }

    let atom = parse_atom(tree, node)?;
    Some(InitEntry::Literal {
        atom,
        positive: true,
    })
}

fn parse_atom(tree: &SyntaxTree, node: &SyntaxNode) -> Option<GroundAtom> {
    let name_node = tree.name_node(node)?;
    let arguments = tree.arguments(node);
    if arguments.iter().any(|argument| !argument.is_terminal()) {
        return None;
    }
    Some(GroundAtom {
        name: tree.node_text(name_node).to_string(),
        arguments: arguments
            .into_iter()
            .map(|argument| tree.node_text(argument).to_string())
            .collect(),
        span: name_node.span.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> (Option<ProblemInfo>, Vec<ParsingProblem>) {
        let document = Document::new(text);
        let tree = SyntaxTree::build(text);
        let mut problems = Vec::new();
        let problem = try_problem(&document, &tree, &mut problems);
        (problem, problems)
    }

    #[test]
    fn parses_header_and_objects() {
        let (problem, problems) = parse(
            "(define (problem p1) (:domain Logistics)\n (:objects a b - loc t1 - truck)\n (:goal (at t1 b)))",
        );
        let problem = problem.unwrap();
        assert!(problems.is_empty());
        assert_eq!(problem.name, "p1");
        assert_eq!(problem.domain_name, "Logistics");
        assert!(problem.is_for_domain("logistics"));
        assert_eq!(problem.objects.len(), 2);
        assert_eq!(problem.object_type("t1"), Some("truck"));
        assert!(problem.sections.goal.is_some());
    }

    #[test]
    fn parses_numeric_fluent_assignments() {
        let (problem, _) = parse(
            "(define (problem p) (:domain d) (:init (= (distance A B) 13) (= (distance B A) 13)))",
        );
        let inits = problem.unwrap().inits;
        assert_eq!(inits.len(), 2);
        assert!(inits.iter().all(|init| init.time == 0.0));
        assert!(inits.iter().all(|init| init.value == InitValue::Number(13.0)));
        assert_eq!(inits[0].variable_name, "distance A B");
        assert_eq!(inits[1].lifted_name(), "distance");
    }

    #[test]
    fn distinguishes_the_four_init_shapes() {
        let (problem, problems) = parse(
            r#"(define (problem p) (:domain d)
  (:init
    (at truck depot)
    (= (fuel truck) 3.5)
    (at 12 (open depot))
    (at 12.5 (not (open depot)))
    (at 20 (= (fuel truck) 10))))"#,
        );
        assert!(problems.is_empty());
        let problem = problem.unwrap();
        let entries = &problem.init_entries;
        assert!(matches!(entries[0], InitEntry::Literal { positive: true, .. }));
        assert_eq!(entries[0].atom().full_name(), "at truck depot");
        assert!(matches!(entries[1], InitEntry::FluentAssign { value, .. } if value == 3.5));
        assert!(matches!(entries[2], InitEntry::TimedLiteral { time, positive: true, .. } if time == 12.0));
        assert!(matches!(entries[3], InitEntry::TimedLiteral { positive: false, .. }));
        assert!(matches!(entries[4], InitEntry::TimedFluent { time, value, .. } if time == 20.0 && value == 10.0));

        assert_eq!(problem.inits[3].value, InitValue::Bool(false));
        assert_eq!(problem.inits[4].time, 20.0);
    }

    #[test]
    fn requires_domain_reference() {
        let (problem, _) = parse("(define (problem p) (:objects a))");
        assert!(problem.is_none());
    }

    #[test]
    fn reports_unrecognized_init_entries() {
        let (problem, problems) = parse("(define (problem p) (:domain d) (:init (= (f a) (g b))))");
        assert!(problem.unwrap().inits.is_empty());
        assert_eq!(problems.len(), 1);
    }
}
