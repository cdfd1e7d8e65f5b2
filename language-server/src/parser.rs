use crate::config::{PreprocessorSettings, Settings};
use crate::domain::try_domain;
use crate::file_info::{FileInfo, FileKind, FileStatus, ParsingProblem};
use crate::happenings::parse_happenings;
use crate::plan::parse_plan;
use crate::preprocess::parse_meta;
use crate::problem::try_problem;
use crate::syntax::SyntaxTree;
use crate::text::Document;
use tower_lsp::lsp_types::{Position, Range, Url};

/// How a file is parsed, decided by its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Pddl,
    Plan,
    Happenings,
}

impl FileFormat {
    pub fn of(uri: &Url) -> Self {
        let path = uri.path().to_ascii_lowercase();
        if path.ends_with(".plan") {
            FileFormat::Plan
        } else if path.ends_with(".happenings") {
            FileFormat::Happenings
        } else {
            FileFormat::Pddl
        }
    }

    pub fn is_supported(uri: &Url) -> bool {
        let path = uri.path().to_ascii_lowercase();
        [".pddl", ".plan", ".happenings"]
            .iter()
            .any(|extension| path.ends_with(extension))
    }
}

/// Turns raw text into a [`FileInfo`].
///
/// Parsing never fails; malformed text produces a best-effort structure plus
/// parsing problems.
#[derive(Debug, Clone)]
pub struct PddlParser {
    epsilon: f64,
    preprocessor: PreprocessorSettings,
}

impl Default for PddlParser {
    fn default() -> Self {
        Self::new(&Settings::default())
    }
}

impl PddlParser {
    pub fn new(settings: &Settings) -> Self {
        Self {
            epsilon: settings.epsilon,
            preprocessor: settings.preprocessor.clone(),
        }
    }

    pub fn parse(&self, uri: &Url, version: i32, text: &str) -> FileInfo {
        let document = Document::new(text);
        let mut problems = Vec::new();

        let (syntax_tree, kind) = match FileFormat::of(uri) {
            FileFormat::Plan => (
                SyntaxTree::build(text),
                FileKind::Plan(parse_plan(&document, self.epsilon, &mut problems)),
            ),
            FileFormat::Happenings => (
                SyntaxTree::build(text),
                FileKind::Happenings(parse_happenings(&document, self.epsilon, &mut problems)),
            ),
            FileFormat::Pddl => self.parse_pddl(uri, &document, &mut problems),
        };

        tracing::debug!(
            "Parsed {} v{} as {} with {} problem(s)",
            uri,
            version,
            kind.label(),
            problems.len()
        );

        FileInfo {
            uri: uri.clone(),
            version,
            document,
            syntax_tree,
            status: FileStatus::Parsed,
            problems,
            kind,
        }
    }

    fn parse_pddl(
        &self,
        uri: &Url,
        document: &Document,
        problems: &mut Vec<ParsingProblem>,
    ) -> (SyntaxTree, FileKind) {
        let Some(meta) = parse_meta(document.text()) else {
            let tree = SyntaxTree::build(document.text());
            let kind = classify(document, &tree, problems);
            return (tree, kind);
        };

        let working_dir = uri
            .to_file_path()
            .ok()
            .and_then(|path| path.parent().map(|dir| dir.to_path_buf()))
            .filter(|dir| dir.is_dir());
        let transformed = meta.and_then(|preprocessor| {
            preprocessor.transform(document.text(), working_dir.as_deref(), &self.preprocessor)
        });

        match transformed {
            Ok(output) => {
                // Structure comes from the generated text. Its positions mean
                // nothing in the template, so problems go on the meta line.
                let generated = Document::new(output.as_str());
                let tree = SyntaxTree::build(&output);
                let mut generated_problems = Vec::new();
                let mut kind = classify(&generated, &tree, &mut generated_problems);
                let meta_line = line_range(document, 0);
                problems.extend(generated_problems.into_iter().map(|problem| ParsingProblem {
                    message: format!(
                        "{} (pre-processed output, line {})",
                        problem.message,
                        problem.range.start.line + 1
                    ),
                    range: meta_line,
                    ..problem
                }));
                if let FileKind::Problem(problem) = &mut kind {
                    problem.preprocessed_text = Some(output);
                }
                (SyntaxTree::build(document.text()), kind)
            }
            Err(err) => {
                tracing::warn!("Pre-processing {} failed: {}", uri, err);
                let line = err.line().unwrap_or(0);
                problems.push(ParsingProblem::error(err.to_string(), line_range(document, line)));
                (SyntaxTree::build(document.text()), FileKind::Unknown)
            }
        }
    }
}

/// The whole of `line`, or an empty range at its start past the end.
pub(crate) fn line_range(document: &Document, line: u32) -> Range {
    let start = Position::new(line, 0);
    let end = document
        .line_span(line as usize)
        .map(|span| document.position_at(span.end))
        .unwrap_or(start);
    Range { start, end }
}

fn classify(document: &Document, tree: &SyntaxTree, problems: &mut Vec<ParsingProblem>) -> FileKind {
    report_bracket_problems(document, tree, problems);
    if let Some(domain) = try_domain(document, tree, problems) {
        FileKind::Domain(domain)
    } else if let Some(problem) = try_problem(document, tree, problems) {
        FileKind::Problem(problem)
    } else {
        FileKind::Unknown
    }
}

fn report_bracket_problems(document: &Document, tree: &SyntaxTree, problems: &mut Vec<ParsingProblem>) {
    for node in tree.unclosed_brackets() {
        let start = document.position_at(node.span.start);
        problems.push(ParsingProblem::error(
            "Missing closing bracket",
            Range {
                start,
                end: document.position_at(node.span.start + 1),
            },
        ));
    }
    for node in tree.stray_closing_brackets() {
        problems.push(ParsingProblem::error(
            "Unexpected closing bracket",
            document.range_of(node.span.clone()),
        ));
    }
}
