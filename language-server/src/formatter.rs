use crate::syntax::{tokenize, TokenKind};

const INDENT: &str = "    ";

/// Re-indents PDDL text by bracket depth, four spaces per level.
///
/// Only leading and trailing whitespace of each line changes; brackets inside
/// `;` comments are ignored and blank lines are kept.
pub fn format_document(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut indent_level: usize = 0;

    for segment in text.split_inclusive('\n') {
        let (line, has_newline) = if let Some(stripped) = segment.strip_suffix('\n') {
            (stripped.strip_suffix('\r').unwrap_or(stripped), true)
        } else {
            (segment, false)
        };

        let normalized = line.trim();
        if normalized.is_empty() {
            if has_newline {
                result.push('\n');
            }
            continue;
        }

        let (leading_closes, delta) = bracket_delta(normalized);
        let line_level = indent_level.saturating_sub(leading_closes);
        result.push_str(&INDENT.repeat(line_level));
        result.push_str(normalized);
        if has_newline {
            result.push('\n');
        }

        indent_level = ((indent_level as isize) + delta).max(0) as usize;
    }

    if !result.is_empty() && !result.ends_with('\n') {
        result.push('\n');
    }

    result
}

/// Number of `)` before anything else on the line, and the net bracket
/// change across the line.
fn bracket_delta(line: &str) -> (usize, isize) {
    let mut leading_closes = 0;
    let mut seen_other = false;
    let mut delta: isize = 0;

    for token in tokenize(line) {
        match token.kind {
            TokenKind::OpenBracket => {
                seen_other = true;
                delta += 1;
            }
            TokenKind::CloseBracket => {
                if !seen_other {
                    leading_closes += 1;
                }
                delta -= 1;
            }
            TokenKind::Whitespace | TokenKind::Comment => {}
            _ => seen_other = true,
        }
    }

    (leading_closes, delta)
}

#[cfg(test)]
mod tests {
    use super::format_document;

    #[test]
    fn indents_by_bracket_depth() {
        let source = "(define (domain d)\n(:predicates\n(at ?x)\n)\n)\n";
        let expected = "(define (domain d)\n    (:predicates\n        (at ?x)\n    )\n)\n";
        assert_eq!(format_document(source), expected);
    }

    #[test]
    fn ignores_brackets_in_comments() {
        let source = "(define ; (((\n  (domain d))\n";
        let expected = "(define ; (((\n    (domain d))\n";
        assert_eq!(format_document(source), expected);
    }

    #[test]
    fn keeps_blank_lines_and_trims_trailing_space() {
        let source = "(define   \n\n      (domain d)\n)";
        let expected = "(define\n\n    (domain d)\n)\n";
        assert_eq!(format_document(source), expected);
    }

    #[test]
    fn tolerates_unbalanced_text() {
        let source = "))\n(at ?x\n?y";
        let expected = "))\n(at ?x\n    ?y\n";
        assert_eq!(format_document(source), expected);
    }
}
