//! Splitting of migration SQL into individual statements.
//!
//! Schema revisions carry free-form SQL that may contain several statements.
//! Neither backend's client executes multi-statement strings inside a
//! transaction the way we need, so the store splits on bare `;` terminators
//! while respecting string literals and comments.

/// Splits `sql` into trimmed, non-empty statements in source order.
///
/// `;` inside `'...'` (with `''` as an embedded quote), `"..."`, `--` line
/// comments, and `/* ... */` block comments does not terminate a statement.
/// Runs of consecutive terminators count as one.
pub fn split_statements(sql: &str) -> Vec<String> {
    #[derive(PartialEq)]
    enum State {
        Normal,
        SingleQuote,
        DoubleQuote,
        LineComment,
        BlockComment,
    }

    let mut statements = Vec::new();
    let mut current = String::new();
    let mut state = State::Normal;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                ';' => {
                    let stmt = current.trim();
                    if !stmt.is_empty() {
                        statements.push(stmt.to_string());
                    }
                    current.clear();
                }
                '\'' => {
                    state = State::SingleQuote;
                    current.push(c);
                }
                '"' => {
                    state = State::DoubleQuote;
                    current.push(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    state = State::LineComment;
                    current.push(c);
                    current.push(chars.next().unwrap());
                }
                '/' if chars.peek() == Some(&'*') => {
                    state = State::BlockComment;
                    current.push(c);
                    current.push(chars.next().unwrap());
                }
                _ => current.push(c),
            },
            State::SingleQuote => {
                current.push(c);
                if c == '\'' {
                    // An immediately following quote is an escaped quote, not
                    // the end of the literal.
                    if chars.peek() == Some(&'\'') {
                        current.push(chars.next().unwrap());
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::DoubleQuote => {
                current.push(c);
                if c == '"' {
                    state = State::Normal;
                }
            }
            State::LineComment => {
                current.push(c);
                if c == '\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment => {
                current.push(c);
                if c == '/' && current.ends_with("*/") {
                    state = State::Normal;
                }
            }
        }
    }

    let stmt = current.trim();
    if !stmt.is_empty() {
        statements.push(stmt.to_string());
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn splits_plain_statements() {
        let stmts = split_statements("CREATE TABLE a (x INT); CREATE TABLE b (y INT);");
        assert_eq!(stmts, vec!["CREATE TABLE a (x INT)", "CREATE TABLE b (y INT)"]);
    }

    #[test]
    fn semicolon_in_single_quotes_does_not_terminate() {
        let stmts = split_statements("SELECT 'a;b'; -- c;d\nSELECT 2;");
        assert_eq!(stmts, vec!["SELECT 'a;b'", "-- c;d\nSELECT 2"]);
    }

    #[test]
    fn escaped_single_quote_stays_inside_the_literal() {
        let stmts = split_statements("SELECT 'it''s; fine'; SELECT 1;");
        assert_eq!(stmts, vec!["SELECT 'it''s; fine'", "SELECT 1"]);
    }

    #[test]
    fn semicolon_in_double_quotes_does_not_terminate() {
        let stmts = split_statements("SELECT \"a;b\" FROM t; SELECT 1;");
        assert_eq!(stmts, vec!["SELECT \"a;b\" FROM t", "SELECT 1"]);
    }

    #[test]
    fn block_comments_hide_terminators() {
        let stmts = split_statements("SELECT /* one; two; */ 1; SELECT 2;");
        assert_eq!(stmts, vec!["SELECT /* one; two; */ 1", "SELECT 2"]);
    }

    #[test]
    fn consecutive_terminators_count_as_one() {
        let stmts = split_statements("CREATE TABLE t (x INT);;CREATE INDEX i ON t (x);");
        assert_eq!(
            stmts,
            vec!["CREATE TABLE t (x INT)", "CREATE INDEX i ON t (x)"]
        );
    }

    #[test]
    fn preserves_internal_newlines() {
        let stmts = split_statements("CREATE TABLE t (\n    x INT,\n    y INT\n);");
        assert_eq!(stmts, vec!["CREATE TABLE t (\n    x INT,\n    y INT\n)"]);
    }

    #[test]
    fn empty_and_whitespace_input_yield_nothing() {
        assert!(split_statements("").is_empty());
        assert!(split_statements(" \n\t ;;; \n").is_empty());
    }

    #[test]
    fn trailing_statement_without_terminator_is_kept() {
        let stmts = split_statements("SELECT 1; SELECT 2");
        assert_eq!(stmts, vec!["SELECT 1", "SELECT 2"]);
    }

    #[test]
    fn splitting_is_idempotent() {
        let inputs = [
            "SELECT 'a;b'; -- c;d\nSELECT 2;",
            "CREATE TABLE t (x INT);;CREATE INDEX i ON t (x);",
            "SELECT /* a; */ 1;\nSELECT 'x''y';",
        ];
        for input in inputs {
            let once = split_statements(input);
            let rejoined = once.join(";\n");
            let twice = split_statements(&rejoined);
            assert_eq!(once, twice);
        }
    }
}
