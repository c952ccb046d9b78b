//! Leading comment handling for rendered queries.
//!
//! Query tags and plan hints arrive as comments in front of the SELECT. They
//! are peeled off before the statement is rewritten and put back in front of
//! the rewritten statement unchanged.

const SELECT: &str = "SELECT";

fn starts_with_select(text: &str) -> bool {
    text.len() >= SELECT.len()
        && text.as_bytes()[..SELECT.len()].eq_ignore_ascii_case(SELECT.as_bytes())
}

/// Split `sql` into `(leading_comments, statement)`.
///
/// Line comments, block comments and whitespace are peeled from the front
/// until the remainder starts with SELECT. When something else is in the way,
/// everything before the first case-insensitive `SELECT` counts as the comment
/// block. Concatenating both halves always yields `sql` again.
pub fn split_leading_comments(sql: &str) -> (&str, &str) {
    let mut pos = 0;

    loop {
        let rest = &sql[pos..];
        if rest.trim().is_empty() || starts_with_select(rest) {
            break;
        }

        if rest.starts_with("--") {
            if let Some(newline) = rest.find('\n') {
                pos += newline + 1;
                continue;
            }
        }

        if rest.starts_with("/*") {
            if let Some(end) = rest.find("*/") {
                pos += end + 2;
                continue;
            }
        }

        let whitespace: usize = rest
            .chars()
            .take_while(|c| c.is_whitespace())
            .map(char::len_utf8)
            .sum();
        if whitespace > 0 {
            pos += whitespace;
            continue;
        }

        // ASCII uppercasing keeps byte offsets intact
        if let Some(select) = rest.to_ascii_uppercase().find(SELECT) {
            pos += select;
        }
        break;
    }

    sql.split_at(pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_comments() {
        let sql = "SELECT [i].[ItemId]\nFROM [Item] AS [i]";
        assert_eq!(split_leading_comments(sql), ("", sql));
    }

    #[test]
    fn test_line_comments() {
        let comments = "-- EF query tag\n-- second line\n";
        let select = "SELECT 1\nFROM [Item] AS [i]";
        let sql = format!("{}{}", comments, select);
        assert_eq!(split_leading_comments(&sql), (comments, select));
    }

    #[test]
    fn test_crlf_line_comment() {
        let sql = "-- tag\r\nSELECT 1";
        assert_eq!(split_leading_comments(sql), ("-- tag\r\n", "SELECT 1"));
    }

    #[test]
    fn test_block_comments_and_whitespace() {
        let comments = "/* hint: OPTION(RECOMPILE) */\n  /* second */ \t";
        let select = "select [i].[ItemId]\nFROM [Item] AS [i]";
        let sql = format!("{}{}", comments, select);
        assert_eq!(split_leading_comments(&sql), (comments, select));
    }

    #[test]
    fn test_fallback_to_first_select() {
        let sql = "WITH x AS (SELECT 1) SELECT * FROM x";
        let (comments, rest) = split_leading_comments(sql);
        assert_eq!(comments, "WITH x AS (");
        assert_eq!(rest, "SELECT 1) SELECT * FROM x");
    }

    #[test]
    fn test_unterminated_block_comment_falls_back() {
        let sql = "/* open SELECT 1";
        let (comments, rest) = split_leading_comments(sql);
        assert_eq!(comments, "/* open ");
        assert_eq!(rest, "SELECT 1");
    }

    #[test]
    fn test_round_trip_reconstructs_input() {
        let prefixes = ["", "-- a\n", "/* b */", " \n\t", "-- a\n/* b */\n  -- c\n"];
        for prefix in prefixes {
            let sql = format!("{}SELECT [x].[Id]\nFROM [X] AS [x]", prefix);
            let (comments, statement) = split_leading_comments(&sql);
            assert_eq!(comments, prefix);
            assert_eq!(format!("{}{}", comments, statement), sql);
        }
    }

    #[test]
    fn test_blank_input() {
        assert_eq!(split_leading_comments("   "), ("", "   "));
        assert_eq!(split_leading_comments(""), ("", ""));
    }
}
