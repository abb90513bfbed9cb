//! Parser for the appliance's MikroTik-RouterOS-style CLI output and
//! command echoes.
//!
//! Output is flat `key=value` pairs, whitespace separated, with one record
//! per block and blocks separated by blank lines. Values may be quoted to
//! preserve embedded whitespace. Bracketed sub-expressions such as
//! `copy-from=[find slot=<src>]` must be treated as a single token -- the
//! inner `slot=` belongs to the `find` query, not to the surrounding
//! command, and a naive whitespace split would produce a second, spurious
//! `slot=` token that can shadow the real destination slot. This is a real
//! hazard verified in tests below.

use std::collections::HashMap;

/// Split a single CLI line/command into tokens on whitespace, but treat any
/// text inside `[...]` as part of the enclosing token regardless of
/// whitespace within it.
pub fn tokenize_bracket_aware(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth: u32 = 0;
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '[' if !in_quotes => {
                depth += 1;
                current.push(c);
            }
            ']' if !in_quotes => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ws if ws.is_whitespace() && depth == 0 && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn strip_quotes(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

/// Parse one or more whitespace-separated `key=value` tokens from a line
/// into a map, merging into an existing record (records can span multiple
/// printed lines).
pub fn parse_kv_line(line: &str, record: &mut HashMap<String, String>) {
    for token in tokenize_bracket_aware(line) {
        if let Some((key, value)) = token.split_once('=') {
            record.insert(key.to_string(), strip_quotes(value));
        }
    }
}

/// Parse appliance CLI output into one record per blank-line-delimited
/// block, as produced by `/disk print detail` for wildcard queries.
pub fn parse_blocks(output: &str) -> Vec<HashMap<String, String>> {
    let mut blocks = Vec::new();
    let mut current = HashMap::new();

    for line in output.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        parse_kv_line(line, &mut current);
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

/// Extract the destination `slot=` value from an echoed
/// `/disk add ... copy-from=[find slot=<src>] ... slot=<dest>` command.
///
/// The bracket-aware tokenizer keeps `copy-from=[find slot=<src>]` as a
/// single token, so the embedded `slot=` never surfaces as a standalone
/// token; picking the *last* top-level `slot=` token is then correct and
/// also tolerates appliances that echo `copy-from` after the destination
/// slot.
pub fn extract_destination_slot(command: &str) -> Option<String> {
    tokenize_bracket_aware(command)
        .into_iter()
        .filter_map(|token| {
            token
                .strip_prefix("slot=")
                .map(|v| strip_quotes(v).to_string())
        })
        .next_back()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_simple_command() {
        let tokens = tokenize_bracket_aware("file-path=/vol/a.img file-size=1073741824");
        assert_eq!(tokens, vec!["file-path=/vol/a.img", "file-size=1073741824"]);
    }

    #[test]
    fn tokenizes_bracketed_expression_as_one_token() {
        let tokens = tokenize_bracket_aware("copy-from=[find slot=src-1] slot=dest-1");
        assert_eq!(tokens, vec!["copy-from=[find slot=src-1]", "slot=dest-1"]);
    }

    #[test]
    fn destination_slot_extraction_ignores_embedded_find_slot() {
        let command =
            "/disk add type=file copy-from=[find slot=snap-aaaa] file-path=/vol/b.img slot=pvc-bbbb";
        assert_eq!(
            extract_destination_slot(command).as_deref(),
            Some("pvc-bbbb")
        );
    }

    #[test]
    fn destination_slot_extraction_takes_last_top_level_occurrence() {
        // Defensive case: appliance echoes the destination slot before a
        // trailing restatement -- last one wins.
        let command = "/disk add slot=first-pass copy-from=[find slot=ignored] slot=second-pass";
        assert_eq!(
            extract_destination_slot(command).as_deref(),
            Some("second-pass")
        );
    }

    #[test]
    fn destination_slot_extraction_returns_none_without_slot() {
        let command = "/disk print detail where slot~\"pvc-\"";
        assert_eq!(extract_destination_slot(command), None);
    }

    #[test]
    fn parses_single_block() {
        let output = "slot=pvc-abc file-path=/vol/pvc-abc.img file-size=1073741824 nvme-tcp-export=yes";
        let blocks = parse_blocks(output);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].get("slot").unwrap(), "pvc-abc");
        assert_eq!(blocks[0].get("file-size").unwrap(), "1073741824");
    }

    #[test]
    fn parses_multiple_blocks_separated_by_blank_lines() {
        let output = "slot=pvc-1 file-size=1073741824\n\nslot=pvc-2 file-size=2147483648\n";
        let blocks = parse_blocks(output);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].get("slot").unwrap(), "pvc-1");
        assert_eq!(blocks[1].get("slot").unwrap(), "pvc-2");
    }

    #[test]
    fn preserves_quoted_values_with_spaces() {
        let output = "slot=pvc-abc comment=\"production volume\"";
        let blocks = parse_blocks(output);
        assert_eq!(blocks[0].get("comment").unwrap(), "production volume");
    }

    #[test]
    fn record_can_span_multiple_lines() {
        let output = "slot=pvc-abc\nfile-size=1073741824\nnvme-tcp-export=yes\n";
        let blocks = parse_blocks(output);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len(), 3);
    }

    #[test]
    fn empty_output_yields_no_blocks() {
        assert!(parse_blocks("").is_empty());
        assert!(parse_blocks("\n\n\n").is_empty());
    }
}
