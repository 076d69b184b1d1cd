//! Axis-labels spec strings: parsing and canonical re-printing.
//!
//! A slot spec names the axes of one operand: `batch | input -> output`.
//! The `|` and `->` separators are optional; a missing section stands for a
//! broadcast row. Leading `...` injects a row variable on that kind, `_`
//! consumes an axis without naming it. Einsum forms separate the result with
//! `=>` and binary operands with `;` (`"rhs1;rhs2=>lhs"`). The unicode arrows
//! `→` and `⇒` are accepted as synonyms.

use super::ShapeError;

/// One named or anonymous axis slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxisLabel {
    Label(String),
    /// `_`: consumes an axis without producing a label.
    Placeholder,
}

/// The parsed labels of one axis kind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KindSection {
    /// Leading `...`: the kind extends to the left by a row variable.
    pub ellipsis: bool,
    pub labels: Vec<AxisLabel>,
}

impl KindSection {
    fn broadcast() -> KindSection {
        KindSection { ellipsis: true, labels: vec![] }
    }
}

/// The parsed labels of one operand slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSlot {
    pub batch: KindSection,
    pub input: KindSection,
    pub output: KindSection,
}

fn is_multichar(spec: &str) -> bool {
    spec.chars().any(|c| c == ',' || c == '(' || c == ')' || c.is_whitespace())
}

fn parse_section(section: &str, multichar: bool, spec: &str) -> Result<KindSection, ShapeError> {
    let mut out = KindSection::default();
    let tokens: Vec<String> = if multichar {
        section
            .split(|c: char| c == ',' || c == '(' || c == ')' || c.is_whitespace())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect()
    } else {
        // Single-character mode: every char is a token, with `...` and `…`
        // recognized as the ellipsis.
        let mut tokens = Vec::new();
        let mut rest = section;
        while !rest.is_empty() {
            if let Some(tail) = rest.strip_prefix("...") {
                tokens.push("...".to_string());
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix('…') {
                tokens.push("...".to_string());
                rest = tail;
            } else {
                let c = rest.chars().next().unwrap();
                tokens.push(c.to_string());
                rest = &rest[c.len_utf8()..];
            }
        }
        tokens
    };
    for (n, token) in tokens.iter().enumerate() {
        match token.as_str() {
            "..." | "…" => {
                if n != 0 {
                    return Err(ShapeError::new(format!(
                        "axis labels \"{spec}\": `...` must lead its section"
                    )));
                }
                out.ellipsis = true;
            }
            "_" => out.labels.push(AxisLabel::Placeholder),
            label => out.labels.push(AxisLabel::Label(label.to_string())),
        }
    }
    Ok(out)
}

/// Parses one operand slot.
pub fn parse_slot(spec: &str) -> Result<ParsedSlot, ShapeError> {
    parse_slot_mode(spec, is_multichar(spec))
}

fn split_arrow(s: &str) -> Option<(&str, &str)> {
    if let Some(at) = s.find("->") {
        return Some((&s[..at], &s[at + 2..]));
    }
    s.find('→').map(|at| (&s[..at], &s[at + '→'.len_utf8()..]))
}

fn parse_slot_mode(spec: &str, multichar: bool) -> Result<ParsedSlot, ShapeError> {
    let (batch_part, rest) = match spec.find('|') {
        Some(at) => (Some(&spec[..at]), &spec[at + 1..]),
        None => (None, spec),
    };
    let (input_part, output_part) = match split_arrow(rest) {
        Some((i, o)) => (Some(i), o),
        None => (None, rest),
    };
    let batch = match batch_part {
        Some(s) => parse_section(s, multichar, spec)?,
        None => KindSection::broadcast(),
    };
    let input = match input_part {
        Some(s) => parse_section(s, multichar, spec)?,
        None => KindSection::broadcast(),
    };
    let output = parse_section(output_part, multichar, spec)?;
    Ok(ParsedSlot { batch, input, output })
}

fn split_fat_arrow(s: &str) -> Option<(&str, &str)> {
    if let Some(at) = s.find("=>") {
        return Some((&s[..at], &s[at + 2..]));
    }
    s.find('⇒').map(|at| (&s[..at], &s[at + '⇒'.len_utf8()..]))
}

/// Parses an einsum spec into its operand slots and the result slot.
///
/// Returns one operand slot for permute forms (`"rhs=>lhs"`) and two for
/// binary forms (`"rhs1;rhs2=>lhs"`).
pub fn parse_einsum(spec: &str) -> Result<(Vec<ParsedSlot>, ParsedSlot), ShapeError> {
    let multichar = is_multichar(spec);
    let Some((rhs_part, lhs_part)) = split_fat_arrow(spec) else {
        return Err(ShapeError::new(format!("einsum spec \"{spec}\" is missing `=>`")));
    };
    let mut slots = Vec::new();
    for part in rhs_part.split(';') {
        slots.push(parse_slot_mode(part.trim(), multichar)?);
    }
    if slots.is_empty() || slots.len() > 2 {
        return Err(ShapeError::new(format!(
            "einsum spec \"{spec}\" must name one or two operands, found {}",
            slots.len()
        )));
    }
    let lhs = parse_slot_mode(lhs_part.trim(), multichar)?;
    Ok((slots, lhs))
}

fn print_section(section: &KindSection, multichar: bool, out: &mut String) {
    let mut first = true;
    if section.ellipsis {
        out.push_str("...");
        first = false;
    }
    for label in &section.labels {
        if multichar && !first {
            out.push(',');
        }
        match label {
            AxisLabel::Placeholder => out.push('_'),
            AxisLabel::Label(l) => out.push_str(l),
        }
        first = false;
    }
}

/// Canonical form: all three sections, `|` and `->` separators, multi-char
/// labels comma-separated. Parsing the canonical form reproduces the slot.
pub fn print_slot(slot: &ParsedSlot) -> String {
    let multichar = [&slot.batch, &slot.input, &slot.output]
        .iter()
        .flat_map(|s| s.labels.iter())
        .any(|l| matches!(l, AxisLabel::Label(l) if l.chars().count() > 1));
    let mut out = String::new();
    print_section(&slot.batch, multichar, &mut out);
    out.push('|');
    print_section(&slot.input, multichar, &mut out);
    out.push_str("->");
    print_section(&slot.output, multichar, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(l: &str) -> AxisLabel {
        AxisLabel::Label(l.to_string())
    }

    #[test]
    fn single_char_mode_splits_chars() {
        let slot = parse_slot("ab|c->de").unwrap();
        assert_eq!(slot.batch.labels, vec![label("a"), label("b")]);
        assert_eq!(slot.input.labels, vec![label("c")]);
        assert_eq!(slot.output.labels, vec![label("d"), label("e")]);
        assert!(!slot.batch.ellipsis);
    }

    #[test]
    fn missing_sections_broadcast() {
        let slot = parse_slot("abc").unwrap();
        assert!(slot.batch.ellipsis && slot.batch.labels.is_empty());
        assert!(slot.input.ellipsis && slot.input.labels.is_empty());
        assert_eq!(slot.output.labels.len(), 3);
        // An explicitly empty section is fixed-empty, not broadcast.
        let fixed = parse_slot("|->abc").unwrap();
        assert!(!fixed.batch.ellipsis);
        assert!(!fixed.input.ellipsis);
    }

    #[test]
    fn multichar_mode_tokenizes_on_commas_and_spaces() {
        let slot = parse_slot("batch | height, width -> chan").unwrap();
        assert_eq!(slot.batch.labels, vec![label("batch")]);
        assert_eq!(slot.input.labels, vec![label("height"), label("width")]);
        assert_eq!(slot.output.labels, vec![label("chan")]);
    }

    #[test]
    fn ellipsis_and_placeholder() {
        let slot = parse_slot("...|...b->_c").unwrap();
        assert!(slot.batch.ellipsis);
        assert!(slot.input.ellipsis);
        assert_eq!(slot.input.labels, vec![label("b")]);
        assert_eq!(slot.output.labels, vec![AxisLabel::Placeholder, label("c")]);
        assert!(parse_slot("a...b").is_err());
    }

    #[test]
    fn unicode_arrows_are_synonyms() {
        let (slots, lhs) = parse_einsum("...|i→o; ...|...→i ⇒ ...|o").unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(lhs.output.labels, vec![label("o")]);
        assert!(lhs.batch.ellipsis);
    }

    #[test]
    fn canonical_printing_is_idempotent() {
        for spec in ["abc", "ab|c->de", "...|...b->_c", "batch | h, w -> c", "|->x"] {
            let parsed = parse_slot(spec).unwrap();
            let printed = print_slot(&parsed);
            let reparsed = parse_slot(&printed).unwrap();
            assert_eq!(parsed, reparsed, "spec {spec} reprinted as {printed}");
            assert_eq!(printed, print_slot(&reparsed));
        }
    }
}
