//! Label-agent rule grammar.
//!
//! Rules are plain strings whose literal parts are quoted with back-ticks:
//!
//! ```text
//! split          node `/` ,aggr,plex,disk
//! split_regex    node `^(\w+)_(\d+)$` site,num
//! split_pairs    tags `;` `=`
//! join           key `_` svm,volume
//! replace        node node_short `node_` ``
//! replace_regex  node node `^(node)_(\d+)_.*$` `Node-$2`
//! exclude_*      label `value`
//! include_*      label `value`
//! value_to_num   status state normal ok `0`
//! value_to_num_regex  status state ^normal$ ^ok$ `0`
//! value_mapping  status state down,degraded,up `0`
//! ```

use ahash::AHashSet as HashSet;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("unknown rule kind [{0}]")]
    UnknownKind(String),

    #[error("({kind}) rule has invalid format: {rule}")]
    InvalidFormat { kind: String, rule: String },

    #[error("({kind}) invalid regex in rule {rule}: {source}")]
    InvalidRegex {
        kind: String,
        rule: String,
        #[source]
        source: regex::Error,
    },

    #[error("({kind}) invalid substitution [{format}]")]
    InvalidSubstitution { kind: String, format: String },

    #[error("({kind}) invalid default value in rule {rule}")]
    InvalidDefault { kind: String, rule: String },
}

#[derive(Debug, Clone)]
pub struct SplitRule {
    pub source: String,
    pub sep: String,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SplitRegexRule {
    pub source: String,
    pub regex: Regex,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SplitPairsRule {
    pub source: String,
    pub outer: String,
    pub inner: String,
}

#[derive(Debug, Clone)]
pub struct JoinRule {
    pub target: String,
    pub sep: String,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReplaceRule {
    pub source: String,
    pub target: String,
    pub old: String,
    pub new: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatPiece {
    Literal(String),
    /// 1-based capture group.
    Group(usize),
}

#[derive(Debug, Clone)]
pub struct ReplaceRegexRule {
    pub source: String,
    pub target: String,
    pub regex: Regex,
    pub format: Vec<FormatPiece>,
}

impl ReplaceRegexRule {
    /// Expands the format against the captures of `value`. Groups that the
    /// regex does not define expand to the empty string.
    pub fn apply(&self, value: &str) -> Option<String> {
        let caps = self.regex.captures(value)?;
        let mut out = String::new();
        for piece in &self.format {
            match piece {
                FormatPiece::Literal(s) => out.push_str(s),
                FormatPiece::Group(n) => {
                    if let Some(m) = caps.get(*n) {
                        out.push_str(m.as_str());
                    }
                }
            }
        }
        Some(out)
    }
}

#[derive(Debug, Clone)]
pub enum Matcher {
    Equals(String),
    Contains(String),
    Regex(Regex),
}

impl Matcher {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Equals(s) => value == s,
            Matcher::Contains(s) => value.contains(s.as_str()),
            Matcher::Regex(r) => r.is_match(value),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchRule {
    pub label: String,
    pub matcher: Matcher,
}

/// How a label value maps to the synthesised uint8.
#[derive(Debug, Clone)]
pub enum MapMode {
    /// `value_to_num`: 1 when the value is one of the tokens.
    Binary(HashSet<String>),
    /// `value_to_num_regex`: 1 when either regex matches.
    BinaryRegex(Vec<Regex>),
    /// `value_mapping`: index of the matching token.
    Index(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct ValueMapRule {
    pub metric: String,
    pub label: String,
    pub mode: MapMode,
    pub default: Option<u8>,
}

impl ValueMapRule {
    pub fn map(&self, value: &str) -> Option<u8> {
        let mapped = match &self.mode {
            MapMode::Binary(tokens) => tokens.contains(value).then_some(1),
            MapMode::BinaryRegex(regs) => regs.iter().any(|r| r.is_match(value)).then_some(1),
            MapMode::Index(tokens) => tokens
                .iter()
                .position(|t| t == value)
                .and_then(|i| u8::try_from(i).ok()),
        };
        mapped.or(self.default)
    }

    pub fn property(&self) -> &'static str {
        match self.mode {
            MapMode::Binary(_) | MapMode::BinaryRegex(_) => "value_to_num mapping",
            MapMode::Index(_) => "value_mapping mapping",
        }
    }
}

/// Compiled rules grouped by kind.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub split: Vec<SplitRule>,
    pub split_regex: Vec<SplitRegexRule>,
    pub split_pairs: Vec<SplitPairsRule>,
    pub join: Vec<JoinRule>,
    pub replace: Vec<ReplaceRule>,
    pub replace_regex: Vec<ReplaceRegexRule>,
    pub include_equals: Vec<MatchRule>,
    pub include_contains: Vec<MatchRule>,
    pub include_regex: Vec<MatchRule>,
    pub exclude_equals: Vec<MatchRule>,
    pub exclude_contains: Vec<MatchRule>,
    pub exclude_regex: Vec<MatchRule>,
    pub value_maps: Vec<ValueMapRule>,
}

impl RuleSet {
    pub fn len(&self) -> usize {
        self.split.len()
            + self.split_regex.len()
            + self.split_pairs.len()
            + self.join.len()
            + self.replace.len()
            + self.replace_regex.len()
            + self.include_equals.len()
            + self.include_contains.len()
            + self.include_regex.len()
            + self.exclude_equals.len()
            + self.exclude_contains.len()
            + self.exclude_regex.len()
            + self.value_maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compiles one rule string of the given kind into the set.
    pub fn add(&mut self, kind: &str, rule: &str) -> Result<(), RuleError> {
        let rule = rule.trim();
        match kind {
            "split" => self.split.push(parse_split(rule)?),
            "split_regex" => self.split_regex.push(parse_split_regex(rule)?),
            "split_pairs" => self.split_pairs.push(parse_split_pairs(rule)?),
            "join" => self.join.push(parse_join(rule)?),
            "replace" => self.replace.push(parse_replace(rule)?),
            "replace_regex" => self.replace_regex.push(parse_replace_regex(rule)?),
            "include_equals" => self.include_equals.push(parse_match(kind, rule)?),
            "include_contains" => self.include_contains.push(parse_match(kind, rule)?),
            "include_regex" => self.include_regex.push(parse_match(kind, rule)?),
            "exclude_equals" => self.exclude_equals.push(parse_match(kind, rule)?),
            "exclude_contains" => self.exclude_contains.push(parse_match(kind, rule)?),
            "exclude_regex" => self.exclude_regex.push(parse_match(kind, rule)?),
            "value_to_num" | "value_to_num_regex" | "value_mapping" => {
                self.value_maps.push(parse_value_map(kind, rule)?)
            }
            other => return Err(RuleError::UnknownKind(other.to_string())),
        }
        Ok(())
    }
}

fn invalid(kind: &str, rule: &str) -> RuleError {
    RuleError::InvalidFormat {
        kind: kind.to_string(),
        rule: rule.to_string(),
    }
}

fn compile(kind: &str, rule: &str, pattern: &str) -> Result<Regex, RuleError> {
    Regex::new(pattern).map_err(|source| RuleError::InvalidRegex {
        kind: kind.to_string(),
        rule: rule.to_string(),
        source,
    })
}

/// Splits `SRC `LIT` REST` into its three parts.
fn source_literal_rest<'a>(kind: &str, rule: &'a str) -> Result<(&'a str, &'a str, &'a str), RuleError> {
    let (source, after) = rule.split_once(" `").ok_or_else(|| invalid(kind, rule))?;
    let (literal, rest) = after.split_once("` ").ok_or_else(|| invalid(kind, rule))?;
    let source = source.trim();
    if source.is_empty() {
        return Err(invalid(kind, rule));
    }
    Ok((source, literal, rest.trim()))
}

fn list(s: &str) -> Vec<String> {
    s.split(',').map(|t| t.trim().to_string()).collect()
}

fn parse_split(rule: &str) -> Result<SplitRule, RuleError> {
    let (source, sep, rest) = source_literal_rest("split", rule)?;
    let targets = list(rest);
    if sep.is_empty() || targets.iter().all(String::is_empty) {
        return Err(invalid("split", rule));
    }
    Ok(SplitRule {
        source: source.to_string(),
        sep: sep.to_string(),
        targets,
    })
}

fn parse_split_regex(rule: &str) -> Result<SplitRegexRule, RuleError> {
    let (source, pattern, rest) = source_literal_rest("split_regex", rule)?;
    let targets = list(rest);
    if targets.iter().all(String::is_empty) {
        return Err(invalid("split_regex", rule));
    }
    Ok(SplitRegexRule {
        source: source.to_string(),
        regex: compile("split_regex", rule, pattern)?,
        targets,
    })
}

fn parse_split_pairs(rule: &str) -> Result<SplitPairsRule, RuleError> {
    let fields: Vec<&str> = rule.split('`').collect();
    if fields.len() != 5 || fields[0].trim().is_empty() || fields[1].is_empty() || fields[3].is_empty() {
        return Err(invalid("split_pairs", rule));
    }
    Ok(SplitPairsRule {
        source: fields[0].trim().to_string(),
        outer: fields[1].to_string(),
        inner: fields[3].to_string(),
    })
}

fn parse_join(rule: &str) -> Result<JoinRule, RuleError> {
    let (target, sep, rest) = source_literal_rest("join", rule)?;
    let sources: Vec<String> = list(rest).into_iter().filter(|s| !s.is_empty()).collect();
    if sources.is_empty() {
        return Err(invalid("join", rule));
    }
    Ok(JoinRule {
        target: target.to_string(),
        sep: sep.to_string(),
        sources,
    })
}

/// Splits `SRC TGT `A` `B`` into labels and the two literals.
fn two_labels_two_literals<'a>(kind: &str, rule: &'a str) -> Result<(String, String, &'a str, &'a str), RuleError> {
    let fields: Vec<&str> = rule.splitn(3, " `").collect();
    if fields.len() != 3 {
        return Err(invalid(kind, rule));
    }
    let labels: Vec<&str> = fields[0].split_whitespace().collect();
    if labels.len() != 2 {
        return Err(invalid(kind, rule));
    }
    let first = fields[1].strip_suffix('`').unwrap_or(fields[1]);
    let second = fields[2].strip_suffix('`').unwrap_or(fields[2]);
    Ok((labels[0].to_string(), labels[1].to_string(), first, second))
}

fn parse_replace(rule: &str) -> Result<ReplaceRule, RuleError> {
    let (source, target, old, new) = two_labels_two_literals("replace", rule)?;
    Ok(ReplaceRule {
        source,
        target,
        old: old.to_string(),
        new: new.to_string(),
    })
}

/// Parses a substitution format; `$n` is a capture group, `\$` a literal `$`.
pub fn parse_format(format: &str) -> Result<Vec<FormatPiece>, RuleError> {
    let bad = || RuleError::InvalidSubstitution {
        kind: "replace_regex".to_string(),
        format: format.to_string(),
    };
    let mut pieces = Vec::new();
    let mut literal = String::new();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'$') => {
                literal.push('$');
                chars.next();
            }
            '$' => {
                let mut num = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    num.push(d);
                    chars.next();
                }
                let n: usize = num.parse().map_err(|_| bad())?;
                if n == 0 {
                    return Err(bad());
                }
                if !literal.is_empty() {
                    pieces.push(FormatPiece::Literal(std::mem::take(&mut literal)));
                }
                pieces.push(FormatPiece::Group(n));
            }
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        pieces.push(FormatPiece::Literal(literal));
    }
    Ok(pieces)
}

fn parse_replace_regex(rule: &str) -> Result<ReplaceRegexRule, RuleError> {
    let (source, target, pattern, format) = two_labels_two_literals("replace_regex", rule)?;
    Ok(ReplaceRegexRule {
        source,
        target,
        regex: compile("replace_regex", rule, pattern)?,
        format: parse_format(format)?,
    })
}

fn parse_match(kind: &str, rule: &str) -> Result<MatchRule, RuleError> {
    let (label, value) = rule.split_once(" `").ok_or_else(|| invalid(kind, rule))?;
    let label = label.trim();
    if label.is_empty() {
        return Err(invalid(kind, rule));
    }
    let value = value.strip_suffix('`').unwrap_or(value);
    let matcher = if kind.ends_with("_equals") {
        Matcher::Equals(value.to_string())
    } else if kind.ends_with("_contains") {
        Matcher::Contains(value.to_string())
    } else {
        Matcher::Regex(compile(kind, rule, value)?)
    };
    Ok(MatchRule {
        label: label.to_string(),
        matcher,
    })
}

fn parse_value_map(kind: &str, rule: &str) -> Result<ValueMapRule, RuleError> {
    let fields: Vec<&str> = rule.split_whitespace().collect();
    let (mode, default_field) = match kind {
        "value_mapping" if fields.len() == 3 || fields.len() == 4 => {
            (MapMode::Index(list(fields[2])), fields.get(3))
        }
        "value_to_num" if fields.len() == 4 || fields.len() == 5 => {
            let tokens = fields[2]
                .split('-')
                .chain(fields[3].split('-'))
                .map(str::to_string)
                .collect();
            (MapMode::Binary(tokens), fields.get(4))
        }
        "value_to_num_regex" if fields.len() == 4 || fields.len() == 5 => {
            let regs = vec![compile(kind, rule, fields[2])?, compile(kind, rule, fields[3])?];
            (MapMode::BinaryRegex(regs), fields.get(4))
        }
        _ => return Err(invalid(kind, rule)),
    };
    let default = match default_field {
        Some(d) => {
            let d = d.trim_matches('`');
            Some(d.parse::<u8>().map_err(|_| RuleError::InvalidDefault {
                kind: kind.to_string(),
                rule: rule.to_string(),
            })?)
        }
        None => None,
    };
    Ok(ValueMapRule {
        metric: fields[0].to_string(),
        label: fields[1].to_string(),
        mode,
        default,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_split() {
        let r = parse_split("node `/` ,aggr,plex,disk").unwrap();
        assert_eq!(r.source, "node");
        assert_eq!(r.sep, "/");
        assert_eq!(r.targets, vec!["", "aggr", "plex", "disk"]);
        assert!(parse_split("node / aggr").is_err());
    }

    #[test]
    fn test_parse_split_pairs() {
        let r = parse_split_pairs("tags `;` `=`").unwrap();
        assert_eq!((r.source.as_str(), r.outer.as_str(), r.inner.as_str()), ("tags", ";", "="));
        assert!(parse_split_pairs("tags `;`").is_err());
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(
            parse_format("$3-$2-bbb").unwrap(),
            vec![
                FormatPiece::Group(3),
                FormatPiece::Literal("-".into()),
                FormatPiece::Group(2),
                FormatPiece::Literal("-bbb".into()),
            ]
        );
        assert_eq!(
            parse_format(r"cost \$1").unwrap(),
            vec![FormatPiece::Literal("cost $1".into())]
        );
        assert!(parse_format("$x").is_err());
        assert!(parse_format("$0").is_err());
    }

    #[test]
    fn test_replace_regex_undefined_group_is_empty() {
        let r = parse_replace_regex(r"node node `^(node)_(\d+)$` `Node-$2$5`").unwrap();
        assert_eq!(r.apply("node_10").as_deref(), Some("Node-10"));
        assert!(r.apply("other").is_none());
    }

    #[test]
    fn test_parse_value_maps() {
        let r = parse_value_map("value_to_num", "status state normal-online ok `0`").unwrap();
        assert_eq!(r.map("online"), Some(1));
        assert_eq!(r.map("broken"), Some(0));
        assert_eq!(r.property(), "value_to_num mapping");

        let r = parse_value_map("value_mapping", "status state down,degraded,up").unwrap();
        assert_eq!(r.map("up"), Some(2));
        assert_eq!(r.map("gone"), None);

        let r = parse_value_map("value_to_num_regex", "ok state ^norm ^ok$").unwrap();
        assert_eq!(r.map("normal"), Some(1));
        assert_eq!(r.map("nok"), None);

        assert!(matches!(
            parse_value_map("value_to_num", "status state a b `x`"),
            Err(RuleError::InvalidDefault { .. })
        ));
        assert!(parse_value_map("value_to_num", "status state").is_err());
    }

    #[test]
    fn test_unknown_kind() {
        let mut set = RuleSet::default();
        assert!(matches!(
            set.add("rename", "a b"),
            Err(RuleError::UnknownKind(_))
        ));
        assert!(set.is_empty());
    }
}
