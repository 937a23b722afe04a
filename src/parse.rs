//! Parsers for structured LLM output.
//!
//! Parsers are looked up by name; config validation rejects names this
//! module does not know. Each parse gets one repair pass (fence
//! stripping, first-JSON-object extraction) before it fails.

use serde_json::Value;

use crate::error::{AskdbError, Result};

/// Candidate fields extracted from one LLM response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCandidate {
    pub reasoning: String,
    pub sql: String,
    pub plan: Option<String>,
}

const PARSERS: &[&str] = &[
    "candidate_json",
    "candidate_markdown",
    "candidate_tagged",
    "revision",
    "keyword_list",
];

pub fn is_known_parser(name: &str) -> bool {
    PARSERS.contains(&name)
}

/// Parse a candidate-shaped response with the named parser.
pub fn parse_candidate(parser: &str, raw: &str) -> Result<ParsedCandidate> {
    let parsed = match parser {
        "candidate_json" => parse_candidate_json(raw),
        "candidate_markdown" => parse_candidate_markdown(raw),
        "candidate_tagged" => parse_candidate_tagged(raw),
        "revision" => parse_revision(raw),
        other => {
            return Err(AskdbError::config(format!("unknown parser '{other}'")));
        }
    };

    match parsed {
        Ok(c) => Ok(c),
        // One repair pass before giving up.
        Err(first_err) => {
            let repaired = repair(raw);
            match parser {
                "candidate_json" => parse_candidate_json(&repaired),
                "candidate_markdown" => parse_candidate_markdown(&repaired),
                "candidate_tagged" => parse_candidate_tagged(&repaired),
                "revision" => parse_revision(&repaired),
                _ => unreachable!(),
            }
            .map_err(|_| first_err)
        }
    }
}

/// Parse a JSON list of keywords, with the same single repair pass.
pub fn parse_keywords(raw: &str) -> Result<Vec<String>> {
    parse_keyword_list(raw).or_else(|first_err| {
        parse_keyword_list(&repair(raw)).map_err(|_| first_err)
    })
}

/// Strip markdown code fences and, failing that, cut out the first
/// balanced JSON object or array.
fn repair(raw: &str) -> String {
    let trimmed = raw.trim();

    if let Some(inner) = strip_fences(trimmed) {
        return inner;
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                return trimmed[start..=end].to_string();
            }
        }
    }

    trimmed.to_string()
}

fn strip_fences(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // skip the language tag on the fence line
    let body_start = after.find('\n')?;
    let body = &after[body_start + 1..];
    let end = body.find("```")?;
    Some(body[..end].trim().to_string())
}

fn parse_candidate_json(raw: &str) -> Result<ParsedCandidate> {
    let json: Value = serde_json::from_str(raw.trim())
        .map_err(|e| AskdbError::Parse(format!("candidate JSON: {e}")))?;

    let sql = string_field(&json, &["SQL", "sql", "query"])
        .ok_or_else(|| AskdbError::Parse("candidate JSON missing SQL field".into()))?;
    let reasoning =
        string_field(&json, &["chain_of_thought_reasoning", "reasoning"]).unwrap_or_default();
    let plan = string_field(&json, &["plan"]);

    Ok(ParsedCandidate {
        reasoning,
        sql,
        plan,
    })
}

fn parse_candidate_markdown(raw: &str) -> Result<ParsedCandidate> {
    let fence = raw
        .find("```sql")
        .map(|i| (i, i + 6))
        .or_else(|| raw.find("```").map(|i| (i, i + 3)))
        .ok_or_else(|| AskdbError::Parse("no fenced SQL block in response".into()))?;

    let body = &raw[fence.1..];
    let end = body
        .find("```")
        .ok_or_else(|| AskdbError::Parse("unterminated SQL fence".into()))?;
    let sql = body[..end].trim().to_string();
    if sql.is_empty() {
        return Err(AskdbError::Parse("empty fenced SQL block".into()));
    }

    Ok(ParsedCandidate {
        reasoning: raw[..fence.0].trim().to_string(),
        sql,
        plan: None,
    })
}

/// Tagged plan-then-answer output: free-form plan text followed by the
/// final SQL between `<FINAL_ANSWER>` tags.
fn parse_candidate_tagged(raw: &str) -> Result<ParsedCandidate> {
    const OPEN: &str = "<FINAL_ANSWER>";
    const CLOSE: &str = "</FINAL_ANSWER>";

    let start = raw
        .find(OPEN)
        .ok_or_else(|| AskdbError::Parse("missing <FINAL_ANSWER> tag".into()))?;
    let after = &raw[start + OPEN.len()..];
    let end = after
        .find(CLOSE)
        .ok_or_else(|| AskdbError::Parse("missing </FINAL_ANSWER> tag".into()))?;

    let sql = after[..end].trim().to_string();
    if sql.is_empty() {
        return Err(AskdbError::Parse("empty <FINAL_ANSWER> block".into()));
    }
    let plan = raw[..start].trim().to_string();

    Ok(ParsedCandidate {
        reasoning: String::new(),
        sql,
        plan: if plan.is_empty() { None } else { Some(plan) },
    })
}

/// Revision output: JSON first, fenced SQL second, raw SELECT text last.
fn parse_revision(raw: &str) -> Result<ParsedCandidate> {
    if let Ok(c) = parse_candidate_json(raw) {
        return Ok(c);
    }
    if let Ok(c) = parse_candidate_markdown(raw) {
        return Ok(c);
    }
    let trimmed = raw.trim();
    if trimmed.to_uppercase().contains("SELECT") {
        return Ok(ParsedCandidate {
            reasoning: String::new(),
            sql: trimmed.to_string(),
            plan: None,
        });
    }
    Err(AskdbError::Parse("revision output has no usable SQL".into()))
}

fn parse_keyword_list(raw: &str) -> Result<Vec<String>> {
    let json: Value = serde_json::from_str(raw.trim())
        .map_err(|e| AskdbError::Parse(format!("keyword list: {e}")))?;
    let items = json
        .as_array()
        .ok_or_else(|| AskdbError::Parse("keyword list is not a JSON array".into()))?;
    Ok(items
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

fn string_field(json: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|n| json.get(n).and_then(|v| v.as_str()))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_json() {
        let raw = r#"{"chain_of_thought_reasoning": "join on id", "SQL": "SELECT name FROM employee"}"#;
        let c = parse_candidate("candidate_json", raw).unwrap();
        assert_eq!(c.sql, "SELECT name FROM employee");
        assert_eq!(c.reasoning, "join on id");
        assert!(c.plan.is_none());
    }

    #[test]
    fn test_candidate_json_repairs_fenced_output() {
        let raw = "```json\n{\"SQL\": \"SELECT 1\"}\n```";
        let c = parse_candidate("candidate_json", raw).unwrap();
        assert_eq!(c.sql, "SELECT 1");
    }

    #[test]
    fn test_candidate_json_repairs_surrounding_prose() {
        let raw = "Sure! Here is the query: {\"SQL\": \"SELECT 2\"} Hope that helps.";
        let c = parse_candidate("candidate_json", raw).unwrap();
        assert_eq!(c.sql, "SELECT 2");
    }

    #[test]
    fn test_candidate_markdown() {
        let raw = "The query joins both tables.\n```sql\nSELECT a FROM b\n```";
        let c = parse_candidate("candidate_markdown", raw).unwrap();
        assert_eq!(c.sql, "SELECT a FROM b");
        assert_eq!(c.reasoning, "The query joins both tables.");
    }

    #[test]
    fn test_candidate_tagged_carries_plan() {
        let raw = "Step 1: find the table.\nStep 2: filter.\n<FINAL_ANSWER>SELECT x FROM y</FINAL_ANSWER>";
        let c = parse_candidate("candidate_tagged", raw).unwrap();
        assert_eq!(c.sql, "SELECT x FROM y");
        assert!(c.plan.as_deref().unwrap().starts_with("Step 1"));
    }

    #[test]
    fn test_revision_accepts_bare_select() {
        let c = parse_candidate("revision", "SELECT fixed FROM t").unwrap();
        assert_eq!(c.sql, "SELECT fixed FROM t");
    }

    #[test]
    fn test_keyword_list() {
        let kws = parse_keywords(r#"["department", "salary", ""]"#).unwrap();
        assert_eq!(kws, vec!["department", "salary"]);
    }

    #[test]
    fn test_keyword_list_repairs_prose() {
        let kws = parse_keywords("Keywords: [\"alpha\", \"beta\"] done").unwrap();
        assert_eq!(kws, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_unknown_parser_rejected() {
        assert!(!is_known_parser("bogus"));
        assert!(parse_candidate("bogus", "{}").is_err());
    }

    #[test]
    fn test_single_repair_pass_then_fail() {
        let err = parse_candidate("candidate_json", "not json at all").unwrap_err();
        assert!(err.to_string().contains("candidate JSON"));
    }
}
