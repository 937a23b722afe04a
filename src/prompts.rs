//! Named prompt templates with `{PLACEHOLDER}` substitution.

use crate::error::{AskdbError, Result};

const GENERATE_CANDIDATE: &str = r#"You are an expert SQL writer. Given a database schema, a question, and an optional hint, write one SQL query that answers the question.

Database schema:
{SCHEMA}

Question: {QUESTION}
Hint: {HINT}
{CONTEXT}
Respond with a single JSON object and nothing else:
{"chain_of_thought_reasoning": "<your reasoning>", "SQL": "<the query>"}"#;

const GENERATE_TAGGED: &str = r#"You are an expert SQL writer. Think through the question step by step, then give the final SQL query.

Database schema:
{SCHEMA}

Question: {QUESTION}
Hint: {HINT}
{CONTEXT}
Write out your query plan, then put the final SQL between tags, exactly like:
<FINAL_ANSWER>
SELECT ...
</FINAL_ANSWER>"#;

const REVISE: &str = r#"The SQL query below failed or returned a wrong-looking result. Fix it.

Database schema:
{SCHEMA}

Question: {QUESTION}
Hint: {HINT}

Failing SQL:
{SQL}

Execution result:
{RESULT}

Respond with a single JSON object and nothing else:
{"chain_of_thought_reasoning": "<what was wrong and how you fixed it>", "SQL": "<the corrected query>"}"#;

const EXTRACT_KEYWORDS: &str = r#"Extract the keywords and named entities from the question and hint below. Include literal values that might appear in database cells.

Question: {QUESTION}
Hint: {HINT}

Respond with a JSON array of strings and nothing else, for example:
["keyword one", "keyword two"]"#;

const NARRATE_RESPONSE: &str = r#"Answer the user's question in one or two plain sentences using the query result below. Do not mention SQL.

Question: {QUESTION}
SQL result (JSON rows):
{RESULT}"#;

pub fn template(name: &str) -> Result<&'static str> {
    match name {
        "generate_candidate" => Ok(GENERATE_CANDIDATE),
        "generate_tagged" => Ok(GENERATE_TAGGED),
        "revise" => Ok(REVISE),
        "extract_keywords" => Ok(EXTRACT_KEYWORDS),
        "narrate_response" => Ok(NARRATE_RESPONSE),
        other => Err(AskdbError::config(format!(
            "unknown prompt template '{other}'"
        ))),
    }
}

/// Render the named template, replacing each `{KEY}` with its value.
/// Placeholders without a supplied value are left intact.
pub fn render(name: &str, vars: &[(&str, &str)]) -> Result<String> {
    let mut text = template(name)?.to_string();
    for (key, value) in vars {
        text = text.replace(&format!("{{{key}}}"), value);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_placeholders() {
        let out = render(
            "extract_keywords",
            &[("QUESTION", "highest paid staff"), ("HINT", "")],
        )
        .unwrap();
        assert!(out.contains("highest paid staff"));
        assert!(!out.contains("{QUESTION}"));
    }

    #[test]
    fn test_unknown_template_is_error() {
        assert!(template("no_such_template").is_err());
    }

    #[test]
    fn test_json_braces_survive_rendering() {
        let out = render("generate_candidate", &[("QUESTION", "q")]).unwrap();
        assert!(out.contains("\"chain_of_thought_reasoning\""));
    }
}
