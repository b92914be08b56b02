//! Tabular dataset records.
//!
//! Input rows come with unpredictable column naming; each field accepts two
//! aliases and falls back to an empty string when neither is present. A row
//! with empty fields is a degenerate but valid example, never an error.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

/// One training example after column normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionRecord {
    pub instruction: String,
    pub response: String,
}

const INSTRUCTION_ALIASES: &[&str] = &["instruction", "Context"];
const RESPONSE_ALIASES: &[&str] = &["response", "Response"];

/// Load a CSV dataset, one example per row.
pub fn load_csv(path: &Path) -> Result<Vec<InstructionRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open dataset {}", path.display()))?;

    let headers = reader.headers().context("failed to read CSV header")?.clone();
    let instruction_col = find_column(&headers, INSTRUCTION_ALIASES);
    let response_col = find_column(&headers, RESPONSE_ALIASES);

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.context("failed to read CSV row")?;
        records.push(InstructionRecord {
            instruction: field(&row, instruction_col),
            response: field(&row, response_col),
        });
    }

    info!("Loaded {} examples from {}", records.len(), path.display());
    Ok(records)
}

/// First alias that matches a header column wins.
fn find_column(headers: &csv::StringRecord, aliases: &[&str]) -> Option<usize> {
    aliases
        .iter()
        .find_map(|name| headers.iter().position(|header| header == *name))
}

fn field(row: &csv::StringRecord, col: Option<usize>) -> String {
    col.and_then(|idx| row.get(idx)).unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn loads_canonical_columns() {
        let file = write_csv("instruction,response\nWhat is 2+2?,4\n");
        let records = load_csv(file.path()).unwrap();
        assert_eq!(
            records,
            vec![InstructionRecord {
                instruction: "What is 2+2?".to_string(),
                response: "4".to_string(),
            }]
        );
    }

    #[test]
    fn loads_aliased_columns() {
        let file = write_csv("Context,Response\nWhat is 2+2?,4\n");
        let records = load_csv(file.path()).unwrap();
        assert_eq!(records[0].instruction, "What is 2+2?");
        assert_eq!(records[0].response, "4");
    }

    #[test]
    fn canonical_name_wins_over_alias() {
        let file = write_csv("Context,instruction,response\nignored,use this,ok\n");
        let records = load_csv(file.path()).unwrap();
        assert_eq!(records[0].instruction, "use this");
    }

    #[test]
    fn missing_columns_become_empty_strings() {
        let file = write_csv("topic,score\nmath,1\n");
        let records = load_csv(file.path()).unwrap();
        assert_eq!(records[0].instruction, "");
        assert_eq!(records[0].response, "");
    }

    #[test]
    fn aliased_record_renders_the_plain_template() {
        use crate::data::template::PromptTemplate;

        let file = write_csv("Context,Response\nWhat is 2+2?,4\n");
        let records = load_csv(file.path()).unwrap();
        let text = PromptTemplate::Plain
            .format_example(&records[0].instruction, &records[0].response);
        assert_eq!(text, "### Instrucción:\nWhat is 2+2?\n\n### Respuesta:\n4");
    }

    #[test]
    fn short_rows_become_empty_strings() {
        let file = write_csv("instruction,response\nonly instruction\n");
        let records = load_csv(file.path()).unwrap();
        assert_eq!(records[0].instruction, "only instruction");
        assert_eq!(records[0].response, "");
    }
}
