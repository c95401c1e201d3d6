//! Output rendering for admin verbs.
//!
//! Two formats: `debug` (an HTML table for humans, the default) and
//! `json` (an array of objects keyed by column name).

use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Debug,
    Json,
}

impl OutputFormat {
    pub fn parse(value: Option<&str>) -> Result<Self, String> {
        match value {
            None | Some("debug") => Ok(Self::Debug),
            Some("json") => Ok(Self::Json),
            Some(other) => Err(format!("unknown format '{other}'")),
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Debug => "text/html; charset=UTF-8",
            Self::Json => "application/json; charset=UTF-8",
        }
    }
}

#[derive(Debug, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Debug => self.render_debug(),
            OutputFormat::Json => self.render_json(),
        }
    }

    fn render_debug(&self) -> String {
        let mut out = String::from("<table border=\"1\"><tr>");
        for column in &self.columns {
            out.push_str("<th>");
            out.push_str(&escape_html(column));
            out.push_str("</th>");
        }
        out.push_str("</tr>");
        for row in &self.rows {
            out.push_str("<tr>");
            for cell in row {
                out.push_str("<td>");
                out.push_str(&escape_html(cell));
                out.push_str("</td>");
            }
            out.push_str("</tr>");
        }
        out.push_str("</table>");
        out
    }

    fn render_json(&self) -> String {
        let items: Vec<Value> = self
            .rows
            .iter()
            .map(|row| {
                let mut object = Map::new();
                for (column, cell) in self.columns.iter().zip(row.iter()) {
                    object.insert(column.clone(), Value::String(cell.clone()));
                }
                Value::Object(object)
            })
            .collect();
        serde_json::to_string(&items).unwrap_or_else(|_| "[]".to_string())
    }
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        let mut table = Table::new(&["Backend", "Port"]);
        table.push(vec!["alpha".to_string(), "8080".to_string()]);
        table.push(vec!["beta".to_string(), "8081".to_string()]);
        table
    }

    #[test]
    fn parse_format_values() {
        assert_eq!(OutputFormat::parse(None).unwrap(), OutputFormat::Debug);
        assert_eq!(
            OutputFormat::parse(Some("debug")).unwrap(),
            OutputFormat::Debug
        );
        assert_eq!(
            OutputFormat::parse(Some("json")).unwrap(),
            OutputFormat::Json
        );
        assert!(OutputFormat::parse(Some("xml")).is_err());
    }

    #[test]
    fn json_render_is_an_array_of_objects() {
        let rendered = sample().render(OutputFormat::Json);
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed[0]["Backend"], "alpha");
        assert_eq!(parsed[1]["Port"], "8081");
    }

    #[test]
    fn debug_render_escapes_html() {
        let mut table = Table::new(&["Value"]);
        table.push(vec!["<script>".to_string()]);
        let rendered = table.render(OutputFormat::Debug);
        assert!(rendered.contains("&lt;script&gt;"));
        assert!(!rendered.contains("<script>"));
    }
}
