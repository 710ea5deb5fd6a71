//! Data exchanged with collaborators: documents, tools, verdicts, result sets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A row returned by a storage query, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A retrieved document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: Option<String>,
    pub text: String,
    /// Relevance score assigned by retrieval or reranking.
    #[serde(default)]
    pub score: f64,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            tag: None,
            text: text.into(),
            score: 0.0,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// A tool the generation client may choose to call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({ "type": "object" }),
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// A tool invocation chosen by the generation client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }
}

/// Accumulated results of the tool-use stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Textual observations handed to the answer and final-check stages.
    pub memory: Vec<String>,
    /// Structured results keyed by tool call (`"<index>:<tool>"`).
    pub data: BTreeMap<String, serde_json::Value>,
}

impl ToolOutcome {
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.data.is_empty()
    }

    /// Record the result of the `index`-th call.
    pub fn record(
        &mut self,
        index: usize,
        call: &ToolCall,
        summary: impl Into<String>,
        result: serde_json::Value,
    ) {
        self.memory.push(format!("{}: {}", call.tool, summary.into()));
        self.data.insert(format!("{index}:{}", call.tool), result);
    }

    /// Record a result whose summary is its own JSON text.
    pub fn record_value(&mut self, index: usize, call: &ToolCall, result: serde_json::Value) {
        let summary = match &result {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.record(index, call, summary, result);
    }
}

/// A guardrail decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub approved: bool,
    /// Explanation shown to the user when the guardrail rejects.
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl Verdict {
    pub fn approve() -> Self {
        Self {
            approved: true,
            response: String::new(),
            issues: Vec::new(),
        }
    }

    pub fn reject(response: impl Into<String>) -> Self {
        Self {
            approved: false,
            response: response.into(),
            issues: Vec::new(),
        }
    }

    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.issues.push(issue.into());
        self
    }
}

/// Tabular output of a storage query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Render as a pipe-separated table.
    pub fn to_text(&self) -> String {
        let mut out = self.columns.join(" | ");
        for row in &self.rows {
            out.push('\n');
            let cells: Vec<String> = self
                .columns
                .iter()
                .map(|c| match row.get(c) {
                    Some(serde_json::Value::String(s)) => s.clone(),
                    Some(serde_json::Value::Null) | None => "NULL".to_string(),
                    Some(v) => v.to_string(),
                })
                .collect();
            out.push_str(&cells.join(" | "));
        }
        out
    }
}

/// Description of the relational store's tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub tables: Vec<Table>,
    pub relationships: Vec<Relationship>,
}

impl Schema {
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// One line per table, `name(col, col, ...)`, followed by foreign keys.
    pub fn summary(&self) -> String {
        let mut lines: Vec<String> = self
            .tables
            .iter()
            .map(|t| {
                let cols: Vec<&str> = t.columns.iter().map(|c| c.name.as_str()).collect();
                format!("{}({})", t.name, cols.join(", "))
            })
            .collect();
        lines.extend(self.relationships.iter().map(|r| {
            format!(
                "{}.{} -> {}.{}",
                r.from_table, r.from_column, r.to_table, r.to_column
            )
        }));
        lines.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
}

/// A foreign key from `from_table.from_column` to `to_table.to_column`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}
