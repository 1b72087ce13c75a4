use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Table description handed to the dynamic query builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub columns: Vec<ColumnMetadata>,
}

impl TableMetadata {
    /// `Schema.Table`, or the bare table name for schemaless databases.
    pub fn qualified_name(&self) -> String {
        if self.schema.is_empty() {
            self.table.clone()
        } else {
            format!("{}.{}", self.schema, self.table)
        }
    }

    /// Accepts `Schema.Table` or bare `Table`, case-insensitively.
    pub fn is_named(&self, reference: &str) -> bool {
        let reference = reference.trim();
        reference.eq_ignore_ascii_case(&self.qualified_name())
            || reference.eq_ignore_ascii_case(&self.table)
    }
}
