// ABOUTME: CSV record encoding for COPY ... FROM STDIN (FORMAT csv)
// ABOUTME: NULL is an unquoted empty field, empty strings are quoted, booleans and bits become 0/1

/// How a column's text value is rendered into a CSV field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Boolean,
    Bit,
    Other,
}

impl ColumnKind {
    /// Classify a `format_type()` string.
    pub fn from_type(data_type: &str) -> Self {
        match data_type.trim().to_ascii_lowercase().as_str() {
            "boolean" | "bool" => ColumnKind::Boolean,
            "bit" | "bit(1)" => ColumnKind::Bit,
            _ => ColumnKind::Other,
        }
    }
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "t" | "true" | "1" | "y" | "yes" | "on"
    )
}

fn needs_quotes(value: &str) -> bool {
    value.is_empty()
        || value == "\\."
        || value
            .chars()
            .any(|c| matches!(c, ',' | '"' | '\n' | '\r'))
}

/// Append one field for a text value (`None` is SQL NULL).
pub fn encode_field(value: Option<&str>, kind: ColumnKind, out: &mut String) {
    let Some(value) = value else {
        return;
    };
    match kind {
        ColumnKind::Boolean | ColumnKind::Bit => out.push(if truthy(value) { '1' } else { '0' }),
        ColumnKind::Other if needs_quotes(value) => {
            out.push('"');
            out.push_str(&value.replace('"', "\"\""));
            out.push('"');
        }
        ColumnKind::Other => out.push_str(value),
    }
}

/// Append one CSV record terminated by a newline.
pub fn encode_row(values: &[Option<String>], kinds: &[ColumnKind], out: &mut String) {
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let kind = kinds.get(i).copied().unwrap_or(ColumnKind::Other);
        encode_field(value.as_deref(), kind, out);
    }
    out.push('\n');
}
