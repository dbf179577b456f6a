//! In-memory representation of the uploaded CSV.
//!
//! Files arrive from spreadsheet exports in the wild: possibly BOM-prefixed,
//! with `,`, `;`, tab or `|` as separator. The delimiter is sniffed from the
//! header line (most frequent candidate wins) before handing the bytes to the
//! csv reader.

use std::io::Cursor;

pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Case-insensitive, whitespace-trimmed column lookup.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.trim().eq_ignore_ascii_case(name))
    }
}

const DELIMITER_CANDIDATES: [char; 4] = [',', ';', '\t', '|'];

fn detect_delimiter(header_line: &str) -> u8 {
    DELIMITER_CANDIDATES
        .iter()
        .max_by_key(|&&d| header_line.matches(d).count())
        .map(|&d| d as u8)
        .unwrap_or(b',')
}

/// Parses the uploaded bytes into a table. An unreadable file, a blank
/// header or zero data rows are all request-fatal.
pub fn parse_table(bytes: &[u8]) -> Result<Table, String> {
    let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    let text = std::str::from_utf8(bytes).map_err(|_| "CSV file is not valid UTF-8.".to_string())?;

    let header_line = text.lines().next().unwrap_or("");
    if header_line.trim().is_empty() {
        return Err("CSV file is empty.".to_string());
    }
    let delimiter = detect_delimiter(header_line);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(Cursor::new(bytes));

    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| format!("CSV Read Error: {}", e))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| format!("CSV Read Error: {}", e))?;
        let mut row: Vec<String> = record.iter().map(str::to_string).collect();
        // Short rows are padded so column indexes stay valid.
        row.resize(columns.len(), String::new());
        rows.push(row);
    }
    if rows.is_empty() {
        return Err("CSV file is empty.".to_string());
    }

    Ok(Table { columns, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_semicolon_delimiter() {
        let table = parse_table(b"a;b;c\n1;2;3\n").unwrap();
        assert_eq!(table.columns, vec!["a", "b", "c"]);
        assert_eq!(table.rows, vec![vec!["1", "2", "3"]]);
    }

    #[test]
    fn strips_utf8_bom_from_first_header() {
        let table = parse_table(b"\xef\xbb\xbf_id,name\n1234567,Ana\n").unwrap();
        assert_eq!(table.columns[0], "_id");
        assert_eq!(table.column_index("_ID"), Some(0));
    }

    #[test]
    fn empty_and_header_only_files_are_rejected() {
        assert!(parse_table(b"").is_err());
        assert!(parse_table(b"a,b,c\n").is_err());
        assert!(parse_table(b"   \n").is_err());
    }

    #[test]
    fn short_rows_are_padded_to_header_width() {
        let table = parse_table(b"a,b,c\n1,2\n").unwrap();
        assert_eq!(table.rows[0], vec!["1", "2", ""]);
    }

    #[test]
    fn non_utf8_input_is_rejected() {
        assert!(parse_table(b"a,b\n\xff\xfe,2\n").is_err());
    }
}
