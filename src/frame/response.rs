use std::net::IpAddr;

/// The subset of CQL values that appears in the system tables read by the
/// control channel, plus the bound values of its parameterized queries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CqlValue {
    Text(String),
    Inet(IpAddr),
    TextList(Vec<String>),
    Null,
}

impl CqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            CqlValue::Inet(ip) => Some(*ip),
            _ => None,
        }
    }
}

/// A single decoded row, with columns accessible by name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Row {
    columns: Vec<(String, CqlValue)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, name: impl Into<String>, value: CqlValue) -> Self {
        self.columns.push((name.into(), value));
        self
    }

    /// The value of the named column; `None` if the column is absent
    /// (servers vary in which columns they return).
    pub fn get(&self, name: &str) -> Option<&CqlValue> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    /// Text value of the named column; `None` if absent, null, or of a
    /// different type.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(CqlValue::as_text)
    }

    pub fn get_string_list(&self, name: &str) -> Option<&[String]> {
        match self.get(name) {
            Some(CqlValue::TextList(list)) => Some(list),
            _ => None,
        }
    }
}

/// Decoded rows of a single control query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultSet {
    rows: Vec<Row>,
}

impl ResultSet {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn first_row(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
