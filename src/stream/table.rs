use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use crate::core::error::{Error, ErrorKind, Result};

/// Name of the event-time column every table carries
pub const TIME_COLUMN: &str = "time";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

/// Columnar view of a stream's events, indexed by `seq_num`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub seq_num: Vec<u64>,
    pub columns: Vec<Column>,
}

/// Options controlling how event times are rendered in a table
#[derive(Debug, Clone, PartialEq)]
pub struct TableOptions {
    /// Render times as RFC 3339 strings instead of epoch seconds
    pub convert_times: bool,
    /// "UTC" or a fixed offset; `None` uses the store's timezone
    pub timezone: Option<String>,
    /// Render in the local timezone rather than UTC; implies `convert_times`
    pub localize_times: bool,
}

impl Default for TableOptions {
    fn default() -> Self {
        TableOptions {
            convert_times: true,
            timezone: None,
            localize_times: true,
        }
    }
}

impl TableOptions {
    pub fn raw_times() -> Self {
        TableOptions {
            convert_times: false,
            timezone: None,
            localize_times: false,
        }
    }
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seq_num.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq_num.is_empty()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    /// Append one row; cells missing from `row` are null, unknown names add a column.
    pub fn push_row(&mut self, seq_num: u64, row: &BTreeMap<String, Value>) {
        let previous = self.len();
        for (name, _) in row {
            if self.column(name).is_none() {
                self.columns.push(Column {
                    name: name.clone(),
                    values: vec![Value::Null; previous],
                });
            }
        }
        for column in &mut self.columns {
            column
                .values
                .push(row.get(&column.name).cloned().unwrap_or(Value::Null));
        }
        self.seq_num.push(seq_num);
    }

    /// Row `index` as a JSON object, including `seq_num`
    pub fn row(&self, index: usize) -> Result<Map<String, Value>> {
        let seq_num = self.seq_num.get(index).ok_or_else(|| {
            Error::new(
                ErrorKind::IndexOutOfRange,
                format!("Row {} out of range for table of {} rows", index, self.len()),
            )
        })?;
        let mut row = Map::new();
        row.insert("seq_num".to_string(), Value::from(*seq_num));
        for column in &self.columns {
            row.insert(column.name.clone(), column.values[index].clone());
        }
        Ok(row)
    }

    /// Stack tables vertically; the column set is the union in first-seen order.
    pub fn concat(tables: Vec<Table>) -> Table {
        let mut result = Table::new();
        for table in tables {
            let offset = result.len();
            let added = table.len();
            for column in table.columns {
                match result.column_mut(&column.name) {
                    Some(existing) => existing.values.extend(column.values),
                    None => {
                        let mut values = vec![Value::Null; offset];
                        values.extend(column.values);
                        result.columns.push(Column {
                            name: column.name,
                            values,
                        });
                    }
                }
            }
            result.seq_num.extend(table.seq_num);
            for column in &mut result.columns {
                column.values.resize(offset + added, Value::Null);
            }
        }
        result
    }
}
