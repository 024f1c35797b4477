//! Completed command results.
//!
//! A [`PgResult`] is a self-contained snapshot: it holds its own copy of every
//! row and keeps no reference to the connection that produced it.

use crate::error::{Error, ErrorFields, Result, Verbosity};
use crate::protocol::backend::{DataRow, FieldDescription};
use crate::protocol::types::{FormatCode, Oid};

/// Outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// The query string was empty
    EmptyQuery,
    /// Command completed without returning rows
    CommandOk,
    /// Command returned rows (possibly zero)
    TuplesOk,
    /// COPY TO STDOUT in progress
    CopyOut,
    /// COPY FROM STDIN in progress
    CopyIn,
    /// The server's response was not understood
    BadResponse,
    /// Notice or warning
    NonfatalError,
    /// Command failed
    FatalError,
}

impl ResultStatus {
    /// The `PGRES_*` name of a status.
    pub fn name(self) -> &'static str {
        match self {
            ResultStatus::EmptyQuery => "PGRES_EMPTY_QUERY",
            ResultStatus::CommandOk => "PGRES_COMMAND_OK",
            ResultStatus::TuplesOk => "PGRES_TUPLES_OK",
            ResultStatus::CopyOut => "PGRES_COPY_OUT",
            ResultStatus::CopyIn => "PGRES_COPY_IN",
            ResultStatus::BadResponse => "PGRES_BAD_RESPONSE",
            ResultStatus::NonfatalError => "PGRES_NONFATAL_ERROR",
            ResultStatus::FatalError => "PGRES_FATAL_ERROR",
        }
    }

    /// Whether this status means the command failed.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ResultStatus::BadResponse | ResultStatus::NonfatalError | ResultStatus::FatalError
        )
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Table the column comes from, or 0
    pub table_oid: Oid,
    /// Attribute number within that table, or 0
    pub column_id: i16,
    pub type_oid: Oid,
    /// Negative for variable-width types
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: FormatCode,
}

impl From<&FieldDescription<'_>> for Column {
    fn from(field: &FieldDescription<'_>) -> Self {
        Self {
            name: field.name.to_string(),
            table_oid: field.table_oid,
            column_id: field.column_id,
            type_oid: field.type_oid,
            type_size: field.type_size,
            type_modifier: field.type_modifier,
            format: field.format,
        }
    }
}

fn column_position(columns: &[Column], name: &str) -> Option<usize> {
    let wanted = match name.strip_prefix('"').and_then(|n| n.strip_suffix('"')) {
        Some(quoted) => quoted.replace("\"\"", "\""),
        None => name.to_lowercase(),
    };
    columns.iter().position(|c| c.name == wanted)
}

/// Location of one value inside `ResultData::data`; `len < 0` is NULL.
#[derive(Debug, Clone, Copy)]
struct Cell {
    start: usize,
    len: i32,
}

#[derive(Debug, Clone)]
struct ResultData {
    status: ResultStatus,
    columns: Vec<Column>,
    param_types: Vec<Oid>,
    cells: Vec<Cell>,
    data: Vec<u8>,
    ntuples: usize,
    cmd_status: String,
    error: Option<ErrorFields>,
    error_message: String,
}

/// Result of one command.
#[derive(Debug, Clone)]
pub struct PgResult {
    inner: Option<Box<ResultData>>,
}

impl PgResult {
    pub(crate) fn new(status: ResultStatus) -> Self {
        Self {
            inner: Some(Box::new(ResultData {
                status,
                columns: Vec::new(),
                param_types: Vec::new(),
                cells: Vec::new(),
                data: Vec::new(),
                ntuples: 0,
                cmd_status: String::new(),
                error: None,
                error_message: String::new(),
            })),
        }
    }

    /// A result that will receive rows described by `fields`.
    pub(crate) fn with_columns(status: ResultStatus, fields: &[FieldDescription<'_>]) -> Self {
        let mut result = Self::new(status);
        if let Some(data) = result.inner.as_mut() {
            data.columns = fields.iter().map(Column::from).collect();
        }
        result
    }

    /// An error result carrying server (or client-generated) fields.
    pub(crate) fn from_error(status: ResultStatus, fields: ErrorFields, verbosity: Verbosity) -> Self {
        let mut result = Self::new(status);
        if let Some(data) = result.inner.as_mut() {
            data.error_message = fields.render(verbosity);
            data.error = Some(fields);
        }
        result
    }

    pub(crate) fn set_param_types(&mut self, oids: Vec<Oid>) {
        if let Some(data) = self.inner.as_mut() {
            data.param_types = oids;
        }
    }

    pub(crate) fn set_cmd_status(&mut self, tag: &str) {
        if let Some(data) = self.inner.as_mut() {
            data.cmd_status = tag.to_string();
        }
    }

    pub(crate) fn set_error_message(&mut self, message: String) {
        if let Some(data) = self.inner.as_mut() {
            data.error_message = message;
        }
    }

    /// Append one DataRow; its width must match the column count.
    pub(crate) fn push_row(&mut self, row: &DataRow<'_>) -> Result<()> {
        let data = self.inner.as_mut().ok_or(Error::ResultCleared)?;
        if row.len() != data.columns.len() {
            return Err(Error::Protocol(format!(
                "DataRow has {} columns, RowDescription announced {}",
                row.len(),
                data.columns.len()
            )));
        }
        let ResultData { cells, data: bytes, .. } = &mut **data;
        row.for_each_value(|value| match value {
            None => cells.push(Cell { start: 0, len: -1 }),
            Some(v) => {
                cells.push(Cell {
                    start: bytes.len(),
                    len: v.len() as i32,
                });
                bytes.extend_from_slice(v);
            }
        })?;
        data.ntuples += 1;
        Ok(())
    }

    fn data(&self) -> Result<&ResultData> {
        self.inner.as_deref().ok_or(Error::ResultCleared)
    }

    /// Release the rows and metadata. Every accessor fails afterwards.
    pub fn clear(&mut self) {
        self.inner = None;
    }

    pub fn is_cleared(&self) -> bool {
        self.inner.is_none()
    }

    pub fn status(&self) -> Result<ResultStatus> {
        Ok(self.data()?.status)
    }

    /// `PGRES_*` name of this result's status.
    pub fn res_status(&self) -> Result<&'static str> {
        Ok(self.data()?.status.name())
    }

    /// Number of rows.
    pub fn ntuples(&self) -> Result<usize> {
        Ok(self.data()?.ntuples)
    }

    /// Number of columns.
    pub fn nfields(&self) -> Result<usize> {
        Ok(self.data()?.columns.len())
    }

    pub fn columns(&self) -> Result<&[Column]> {
        Ok(&self.data()?.columns)
    }

    fn column(&self, col: usize) -> Result<&Column> {
        let data = self.data()?;
        data.columns.get(col).ok_or_else(|| {
            Error::InvalidUsage(format!(
                "column number {col} is out of range 0..{}",
                data.columns.len()
            ))
        })
    }

    /// Column names in order.
    pub fn fields(&self) -> Result<Vec<&str>> {
        Ok(self.data()?.columns.iter().map(|c| c.name.as_str()).collect())
    }

    pub fn fname(&self, col: usize) -> Result<&str> {
        Ok(&self.column(col)?.name)
    }

    /// Column number for a name. Unquoted names fold to lower case and
    /// `"Quoted"` names match exactly.
    pub fn fnumber(&self, name: &str) -> Result<Option<usize>> {
        Ok(column_position(&self.data()?.columns, name))
    }

    pub fn ftable(&self, col: usize) -> Result<Oid> {
        Ok(self.column(col)?.table_oid)
    }

    pub fn ftablecol(&self, col: usize) -> Result<i16> {
        Ok(self.column(col)?.column_id)
    }

    pub fn fformat(&self, col: usize) -> Result<FormatCode> {
        Ok(self.column(col)?.format)
    }

    pub fn ftype(&self, col: usize) -> Result<Oid> {
        Ok(self.column(col)?.type_oid)
    }

    pub fn fmod(&self, col: usize) -> Result<i32> {
        Ok(self.column(col)?.type_modifier)
    }

    pub fn fsize(&self, col: usize) -> Result<i16> {
        Ok(self.column(col)?.type_size)
    }

    fn cell(&self, row: usize, col: usize) -> Result<(&ResultData, Cell)> {
        let data = self.data()?;
        if row >= data.ntuples {
            return Err(Error::InvalidUsage(format!(
                "row number {row} is out of range 0..{}",
                data.ntuples
            )));
        }
        let width = data.columns.len();
        if col >= width {
            return Err(Error::InvalidUsage(format!(
                "column number {col} is out of range 0..{width}"
            )));
        }
        Ok((data, data.cells[row * width + col]))
    }

    /// Raw value; `None` for SQL NULL.
    pub fn getvalue(&self, row: usize, col: usize) -> Result<Option<&[u8]>> {
        let (data, cell) = self.cell(row, col)?;
        Ok(data.value(cell))
    }

    /// Value as UTF-8 text; `None` for SQL NULL.
    pub fn get_str(&self, row: usize, col: usize) -> Result<Option<&str>> {
        self.getvalue(row, col)?.map(utf8).transpose()
    }

    pub fn getisnull(&self, row: usize, col: usize) -> Result<bool> {
        Ok(self.cell(row, col)?.1.len < 0)
    }

    /// Length in bytes; 0 for SQL NULL.
    pub fn getlength(&self, row: usize, col: usize) -> Result<usize> {
        Ok(self.cell(row, col)?.1.len.max(0) as usize)
    }

    /// Number of parameters of a described statement.
    pub fn nparams(&self) -> Result<usize> {
        Ok(self.data()?.param_types.len())
    }

    pub fn paramtype(&self, index: usize) -> Result<Oid> {
        let data = self.data()?;
        data.param_types.get(index).copied().ok_or_else(|| {
            Error::InvalidUsage(format!(
                "parameter number {index} is out of range 0..{}",
                data.param_types.len()
            ))
        })
    }

    /// Command tag, e.g. `INSERT 0 1`.
    pub fn cmd_status(&self) -> Result<&str> {
        Ok(&self.data()?.cmd_status)
    }

    /// Rows affected, for commands that report a count.
    pub fn cmd_tuples(&self) -> Result<Option<u64>> {
        let tag = &self.data()?.cmd_status;
        let mut words = tag.split_ascii_whitespace();
        let count = match (words.next(), words.next(), words.next()) {
            (Some("INSERT"), Some(_oid), Some(n)) => n,
            (
                Some("SELECT" | "UPDATE" | "DELETE" | "MOVE" | "FETCH" | "COPY" | "MERGE"),
                Some(n),
                None,
            ) => n,
            _ => return Ok(None),
        };
        Ok(count.parse().ok())
    }

    /// OID of the row inserted by a single-row INSERT into a table with OIDs.
    pub fn oid_value(&self) -> Result<Option<Oid>> {
        let tag = &self.data()?.cmd_status;
        let mut words = tag.split_ascii_whitespace();
        if words.next() != Some("INSERT") {
            return Ok(None);
        }
        Ok(words
            .next()
            .and_then(|oid| oid.parse::<Oid>().ok())
            .filter(|&oid| oid != 0))
    }

    /// Rendered error text; empty unless the status is an error.
    pub fn error_message(&self) -> Result<&str> {
        Ok(&self.data()?.error_message)
    }

    /// One error field by its protocol code (`b'C'` for SQLSTATE, ...).
    pub fn error_field(&self, code: u8) -> Result<Option<String>> {
        Ok(self.data()?.error.as_ref().and_then(|f| f.get(code)))
    }

    /// Structured error fields; `None` when absent or cleared.
    pub fn error_fields(&self) -> Option<&ErrorFields> {
        self.inner.as_ref()?.error.as_ref()
    }

    /// Iterate the rows. Each call starts from the first row again.
    pub fn rows(&self) -> Result<Rows<'_>> {
        let data = self.data()?;
        Ok(Rows {
            result: data,
            next: 0,
        })
    }

    /// Row view by index.
    pub fn row(&self, index: usize) -> Result<Row<'_>> {
        let data = self.data()?;
        if index >= data.ntuples {
            return Err(Error::InvalidUsage(format!(
                "row number {index} is out of range 0..{}",
                data.ntuples
            )));
        }
        Ok(Row {
            result: data,
            index,
        })
    }
}

impl ResultData {
    fn value(&self, cell: Cell) -> Option<&[u8]> {
        if cell.len < 0 {
            return None;
        }
        let end = cell.start.checked_add(cell.len as usize)?;
        self.data.get(cell.start..end)
    }
}

fn utf8(bytes: &[u8]) -> Result<&str> {
    simdutf8::basic::from_utf8(bytes)
        .map_err(|_| Error::InvalidUsage("value is not valid UTF-8".into()))
}

/// Iterator over the rows of a result.
#[derive(Debug, Clone)]
pub struct Rows<'a> {
    result: &'a ResultData,
    next: usize,
}

impl<'a> Iterator for Rows<'a> {
    type Item = Row<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.result.ntuples {
            return None;
        }
        let row = Row {
            result: self.result,
            index: self.next,
        };
        self.next += 1;
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.result.ntuples - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Rows<'_> {}

/// Borrowed view of one row.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    result: &'a ResultData,
    index: usize,
}

impl<'a> Row<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.result.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.result.columns.is_empty()
    }

    fn cell(&self, col: usize) -> Option<Cell> {
        let width = self.result.columns.len();
        (col < width).then(|| self.result.cells[self.index * width + col])
    }

    /// Raw value of column `col`; `None` when NULL or out of range.
    pub fn get(&self, col: usize) -> Option<&'a [u8]> {
        self.cell(col).and_then(|cell| self.result.value(cell))
    }

    pub fn is_null(&self, col: usize) -> bool {
        self.cell(col).is_some_and(|cell| cell.len < 0)
    }

    pub fn get_str(&self, col: usize) -> Result<Option<&'a str>> {
        self.get(col).map(utf8).transpose()
    }

    /// Value by column name, matched as [`PgResult::fnumber`] does. The
    /// outer `None` means no such column.
    pub fn get_by_name(&self, name: &str) -> Option<Option<&'a [u8]>> {
        let col = column_position(&self.result.columns, name)?;
        Some(self.get(col))
    }

    /// `(name, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&'a str, Option<&'a [u8]>)> + '_ {
        let result = self.result;
        result
            .columns
            .iter()
            .enumerate()
            .map(move |(i, c)| (c.name.as_str(), self.get(i)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, type_oid: Oid) -> FieldDescription<'_> {
        FieldDescription {
            name,
            table_oid: 0,
            column_id: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format: FormatCode::Text,
        }
    }

    fn row_payload(values: &[Option<&[u8]>]) -> Vec<u8> {
        let mut p = (values.len() as u16).to_be_bytes().to_vec();
        for v in values {
            match v {
                None => p.extend_from_slice(&(-1i32).to_be_bytes()),
                Some(v) => {
                    p.extend_from_slice(&(v.len() as i32).to_be_bytes());
                    p.extend_from_slice(v);
                }
            }
        }
        p
    }

    fn sample() -> PgResult {
        let mut r = PgResult::with_columns(
            ResultStatus::TuplesOk,
            &[field("a", 23), field("B", 25)],
        );
        for values in [[Some(&b"5"[..]), None], [Some(&b"6"[..]), Some(&b"six"[..])]] {
            let payload = row_payload(&values);
            r.push_row(&DataRow::parse(&payload).unwrap()).unwrap();
        }
        r.set_cmd_status("SELECT 2");
        r
    }

    #[test]
    fn values_and_nulls() {
        let r = sample();
        assert_eq!(r.ntuples().unwrap(), 2);
        assert_eq!(r.nfields().unwrap(), 2);
        assert_eq!(r.getvalue(0, 0).unwrap(), Some(&b"5"[..]));
        assert!(r.getisnull(0, 1).unwrap());
        assert_eq!(r.getlength(0, 1).unwrap(), 0);
        assert_eq!(r.get_str(1, 1).unwrap(), Some("six"));
        assert_eq!(r.cmd_tuples().unwrap(), Some(2));
    }

    #[test]
    fn out_of_range_is_invalid_usage() {
        let r = sample();
        assert!(matches!(r.getvalue(2, 0), Err(Error::InvalidUsage(_))));
        assert!(matches!(r.fname(5), Err(Error::InvalidUsage(_))));
        assert!(matches!(r.paramtype(0), Err(Error::InvalidUsage(_))));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn offsets_past_four_gib_do_not_wrap() {
        let r = sample();
        let data = r.data().unwrap();
        let far = Cell {
            start: (1usize << 32) + 1,
            len: 1,
        };
        assert_eq!(data.value(far), None);
        assert_eq!(data.value(Cell { start: 1, len: 1 }), Some(&b"6"[..]));
    }

    #[test]
    fn fnumber_folds_case() {
        let r = sample();
        assert_eq!(r.fnumber("A").unwrap(), Some(0));
        assert_eq!(r.fnumber("b").unwrap(), None);
        assert_eq!(r.fnumber("\"B\"").unwrap(), Some(1));
    }

    #[test]
    fn rows_are_restartable() {
        let r = sample();
        let first: Vec<_> = r.rows().unwrap().map(|row| row.get(0)).collect();
        let second: Vec<_> = r.rows().unwrap().map(|row| row.get(0)).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        let row = r.row(1).unwrap();
        assert_eq!(row.get_by_name("\"B\""), Some(Some(&b"six"[..])));
        assert_eq!(row.get_by_name("A"), Some(Some(&b"6"[..])));
        assert_eq!(row.get_by_name("B"), None);
        assert_eq!(row.get_by_name("missing"), None);
        assert!(r.row(0).unwrap().is_null(1));
    }

    #[test]
    fn cleared_result_rejects_access() {
        let mut r = sample();
        r.clear();
        assert!(r.is_cleared());
        assert!(matches!(r.status(), Err(Error::ResultCleared)));
        assert!(matches!(r.getvalue(0, 0), Err(Error::ResultCleared)));
        assert!(matches!(r.rows(), Err(Error::ResultCleared)));
        assert!(r.error_fields().is_none());
    }

    #[test]
    fn wrong_row_width_is_protocol_error() {
        let mut r = PgResult::with_columns(ResultStatus::TuplesOk, &[field("a", 23)]);
        let payload = row_payload(&[None, None]);
        assert!(matches!(
            r.push_row(&DataRow::parse(&payload).unwrap()),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn command_tag_parsing() {
        let mut r = PgResult::new(ResultStatus::CommandOk);
        r.set_cmd_status("INSERT 16390 1");
        assert_eq!(r.cmd_tuples().unwrap(), Some(1));
        assert_eq!(r.oid_value().unwrap(), Some(16390));
        r.set_cmd_status("INSERT 0 3");
        assert_eq!(r.oid_value().unwrap(), None);
        r.set_cmd_status("CREATE TABLE");
        assert_eq!(r.cmd_tuples().unwrap(), None);
    }

    #[test]
    fn error_result_fields() {
        let fields = ErrorFields {
            severity: Some("ERROR".into()),
            code: Some("22012".into()),
            message: Some("division by zero".into()),
            ..ErrorFields::default()
        };
        let r = PgResult::from_error(ResultStatus::FatalError, fields, Verbosity::Default);
        assert_eq!(r.res_status().unwrap(), "PGRES_FATAL_ERROR");
        assert_eq!(r.error_message().unwrap(), "ERROR:  division by zero\n");
        assert_eq!(r.error_field(b'C').unwrap().as_deref(), Some("22012"));
    }
}
