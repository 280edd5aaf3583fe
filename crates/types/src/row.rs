//! The value/row/batch data model carried by chunked save files.
//!
//! A [`RowBatch`] is self-describing: it carries its own column list so a
//! batch read from a save file can be checked (and converted) against the
//! current catalog schema without consulting the file header again. This
//! matters because a snapshot may predate schema changes — columns added
//! since the save are populated with nulls, columns dropped since the save
//! are discarded by name.

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Errors produced by row conversion and batch assembly.
#[derive(Debug, Snafu)]
pub enum RowError {
    /// A row's cell count does not match the batch's column count.
    #[snafu(display("Row arity mismatch: row has {got} cells, batch has {expected} columns"))]
    ArityMismatch {
        /// Cells in the offending row.
        got: usize,
        /// Columns declared by the batch.
        expected: usize,
    },

    /// A cell's value type does not match its declared column type.
    #[snafu(display("Type mismatch in column {column}: expected {expected:?}"))]
    TypeMismatch {
        /// Name of the offending column.
        column: String,
        /// The declared column type.
        expected: ColumnType,
    },

    /// The schema names a partition column index outside its column list.
    #[snafu(display("Partition column index {index} out of range ({columns} columns)"))]
    PartitionColumnOutOfRange {
        /// The out-of-range index.
        index: usize,
        /// Number of columns in the schema.
        columns: usize,
    },
}

/// Column data types supported by the save-file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// 64-bit signed integer.
    I64,
    /// UTF-8 string.
    Str,
    /// Opaque byte array.
    Bytes,
}

/// One column: name plus declared type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name, unique within its table.
    pub name: String,
    /// Declared type.
    pub ty: ColumnType,
}

impl Column {
    /// Creates a column descriptor.
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self { name: name.into(), ty }
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// 64-bit signed integer.
    I64(i64),
    /// UTF-8 string.
    Str(String),
    /// Opaque bytes.
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns whether this value is acceptable for the given column type.
    /// `Null` is acceptable for every type.
    pub fn matches(&self, ty: ColumnType) -> bool {
        matches!(
            (self, ty),
            (Value::Null, _)
                | (Value::I64(_), ColumnType::I64)
                | (Value::Str(_), ColumnType::Str)
                | (Value::Bytes(_), ColumnType::Bytes)
        )
    }
}

/// One row: a cell per column, in column order.
pub type Row = Vec<Value>;

/// Schema of a table in the current catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name, unique within the database.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<Column>,
    /// Index of the partitioning column, `None` for replicated tables.
    pub partition_column: Option<usize>,
    /// Whether the table is replicated to every partition.
    pub is_replicated: bool,
}

impl TableSchema {
    /// Creates a partitioned table schema.
    ///
    /// # Errors
    ///
    /// Returns [`RowError::PartitionColumnOutOfRange`] if `partition_column`
    /// does not index into `columns`.
    pub fn partitioned(
        name: impl Into<String>,
        columns: Vec<Column>,
        partition_column: usize,
    ) -> Result<Self, RowError> {
        if partition_column >= columns.len() {
            return Err(RowError::PartitionColumnOutOfRange {
                index: partition_column,
                columns: columns.len(),
            });
        }
        Ok(Self {
            name: name.into(),
            columns,
            partition_column: Some(partition_column),
            is_replicated: false,
        })
    }

    /// Creates a replicated table schema.
    pub fn replicated(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self { name: name.into(), columns, partition_column: None, is_replicated: true }
    }
}

/// A self-describing batch of rows, the unit stored in one save-file chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowBatch {
    /// The columns every row in this batch conforms to.
    pub columns: Vec<Column>,
    /// Rows, each with exactly `columns.len()` cells.
    pub rows: Vec<Row>,
}

impl RowBatch {
    /// Creates an empty batch over the given columns.
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns, rows: Vec::new() }
    }

    /// Appends a row after checking arity and cell types.
    ///
    /// # Errors
    ///
    /// Returns [`RowError`] on arity or type mismatch.
    pub fn push_row(&mut self, row: Row) -> Result<(), RowError> {
        if row.len() != self.columns.len() {
            return Err(RowError::ArityMismatch { got: row.len(), expected: self.columns.len() });
        }
        for (cell, column) in row.iter().zip(&self.columns) {
            if !cell.matches(column.ty) {
                return Err(RowError::TypeMismatch {
                    column: column.name.clone(),
                    expected: column.ty,
                });
            }
        }
        self.rows.push(row);
        Ok(())
    }

    /// Number of rows in the batch.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Whether this batch must be converted before loading into a table
    /// with the given schema.
    ///
    /// Cheap structural probe intended to run once per file, not per chunk:
    /// the answer is identical for every chunk of one save file.
    pub fn needs_conversion(&self, target: &TableSchema) -> bool {
        self.columns != target.columns
    }

    /// Converts the batch to the target schema by column name.
    ///
    /// Target columns missing from the batch become `Null`; batch columns
    /// absent from the target are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`RowError::TypeMismatch`] if a carried-over cell does not
    /// match the target column's declared type.
    pub fn convert_to(&self, target: &TableSchema) -> Result<RowBatch, RowError> {
        // source column index for each target column, by name
        let mapping: Vec<Option<usize>> = target
            .columns
            .iter()
            .map(|tc| self.columns.iter().position(|sc| sc.name == tc.name))
            .collect();

        let mut out = RowBatch::new(target.columns.clone());
        out.rows.reserve(self.rows.len());
        for row in &self.rows {
            let mut converted = Vec::with_capacity(target.columns.len());
            for (target_col, source_idx) in target.columns.iter().zip(&mapping) {
                let cell = match source_idx {
                    Some(i) => row[*i].clone(),
                    None => Value::Null,
                };
                if !cell.matches(target_col.ty) {
                    return Err(RowError::TypeMismatch {
                        column: target_col.name.clone(),
                        expected: target_col.ty,
                    });
                }
                converted.push(cell);
            }
            out.rows.push(converted);
        }
        Ok(out)
    }
}
