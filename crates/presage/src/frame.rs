//! Timestamped prediction series exchanged between the codec, the assembler
//! and downstream sinks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// One timestamped row of model output values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRow {
    pub timestamp: DateTime<Utc>,
    pub values: Vec<f64>,
}

/// A column-labelled block of timestamped rows.
///
/// Frames are produced per (machine, window) response and concatenated per
/// machine at assembly time. Row order inside a frame follows the server
/// payload; cross-window order is restored by the assembler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionFrame {
    columns: Vec<String>,
    rows: Vec<FrameRow>,
}

impl PredictionFrame {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(columns: Vec<String>, rows: Vec<FrameRow>) -> Result<Self, ClientError> {
        let frame = Self { columns, rows };
        frame.validate()?;
        Ok(frame)
    }

    /// Check that every row is exactly as wide as the column table.
    pub fn validate(&self) -> Result<(), ClientError> {
        for (index, row) in self.rows.iter().enumerate() {
            if row.values.len() != self.columns.len() {
                return Err(ClientError::protocol(format!(
                    "row {index} has {} values for {} columns",
                    row.values.len(),
                    self.columns.len()
                )));
            }
        }
        Ok(())
    }

    pub fn push_row(&mut self, row: FrameRow) -> Result<(), ClientError> {
        if row.values.len() != self.columns.len() {
            return Err(ClientError::protocol(format!(
                "row has {} values for {} columns",
                row.values.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Append another frame's rows. The column tables must match exactly.
    pub fn append(&mut self, other: PredictionFrame) -> Result<(), ClientError> {
        if other.columns != self.columns {
            return Err(ClientError::protocol(format!(
                "column mismatch: expected {:?}, got {:?}",
                self.columns, other.columns
            )));
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[FrameRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
