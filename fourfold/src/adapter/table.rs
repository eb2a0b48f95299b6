//! Adapter for per-role result tables of a time-series engine.
//!
//! Time-series engines typically answer an M4 request with one sub-query per
//! role (`first`, `last`, `min`, `max`), each returning its own table. Field
//! order inside a table is not guaranteed, so columns are matched to measures
//! by name. Columns that do not name a measure (time, tags) are ignored.
//!
//! Tables are interleaved positionally: rows are taken in bucket order and,
//! within one bucket, in table order. Rows shorter than the column list have
//! omitted values; those yield no observation.

use std::collections::VecDeque;
use std::vec;

use super::{AdapterContext, MeasureId, OrderingGuard, RawTuple, Role};
use crate::error::{AdapterError, Result};

/// One row of a result table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    /// The row timestamp.
    pub time: i64,
    /// Values by column position; `None` for nulls.
    pub values: Vec<Option<f64>>,
}

impl TableRow {
    /// Creates a row.
    pub fn new(time: i64, values: Vec<Option<f64>>) -> Self {
        Self { time, values }
    }
}

/// The result of one role sub-query.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultTable {
    /// Which M4 role the table answers.
    pub role: Role,
    /// Column names, in the order values appear in each row.
    pub columns: Vec<String>,
    /// Rows in time order.
    pub rows: Vec<TableRow>,
}

#[derive(Debug)]
struct TableCursor {
    role: Role,
    measures: Vec<Option<MeasureId>>,
    rows: vec::IntoIter<TableRow>,
    head: Option<(u32, TableRow)>,
    last_key: Option<u32>,
}

impl TableCursor {
    fn fill_head(&mut self, context: &AdapterContext) -> Result<()> {
        if self.head.is_some() {
            return Ok(());
        }
        let Some(row) = self.rows.next() else {
            return Ok(());
        };

        if row.values.len() > self.measures.len() {
            return Err(AdapterError::protocol(format!(
                "{:?} table row at {} has {} values for {} columns",
                self.role,
                row.time,
                row.values.len(),
                self.measures.len()
            ))
            .into());
        }

        let key = context.bucket_of(row.time)?;
        if self.last_key.is_some_and(|last| key < last) {
            return Err(AdapterError::protocol(format!(
                "{:?} table is not time-ordered at {}",
                self.role, row.time
            ))
            .into());
        }
        self.last_key = Some(key);
        self.head = Some((key, row));
        Ok(())
    }
}

/// Interleaves per-role result tables into raw tuples.
#[derive(Debug)]
pub struct TableAdapter {
    tables: Vec<TableCursor>,
    context: AdapterContext,
    guard: OrderingGuard,
    pending: VecDeque<RawTuple>,
    done: bool,
}

impl TableAdapter {
    /// Wraps the tables of one query; all rows belong to union group 0.
    pub fn new(tables: Vec<ResultTable>, context: AdapterContext) -> Self {
        let tables = tables
            .into_iter()
            .map(|table| TableCursor {
                role: table.role,
                measures: table
                    .columns
                    .iter()
                    .map(|name| context.measures.id_of(name))
                    .collect(),
                rows: table.rows.into_iter(),
                head: None,
                last_key: None,
            })
            .collect();
        let guard = context.guard();

        Self {
            tables,
            context,
            guard,
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn advance(&mut self) -> Result<Option<RawTuple>> {
        loop {
            if let Some(tuple) = self.pending.pop_front() {
                return Ok(Some(tuple));
            }

            for table in &mut self.tables {
                table.fill_head(&self.context)?;
            }

            // Smallest bucket key wins; the first table wins ties.
            let next = self
                .tables
                .iter()
                .enumerate()
                .filter_map(|(i, t)| t.head.as_ref().map(|(key, _)| (*key, i)))
                .min();
            let Some((_, index)) = next else {
                return Ok(None);
            };

            let table = &mut self.tables[index];
            let Some((bucket_key, row)) = table.head.take() else {
                continue;
            };
            let timestamp = table.role.is_temporal().then_some(row.time);

            for (measure, value) in table.measures.iter().zip(&row.values) {
                if let (Some(measure), Some(value)) = (measure, value) {
                    let tuple = RawTuple {
                        union_group: 0,
                        bucket_key,
                        measure: *measure,
                        role: table.role,
                        timestamp,
                        value: Some(*value),
                    };
                    self.guard.check(&tuple)?;
                    self.pending.push_back(tuple);
                }
            }
        }
    }
}

impl Iterator for TableAdapter {
    type Item = Result<RawTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(tuple)) => Some(Ok(tuple)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
