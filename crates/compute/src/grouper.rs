//! Streaming group identifier for hash aggregation.
//!
//! Assigns each distinct key combination a dense id in first-seen order. The
//! mapping is stable for the lifetime of the grouper; merging partitions is a
//! matter of re-consuming one grouper's uniques through another and using the
//! returned ids as a translation table.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, UInt32Array, UInt32Builder};
use arrow::compute::take;
use arrow_schema::DataType;
use brook_common::{BrookError, Result};

use crate::batch::Datum;
use crate::scalar::{scalars_to_array, ScalarValue};

/// Maps key tuples to dense group ids starting at 0.
#[derive(Debug)]
pub struct Grouper {
    key_types: Vec<DataType>,
    map: HashMap<Vec<ScalarValue>, u32>,
    uniques: Vec<Vec<ScalarValue>>,
}

impl Grouper {
    /// Create a grouper for the given key column types.
    pub fn new(key_types: Vec<DataType>) -> Self {
        Self {
            key_types,
            map: HashMap::new(),
            uniques: Vec::new(),
        }
    }

    /// Consume one batch of key columns; returns each row's group id.
    ///
    /// Ids are dense and assigned in first-seen order. Scalar key columns are
    /// broadcast to `length` rows.
    pub fn consume(&mut self, keys: &[Datum], length: usize) -> Result<UInt32Array> {
        if keys.len() != self.key_types.len() {
            return Err(BrookError::Invalid(format!(
                "expected {} key columns, got {}",
                self.key_types.len(),
                keys.len()
            )));
        }
        let map = &mut self.map;
        let uniques = &mut self.uniques;
        let mut ids = UInt32Builder::with_capacity(length);
        for row in 0..length {
            let mut key = Vec::with_capacity(keys.len());
            for k in keys {
                match k {
                    Datum::Array(a) => key.push(ScalarValue::try_from_array(a, row)?),
                    Datum::Scalar(s) => key.push(s.clone()),
                }
            }
            let next = uniques.len() as u32;
            let id = *map.entry(key.clone()).or_insert_with(|| {
                uniques.push(key);
                next
            });
            ids.append_value(id);
        }
        Ok(ids.finish())
    }

    /// One row per group, in id order, as key column arrays.
    pub fn get_uniques(&self) -> Result<Vec<ArrayRef>> {
        let mut columns = Vec::with_capacity(self.key_types.len());
        for (col, dt) in self.key_types.iter().enumerate() {
            let values: Vec<ScalarValue> = self.uniques.iter().map(|k| k[col].clone()).collect();
            columns.push(scalars_to_array(&values, dt)?);
        }
        Ok(columns)
    }

    /// Current distinct key count.
    pub fn num_groups(&self) -> usize {
        self.uniques.len()
    }

    /// Key column types this grouper was built with.
    pub fn key_types(&self) -> &[DataType] {
        &self.key_types
    }
}

/// For each group id `0..num_groups`, the positions at which it appears in
/// `ids`, preserving input order. Absent ids yield empty lists.
pub fn make_groupings(ids: &UInt32Array, num_groups: usize) -> Vec<Vec<u32>> {
    let mut groupings = vec![Vec::new(); num_groups];
    for pos in 0..ids.len() {
        let id = ids.value(pos) as usize;
        if id < num_groups {
            groupings[id].push(pos as u32);
        }
    }
    groupings
}

/// Gather `values` into one array per group, parallel to `groupings`.
pub fn apply_groupings(groupings: &[Vec<u32>], values: &ArrayRef) -> Result<Vec<ArrayRef>> {
    let mut out = Vec::with_capacity(groupings.len());
    for positions in groupings {
        let indices = UInt32Array::from(positions.clone());
        let gathered = take(values.as_ref(), &indices, None)
            .map_err(|e| BrookError::Execution(format!("grouping gather failed: {e}")))?;
        out.push(gathered);
    }
    Ok(out)
}
