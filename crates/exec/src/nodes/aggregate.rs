//! Aggregate node: scalar and grouped (hash) aggregation.
//!
//! Scalar mode keeps one kernel state per `(function, target)` pair per local
//! partition; batches are routed round-robin across partitions, states are
//! merged pairwise at end-of-stream, and the finalized values are emitted as
//! one single-row batch of scalars.
//!
//! Grouped mode routes each batch through a per-partition [`Grouper`] and
//! keeps one kernel state slot per group per aggregation. At end-of-stream,
//! one partition's grouper re-consumes the others' uniques to translate group
//! ids, states are merged group-wise, and the output batch carries the
//! aggregate columns followed by the key columns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arrow::array::Array;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use brook_common::{BrookError, Result};
use brook_compute::{
    apply_groupings, make_groupings, make_kernel, scalars_to_array, AggregateKernel,
    AggregateOptions, Datum, ExecBatch, Grouper,
};

use crate::declaration::AggregateNodeOptions;
use crate::node::{ExecNode, NodeCtx};
use crate::plan::lock;

struct AggSpec {
    kernel: String,
    options: Option<AggregateOptions>,
    target: usize,
    input_type: DataType,
    out_type: DataType,
}

impl AggSpec {
    fn fresh_kernel(&self) -> Result<Box<dyn AggregateKernel>> {
        make_kernel(&self.kernel, self.options.as_ref(), &self.input_type)
    }
}

struct GroupedPartition {
    grouper: Grouper,
    /// Kernel states indexed `[aggregation][group]`.
    states: Vec<Vec<Box<dyn AggregateKernel>>>,
}

enum PartitionSet {
    Scalar(Vec<Vec<Box<dyn AggregateKernel>>>),
    Grouped(Vec<GroupedPartition>),
}

/// Scalar or grouped aggregation over a single input.
pub struct AggregateNode {
    label: String,
    schema: SchemaRef,
    specs: Vec<AggSpec>,
    keys: Vec<usize>,
    key_types: Vec<DataType>,
    partitions: Mutex<Option<PartitionSet>>,
    next_partition: AtomicUsize,
}

impl AggregateNode {
    /// Resolve targets/keys against the input schema and probe kernels for
    /// output types.
    pub fn try_new(input_schema: SchemaRef, options: &AggregateNodeOptions) -> Result<Self> {
        if options.aggregates.len() != options.targets.len()
            || options.aggregates.len() != options.names.len()
        {
            return Err(BrookError::Invalid(format!(
                "aggregate spec lengths disagree: {} aggregates, {} targets, {} names",
                options.aggregates.len(),
                options.targets.len(),
                options.names.len()
            )));
        }
        let grouped = !options.keys.is_empty();

        let mut specs = Vec::with_capacity(options.aggregates.len());
        let mut fields = Vec::new();
        for (idx, (function, agg_options)) in options.aggregates.iter().enumerate() {
            let kernel = if grouped {
                function
                    .strip_prefix("hash_")
                    .ok_or_else(|| {
                        BrookError::Invalid(format!(
                            "grouped aggregation requires hash_-prefixed functions, got '{function}'"
                        ))
                    })?
                    .to_string()
            } else {
                if function.starts_with("hash_") {
                    return Err(BrookError::Invalid(format!(
                        "'{function}' requires key columns"
                    )));
                }
                function.clone()
            };
            if grouped && matches!(kernel.as_str(), "mode" | "quantile" | "tdigest") {
                return Err(BrookError::NotImplemented(format!(
                    "grouped aggregation over array-producing kernel '{kernel}'"
                )));
            }
            let target = input_schema.index_of(&options.targets[idx]).map_err(|_| {
                BrookError::TypeError(format!(
                    "unknown aggregate target column '{}'",
                    options.targets[idx]
                ))
            })?;
            let input_type = input_schema.field(target).data_type().clone();
            let probe = make_kernel(&kernel, agg_options.as_ref(), &input_type)?;
            fields.push(Field::new(&options.names[idx], probe.out_type(), true));
            specs.push(AggSpec {
                kernel,
                options: agg_options.clone(),
                target,
                input_type,
                out_type: probe.out_type(),
            });
        }

        let mut keys = Vec::with_capacity(options.keys.len());
        let mut key_types = Vec::with_capacity(options.keys.len());
        for key in &options.keys {
            let idx = input_schema.index_of(key).map_err(|_| {
                BrookError::TypeError(format!("unknown key column '{key}'"))
            })?;
            let field = input_schema.field(idx);
            fields.push(field.clone());
            keys.push(idx);
            key_types.push(field.data_type().clone());
        }

        Ok(Self {
            label: "aggregate".to_string(),
            schema: Arc::new(Schema::new(fields)),
            specs,
            keys,
            key_types,
            partitions: Mutex::new(None),
            next_partition: AtomicUsize::new(0),
        })
    }

    fn consume_grouped(&self, part: &mut GroupedPartition, batch: &ExecBatch) -> Result<()> {
        let key_datums: Vec<Datum> = self.keys.iter().map(|&i| batch.column(i).clone()).collect();
        let ids = part.grouper.consume(&key_datums, batch.length)?;
        let num_groups = part.grouper.num_groups();
        for (a, spec) in self.specs.iter().enumerate() {
            while part.states[a].len() < num_groups {
                part.states[a].push(spec.fresh_kernel()?);
            }
        }

        let groupings = make_groupings(&ids, num_groups);
        for (a, spec) in self.specs.iter().enumerate() {
            match batch.column(spec.target) {
                Datum::Array(arr) => {
                    let per_group = apply_groupings(&groupings, arr)?;
                    for (g, values) in per_group.into_iter().enumerate() {
                        if values.len() > 0 {
                            let len = values.len();
                            part.states[a][g].consume(&Datum::Array(values), len)?;
                        }
                    }
                }
                Datum::Scalar(s) => {
                    for (g, positions) in groupings.iter().enumerate() {
                        if !positions.is_empty() {
                            part.states[a][g]
                                .consume(&Datum::Scalar(s.clone()), positions.len())?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn finalize_scalar(
        &self,
        mut parts: Vec<Vec<Box<dyn AggregateKernel>>>,
    ) -> Result<ExecBatch> {
        let mut base = parts.remove(0);
        for other in parts {
            for (kernel, state) in base.iter_mut().zip(other) {
                kernel.merge_from(state)?;
            }
        }
        let values = base
            .into_iter()
            .map(|mut kernel| kernel.finalize())
            .collect::<Result<Vec<_>>>()?;
        ExecBatch::try_new(values, 1)
    }

    fn finalize_grouped(&self, mut parts: Vec<GroupedPartition>) -> Result<ExecBatch> {
        let mut base = parts.remove(0);
        for other in parts {
            let num_other = other.grouper.num_groups();
            if num_other == 0 {
                continue;
            }
            let uniques: Vec<Datum> = other
                .grouper
                .get_uniques()?
                .into_iter()
                .map(Datum::Array)
                .collect();
            // translation table from the other partition's ids to ours
            let id_map = base.grouper.consume(&uniques, num_other)?;
            let num_groups = base.grouper.num_groups();
            for (a, spec) in self.specs.iter().enumerate() {
                while base.states[a].len() < num_groups {
                    base.states[a].push(spec.fresh_kernel()?);
                }
            }
            for (a, states) in other.states.into_iter().enumerate() {
                for (g, state) in states.into_iter().enumerate() {
                    let target = id_map.value(g) as usize;
                    base.states[a][target].merge_from(state)?;
                }
            }
        }

        let num_groups = base.grouper.num_groups();
        let mut columns = Vec::with_capacity(self.specs.len() + self.keys.len());
        for (a, spec) in self.specs.iter().enumerate() {
            let mut scalars = Vec::with_capacity(num_groups);
            for kernel in base.states[a].iter_mut() {
                match kernel.finalize()? {
                    Datum::Scalar(s) => scalars.push(s),
                    Datum::Array(_) => {
                        return Err(BrookError::NotImplemented(format!(
                            "grouped aggregation over array-producing kernel '{}'",
                            spec.kernel
                        )))
                    }
                }
            }
            columns.push(Datum::Array(scalars_to_array(&scalars, &spec.out_type)?));
        }
        for key_column in base.grouper.get_uniques()? {
            columns.push(Datum::Array(key_column));
        }
        ExecBatch::try_new(columns, num_groups)
    }
}

impl ExecNode for AggregateNode {
    fn label(&self) -> &str {
        &self.label
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn start_producing(&self, ctx: &NodeCtx) -> Result<()> {
        let partitions = ctx.config().aggregate_partitions.max(1);
        let set = if self.keys.is_empty() {
            let mut parts = Vec::with_capacity(partitions);
            for _ in 0..partitions {
                parts.push(
                    self.specs
                        .iter()
                        .map(|s| s.fresh_kernel())
                        .collect::<Result<Vec<_>>>()?,
                );
            }
            PartitionSet::Scalar(parts)
        } else {
            let mut parts = Vec::with_capacity(partitions);
            for _ in 0..partitions {
                parts.push(GroupedPartition {
                    grouper: Grouper::new(self.key_types.clone()),
                    states: self.specs.iter().map(|_| Vec::new()).collect(),
                });
            }
            PartitionSet::Grouped(parts)
        };
        *lock(&self.partitions) = Some(set);
        Ok(())
    }

    fn stop_producing(&self, _ctx: &NodeCtx) {
        lock(&self.partitions).take();
    }

    fn input_received(&self, _ctx: &NodeCtx, _input: usize, batch: ExecBatch) -> Result<()> {
        let mut guard = lock(&self.partitions);
        let set = guard
            .as_mut()
            .ok_or_else(|| BrookError::Execution("aggregate is not running".to_string()))?;
        match set {
            PartitionSet::Scalar(parts) => {
                let p = self.next_partition.fetch_add(1, Ordering::SeqCst) % parts.len();
                for (spec, kernel) in self.specs.iter().zip(parts[p].iter_mut()) {
                    kernel.consume(batch.column(spec.target), batch.length)?;
                }
                Ok(())
            }
            PartitionSet::Grouped(parts) => {
                let p = self.next_partition.fetch_add(1, Ordering::SeqCst) % parts.len();
                self.consume_grouped(&mut parts[p], &batch)
            }
        }
    }

    fn input_finished(&self, ctx: &NodeCtx, _input: usize, _total_batches: usize) -> Result<()> {
        // merging takes ownership of every partition state
        let set = lock(&self.partitions)
            .take()
            .ok_or_else(|| BrookError::Execution("aggregate is not running".to_string()))?;
        let out = match set {
            PartitionSet::Scalar(parts) => self.finalize_scalar(parts)?,
            PartitionSet::Grouped(parts) => self.finalize_grouped(parts)?,
        };
        ctx.emit(out)?;
        ctx.finish_output(1);
        Ok(())
    }
}
