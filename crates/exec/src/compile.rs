//! Compilation of slice graphs into task graphs.
//!
//! Non-shuffle dependencies are pipelined: the consuming task fuses the
//! upstream operator's reader into its own, so a pipeline of map-like
//! operators runs as one task per shard. Shuffle dependencies cut task
//! boundaries: the upstream slice compiles into its own tasks whose
//! partition fan-out equals the downstream shard count, and the
//! downstream shard reads its partition from every upstream task.
//!
//! Compilation is deterministic: every machine compiling the same
//! invocation produces identical task names, so names key all
//! cross-machine state.
//!
//! Slices that are prior results are not recompiled; their already
//! materialized tasks are referenced directly, which is what lets one
//! invocation's output feed another without recomputation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use furrow_common::{Error, Result};
use furrow_frame::BatchReader;
use furrow_slice::{Combiner, Pragma, Slice};

use crate::task::{InvocationHandle, Task, TaskDep, TaskName, TaskOp};

fn slice_ptr(slice: &Arc<dyn Slice>) -> usize {
    Arc::as_ptr(slice) as *const () as usize
}

/// Materialized prior results available to the compiler, keyed by
/// slice identity. The catalog holds the slices so the pointer keys
/// stay valid for its lifetime.
#[derive(Default)]
pub struct ResultCatalog {
    by_ptr: HashMap<usize, (Arc<dyn Slice>, Vec<Arc<Task>>)>,
}

impl ResultCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `slice` as materialized by `tasks`.
    pub fn insert(&mut self, slice: &Arc<dyn Slice>, tasks: Vec<Arc<Task>>) {
        self.by_ptr
            .insert(slice_ptr(slice), (Arc::clone(slice), tasks));
    }

    fn get(&self, slice: &Arc<dyn Slice>) -> Option<&Vec<Arc<Task>>> {
        self.by_ptr.get(&slice_ptr(slice)).map(|(_, tasks)| tasks)
    }

    fn contains(&self, slice: &Arc<dyn Slice>) -> bool {
        self.by_ptr.contains_key(&slice_ptr(slice))
    }
}

/// Compile `slice` into its root tasks, one per shard.
pub fn compile(
    slice: Arc<dyn Slice>,
    invocation: InvocationHandle,
    machine_combiners: bool,
    results: &ResultCatalog,
) -> Result<Vec<Arc<Task>>> {
    let mut compiler = Compiler {
        invocation,
        machine_combiners,
        results,
        memo: HashMap::new(),
        next_op: 0,
        next_combine: 0,
    };
    compiler.compile_tasks(&slice, 1, None, String::new())
}

struct Compiler<'a> {
    invocation: InvocationHandle,
    machine_combiners: bool,
    results: &'a ResultCatalog,
    memo: HashMap<(usize, usize, String), Vec<Arc<Task>>>,
    next_op: usize,
    next_combine: usize,
}

enum Edge {
    /// A shuffle boundary: downstream shard `s` reads partition `s` of
    /// every upstream task.
    Shuffle {
        tasks: Vec<Arc<Task>>,
        expand: bool,
        combine_key: String,
    },
    /// A pipelined dependency on an already materialized result:
    /// downstream shard `s` reads partition 0 of the prior task `s`.
    Materialized { tasks: Vec<Arc<Task>> },
}

impl Edge {
    fn readers_consumed(&self) -> usize {
        match self {
            Edge::Shuffle { tasks, expand, .. } => {
                if *expand {
                    tasks.len()
                } else {
                    1
                }
            }
            Edge::Materialized { .. } => 1,
        }
    }
}

impl<'a> Compiler<'a> {
    fn compile_tasks(
        &mut self,
        slice: &Arc<dyn Slice>,
        num_partition: usize,
        combiner: Option<Arc<dyn Combiner>>,
        combine_key: String,
    ) -> Result<Vec<Arc<Task>>> {
        if let Some(prior) = self.results.get(slice) {
            let have = prior.first().map(|t| t.num_partition).unwrap_or(1);
            if have != num_partition {
                return Err(Error::InvalidConfig(format!(
                    "prior result has {have} partitions, {num_partition} required: \
                     resharding prior results is not supported"
                )));
            }
            return Ok(prior.clone());
        }
        let key = (slice_ptr(slice), num_partition, combine_key.clone());
        if let Some(tasks) = self.memo.get(&key) {
            return Ok(tasks.clone());
        }

        let nshards = slice.num_shards();
        let op = format!("{}{}", slice.name(), self.next_op);
        self.next_op += 1;

        let mut edges = Vec::new();
        let mut pragma = Pragma::default();
        self.collect_edges(slice, nshards, &mut edges, &mut pragma)?;
        let consumed: Vec<usize> = edges.iter().map(Edge::readers_consumed).collect();
        let materialized: HashSet<usize> = self.results.by_ptr.keys().copied().collect();

        let mut tasks = Vec::with_capacity(nshards);
        for shard in 0..nshards {
            let deps = edges
                .iter()
                .map(|edge| match edge {
                    Edge::Shuffle {
                        tasks,
                        expand,
                        combine_key,
                    } => TaskDep {
                        tasks: tasks.clone(),
                        partition: shard,
                        expand: *expand,
                        combine_key: combine_key.clone(),
                    },
                    Edge::Materialized { tasks } => TaskDep {
                        tasks: vec![Arc::clone(&tasks[shard])],
                        partition: 0,
                        expand: false,
                        combine_key: String::new(),
                    },
                })
                .collect();
            let op_fn: TaskOp = {
                let slice = Arc::clone(slice);
                let consumed = consumed.clone();
                let materialized = materialized.clone();
                Arc::new(move |inputs: Vec<Box<dyn BatchReader>>| {
                    let mut inputs = inputs.into_iter();
                    let mut edge = 0;
                    build_reader(&slice, shard, &mut inputs, &mut edge, &consumed, &materialized)
                })
            };
            tasks.push(Task::new(
                TaskName {
                    invocation: self.invocation.index,
                    op: op.clone(),
                    shard,
                    num_shard: nshards,
                },
                op_fn,
                slice.schema(),
                num_partition,
                deps,
                combiner.clone(),
                combine_key.clone(),
                pragma,
                self.invocation,
            ));
        }
        self.memo.insert(key, tasks.clone());
        Ok(tasks)
    }

    // Walk the fused subtree rooted at `slice` depth-first, compiling
    // upstream stages at shuffle boundaries and recording one edge per
    // boundary. The task op reconstructs the same traversal at run
    // time, so edge order is part of the task's contract.
    fn collect_edges(
        &mut self,
        slice: &Arc<dyn Slice>,
        nshards: usize,
        edges: &mut Vec<Edge>,
        pragma: &mut Pragma,
    ) -> Result<()> {
        pragma.exclusive |= slice.pragma().exclusive;
        for i in 0..slice.num_deps() {
            let dep = slice.dep(i);
            if dep.shuffle {
                let combiner = slice.combiner();
                let combine_key = match (&combiner, self.machine_combiners) {
                    (Some(_), true) => {
                        let key = format!(
                            "combine-{:x}-{}",
                            self.invocation.index, self.next_combine
                        );
                        self.next_combine += 1;
                        key
                    }
                    _ => String::new(),
                };
                let tasks =
                    self.compile_tasks(&dep.slice, nshards, combiner, combine_key.clone())?;
                edges.push(Edge::Shuffle {
                    tasks,
                    expand: dep.expand,
                    combine_key,
                });
            } else if self.results.contains(&dep.slice) {
                let tasks = self
                    .results
                    .get(&dep.slice)
                    .expect("checked membership")
                    .clone();
                if tasks.len() != nshards {
                    return Err(Error::InvalidConfig(format!(
                        "prior result has {} shards, consumer has {nshards}: \
                         pipelined results must match shard counts",
                        tasks.len()
                    )));
                }
                edges.push(Edge::Materialized { tasks });
            } else {
                if dep.slice.num_shards() != nshards {
                    return Err(Error::InvalidConfig(format!(
                        "pipelined operator '{}' has {} shards, consumer has {nshards}",
                        dep.slice.name(),
                        dep.slice.num_shards()
                    )));
                }
                self.collect_edges(&dep.slice, nshards, edges, pragma)?;
            }
        }
        Ok(())
    }
}

fn build_reader(
    slice: &Arc<dyn Slice>,
    shard: usize,
    inputs: &mut std::vec::IntoIter<Box<dyn BatchReader>>,
    edge: &mut usize,
    consumed: &[usize],
    materialized: &HashSet<usize>,
) -> Box<dyn BatchReader> {
    let mut readers = Vec::new();
    for i in 0..slice.num_deps() {
        let dep = slice.dep(i);
        if dep.shuffle || materialized.contains(&slice_ptr(&dep.slice)) {
            let take = consumed[*edge];
            *edge += 1;
            for _ in 0..take {
                readers.push(inputs.next().expect("input reader per edge"));
            }
        } else {
            readers.push(build_reader(
                &dep.slice,
                shard,
                inputs,
                edge,
                consumed,
                materialized,
            ));
        }
    }
    slice.reader(shard, readers)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use furrow_frame::Value;
    use furrow_slice::{constant, filter, fold, map, FnCombiner};

    use super::{compile, ResultCatalog};
    use crate::task::InvocationHandle;

    fn kv_batch(rows: Vec<(i64, i64)>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Int64, false),
        ]));
        let (keys, values): (Vec<_>, Vec<_>) = rows.into_iter().unzip();
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(keys)),
                Arc::new(Int64Array::from(values)),
            ],
        )
        .unwrap()
    }

    fn inv(index: u64) -> InvocationHandle {
        InvocationHandle {
            index,
            exclusive: false,
        }
    }

    #[test]
    fn pipelined_operators_fuse_into_one_stage() {
        let slice = constant(4, vec![kv_batch((0..32).map(|i| (i, i)).collect())]).unwrap();
        let slice = filter(
            slice,
            Arc::new(|batch: &RecordBatch| {
                Ok(arrow::array::BooleanArray::from(vec![
                    true;
                    batch.num_rows()
                ]))
            }),
        );
        let tasks = compile(slice, inv(1), false, &ResultCatalog::new()).unwrap();
        assert_eq!(tasks.len(), 4);
        for (shard, task) in tasks.iter().enumerate() {
            assert!(task.deps.is_empty(), "pipelined stage has no task deps");
            assert_eq!(task.name.shard, shard);
            assert_eq!(task.num_partition, 1);
        }
    }

    #[test]
    fn shuffle_cuts_a_stage_boundary() {
        let slice = constant(3, vec![kv_batch((0..30).map(|i| (i % 5, 1)).collect())]).unwrap();
        let folded = fold(
            slice,
            Arc::new(FnCombiner(|acc: &mut [Value], row: &[Value]| {
                if let (Value::Int64(a), Value::Int64(b)) = (&acc[0], &row[0]) {
                    acc[0] = Value::Int64(a + b);
                }
                Ok(())
            })),
        )
        .unwrap();
        let tasks = compile(folded, inv(2), false, &ResultCatalog::new()).unwrap();
        assert_eq!(tasks.len(), 3);
        for (shard, task) in tasks.iter().enumerate() {
            assert_eq!(task.deps.len(), 1);
            let dep = &task.deps[0];
            assert_eq!(dep.num_task(), 3);
            assert_eq!(dep.partition, shard);
            assert!(dep.combine_key.is_empty());
            // Upstream tasks partition into the fold's shard count and
            // carry the combiner.
            for up in &dep.tasks {
                assert_eq!(up.num_partition, 3);
                assert!(up.combiner.is_some());
            }
        }
    }

    #[test]
    fn machine_combiners_share_a_combine_key() {
        let slice = constant(2, vec![kv_batch((0..8).map(|i| (i % 2, 1)).collect())]).unwrap();
        let folded = fold(
            slice,
            Arc::new(FnCombiner(|_: &mut [Value], _: &[Value]| Ok(()))),
        )
        .unwrap();
        let tasks = compile(folded, inv(3), true, &ResultCatalog::new()).unwrap();
        let dep = &tasks[0].deps[0];
        assert!(!dep.combine_key.is_empty());
        for up in &dep.tasks {
            assert_eq!(up.combine_key, dep.combine_key);
        }
    }

    #[test]
    fn compilation_names_are_deterministic() {
        let build = || {
            let slice = constant(2, vec![kv_batch((0..8).map(|i| (i, i)).collect())]).unwrap();
            let slice = map(
                slice,
                Arc::new(Schema::new(vec![
                    Field::new("k", DataType::Int64, false),
                    Field::new("v", DataType::Int64, false),
                ])),
                Arc::new(|b: &RecordBatch| Ok(b.clone())),
            );
            compile(slice, inv(7), false, &ResultCatalog::new()).unwrap()
        };
        let a = build();
        let b = build();
        let names_a: Vec<_> = a.iter().map(|t| t.name.clone()).collect();
        let names_b: Vec<_> = b.iter().map(|t| t.name.clone()).collect();
        assert_eq!(names_a, names_b);
    }

    #[test]
    fn prior_results_are_referenced_not_recompiled() {
        let upstream = constant(2, vec![kv_batch((0..8).map(|i| (i, i)).collect())]).unwrap();
        let upstream_tasks = compile(
            Arc::clone(&upstream),
            inv(4),
            false,
            &ResultCatalog::new(),
        )
        .unwrap();

        let mut results = ResultCatalog::new();
        results.insert(&upstream, upstream_tasks.clone());

        let mapped = map(
            Arc::clone(&upstream),
            upstream.schema(),
            Arc::new(|b: &RecordBatch| Ok(b.clone())),
        );
        let tasks = compile(mapped, inv(5), false, &results).unwrap();
        assert_eq!(tasks.len(), 2);
        for (shard, task) in tasks.iter().enumerate() {
            assert_eq!(task.deps.len(), 1);
            assert_eq!(task.deps[0].partition, 0);
            assert_eq!(task.deps[0].tasks[0].name, upstream_tasks[shard].name);
        }
    }
}
