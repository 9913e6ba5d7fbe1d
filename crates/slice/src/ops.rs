//! Built-in slice operators.
//!
//! Operators are batch-level: user functions transform whole record
//! batches. Pipelined operators (map, filter, flatmap, head, sinks)
//! declare non-shuffle dependencies and are fused into their consumer's
//! task by the compiler; fold declares a shuffled dependency and
//! carries the combiner applied on the producing side.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::BooleanArray;
use arrow::compute::filter_record_batch;
use arrow::record_batch::RecordBatch;
use arrow_schema::{Schema, SchemaRef};
use async_trait::async_trait;
use furrow_common::{Error, Result};
use furrow_frame::{concat, rows_from_batch, rows_to_batch, BatchReader, Value};

use crate::{Combiner, Pragma, Slice, SliceDep};

/// Batch transform used by [`map`].
pub type MapFn = Arc<dyn Fn(&RecordBatch) -> Result<RecordBatch> + Send + Sync>;
/// Row predicate used by [`filter`]; returns one boolean per row.
pub type FilterFn = Arc<dyn Fn(&RecordBatch) -> Result<BooleanArray> + Send + Sync>;
/// Expanding transform used by [`flatmap`].
pub type FlatmapFn = Arc<dyn Fn(&RecordBatch) -> Result<Vec<RecordBatch>> + Send + Sync>;
/// Per-shard source constructor used by [`read_from`].
pub type SourceFn = Arc<dyn Fn(usize) -> Box<dyn BatchReader> + Send + Sync>;
/// Per-shard sink used by [`write_to`]; called with `None` at end of
/// the shard's stream.
pub type WriteFn = Arc<dyn Fn(usize, Option<&RecordBatch>) -> Result<()> + Send + Sync>;
/// Per-shard visitor used by [`scan`].
pub type ScanFn = Arc<dyn Fn(usize, &RecordBatch) -> Result<()> + Send + Sync>;

fn empty_schema() -> SchemaRef {
    Arc::new(Schema::empty())
}

// ---------------------------------------------------------------- const

struct ConstSlice {
    schema: SchemaRef,
    shards: Vec<Vec<RecordBatch>>,
}

/// A constant slice: the provided rows, split evenly across `nshards`.
pub fn constant(nshards: usize, batches: Vec<RecordBatch>) -> Result<Arc<dyn Slice>> {
    if nshards == 0 {
        return Err(Error::InvalidConfig("const requires at least one shard".into()));
    }
    let schema = batches
        .first()
        .map(|b| b.schema())
        .ok_or_else(|| Error::InvalidConfig("const requires at least one batch".into()))?;
    let all = concat(&schema, &batches)?;
    let rows = all.num_rows();
    let per_shard = rows / nshards;
    let remainder = rows % nshards;
    let mut shards = Vec::with_capacity(nshards);
    let mut offset = 0;
    for shard in 0..nshards {
        let len = per_shard + usize::from(shard < remainder);
        shards.push(if len == 0 {
            Vec::new()
        } else {
            vec![all.slice(offset, len)]
        });
        offset += len;
    }
    Ok(Arc::new(ConstSlice { schema, shards }))
}

impl Slice for ConstSlice {
    fn name(&self) -> &'static str {
        "const"
    }
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }
    fn num_shards(&self) -> usize {
        self.shards.len()
    }
    fn num_deps(&self) -> usize {
        0
    }
    fn dep(&self, _i: usize) -> SliceDep {
        unreachable!("const has no dependencies")
    }
    fn reader(&self, shard: usize, _inputs: Vec<Box<dyn BatchReader>>) -> Box<dyn BatchReader> {
        Box::new(furrow_frame::BatchesReader::new(self.shards[shard].clone()))
    }
}

// ---------------------------------------------------------------- map

struct MapSlice {
    input: Arc<dyn Slice>,
    schema: SchemaRef,
    f: MapFn,
}

/// Apply a batch transform to every batch of `input`.
pub fn map(input: Arc<dyn Slice>, schema: SchemaRef, f: MapFn) -> Arc<dyn Slice> {
    Arc::new(MapSlice { input, schema, f })
}

struct MapReader {
    input: Box<dyn BatchReader>,
    f: MapFn,
}

#[async_trait]
impl BatchReader for MapReader {
    async fn read(&mut self) -> Result<Option<RecordBatch>> {
        match self.input.read().await? {
            Some(batch) => Ok(Some((self.f)(&batch)?)),
            None => Ok(None),
        }
    }
}

impl Slice for MapSlice {
    fn name(&self) -> &'static str {
        "map"
    }
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }
    fn num_shards(&self) -> usize {
        self.input.num_shards()
    }
    fn num_deps(&self) -> usize {
        1
    }
    fn dep(&self, _i: usize) -> SliceDep {
        SliceDep::pipelined(Arc::clone(&self.input))
    }
    fn reader(&self, _shard: usize, mut inputs: Vec<Box<dyn BatchReader>>) -> Box<dyn BatchReader> {
        Box::new(MapReader {
            input: inputs.remove(0),
            f: Arc::clone(&self.f),
        })
    }
}

// ---------------------------------------------------------------- filter

struct FilterSlice {
    input: Arc<dyn Slice>,
    f: FilterFn,
}

/// Keep the rows of `input` selected by the predicate.
pub fn filter(input: Arc<dyn Slice>, f: FilterFn) -> Arc<dyn Slice> {
    Arc::new(FilterSlice { input, f })
}

struct FilterReader {
    input: Box<dyn BatchReader>,
    f: FilterFn,
}

#[async_trait]
impl BatchReader for FilterReader {
    async fn read(&mut self) -> Result<Option<RecordBatch>> {
        while let Some(batch) = self.input.read().await? {
            let mask = (self.f)(&batch)?;
            let kept = filter_record_batch(&batch, &mask)
                .map_err(|e| Error::Fatal(format!("filter batch failed: {e}")))?;
            if kept.num_rows() > 0 {
                return Ok(Some(kept));
            }
        }
        Ok(None)
    }
}

impl Slice for FilterSlice {
    fn name(&self) -> &'static str {
        "filter"
    }
    fn schema(&self) -> SchemaRef {
        self.input.schema()
    }
    fn num_shards(&self) -> usize {
        self.input.num_shards()
    }
    fn num_deps(&self) -> usize {
        1
    }
    fn dep(&self, _i: usize) -> SliceDep {
        SliceDep::pipelined(Arc::clone(&self.input))
    }
    fn reader(&self, _shard: usize, mut inputs: Vec<Box<dyn BatchReader>>) -> Box<dyn BatchReader> {
        Box::new(FilterReader {
            input: inputs.remove(0),
            f: Arc::clone(&self.f),
        })
    }
}

// ---------------------------------------------------------------- flatmap

struct FlatmapSlice {
    input: Arc<dyn Slice>,
    schema: SchemaRef,
    f: FlatmapFn,
}

/// Apply an expanding transform: each input batch yields zero or more
/// output batches.
pub fn flatmap(input: Arc<dyn Slice>, schema: SchemaRef, f: FlatmapFn) -> Arc<dyn Slice> {
    Arc::new(FlatmapSlice { input, schema, f })
}

struct FlatmapReader {
    input: Box<dyn BatchReader>,
    f: FlatmapFn,
    queued: std::collections::VecDeque<RecordBatch>,
}

#[async_trait]
impl BatchReader for FlatmapReader {
    async fn read(&mut self) -> Result<Option<RecordBatch>> {
        loop {
            if let Some(batch) = self.queued.pop_front() {
                if batch.num_rows() > 0 {
                    return Ok(Some(batch));
                }
                continue;
            }
            match self.input.read().await? {
                Some(batch) => self.queued.extend((self.f)(&batch)?),
                None => return Ok(None),
            }
        }
    }
}

impl Slice for FlatmapSlice {
    fn name(&self) -> &'static str {
        "flatmap"
    }
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }
    fn num_shards(&self) -> usize {
        self.input.num_shards()
    }
    fn num_deps(&self) -> usize {
        1
    }
    fn dep(&self, _i: usize) -> SliceDep {
        SliceDep::pipelined(Arc::clone(&self.input))
    }
    fn reader(&self, _shard: usize, mut inputs: Vec<Box<dyn BatchReader>>) -> Box<dyn BatchReader> {
        Box::new(FlatmapReader {
            input: inputs.remove(0),
            f: Arc::clone(&self.f),
            queued: Default::default(),
        })
    }
}

// ---------------------------------------------------------------- reader source

struct SourceSlice {
    nshards: usize,
    schema: SchemaRef,
    f: SourceFn,
}

/// A source slice producing each shard's stream from a constructor.
pub fn read_from(nshards: usize, schema: SchemaRef, f: SourceFn) -> Arc<dyn Slice> {
    Arc::new(SourceSlice { nshards, schema, f })
}

impl Slice for SourceSlice {
    fn name(&self) -> &'static str {
        "reader"
    }
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }
    fn num_shards(&self) -> usize {
        self.nshards
    }
    fn num_deps(&self) -> usize {
        0
    }
    fn dep(&self, _i: usize) -> SliceDep {
        unreachable!("reader source has no dependencies")
    }
    fn reader(&self, shard: usize, _inputs: Vec<Box<dyn BatchReader>>) -> Box<dyn BatchReader> {
        (self.f)(shard)
    }
}

// ---------------------------------------------------------------- writer sink

struct WriterSlice {
    input: Arc<dyn Slice>,
    f: WriteFn,
}

/// A sink slice passing each shard's batches to `f`, with a final
/// `None` call at end of stream. Sinks produce no output columns; the
/// engine drives them for effect. Side-effects must be idempotent:
/// a lost machine replays the shard.
pub fn write_to(input: Arc<dyn Slice>, f: WriteFn) -> Arc<dyn Slice> {
    Arc::new(WriterSlice { input, f })
}

struct WriterReader {
    shard: usize,
    input: Box<dyn BatchReader>,
    f: WriteFn,
    done: bool,
}

#[async_trait]
impl BatchReader for WriterReader {
    async fn read(&mut self) -> Result<Option<RecordBatch>> {
        if self.done {
            return Ok(None);
        }
        while let Some(batch) = self.input.read().await? {
            (self.f)(self.shard, Some(&batch))?;
        }
        (self.f)(self.shard, None)?;
        self.done = true;
        Ok(None)
    }
}

impl Slice for WriterSlice {
    fn name(&self) -> &'static str {
        "writer"
    }
    fn schema(&self) -> SchemaRef {
        empty_schema()
    }
    fn num_shards(&self) -> usize {
        self.input.num_shards()
    }
    fn num_deps(&self) -> usize {
        1
    }
    fn dep(&self, _i: usize) -> SliceDep {
        SliceDep::pipelined(Arc::clone(&self.input))
    }
    fn reader(&self, shard: usize, mut inputs: Vec<Box<dyn BatchReader>>) -> Box<dyn BatchReader> {
        Box::new(WriterReader {
            shard,
            input: inputs.remove(0),
            f: Arc::clone(&self.f),
            done: false,
        })
    }
}

// ---------------------------------------------------------------- scan sink

struct ScanSlice {
    input: Arc<dyn Slice>,
    f: ScanFn,
}

/// A sink slice invoking `f` for every batch of every shard.
pub fn scan(input: Arc<dyn Slice>, f: ScanFn) -> Arc<dyn Slice> {
    Arc::new(ScanSlice { input, f })
}

struct ScanReader {
    shard: usize,
    input: Box<dyn BatchReader>,
    f: ScanFn,
    done: bool,
}

#[async_trait]
impl BatchReader for ScanReader {
    async fn read(&mut self) -> Result<Option<RecordBatch>> {
        if self.done {
            return Ok(None);
        }
        while let Some(batch) = self.input.read().await? {
            (self.f)(self.shard, &batch)?;
        }
        self.done = true;
        Ok(None)
    }
}

impl Slice for ScanSlice {
    fn name(&self) -> &'static str {
        "scan"
    }
    fn schema(&self) -> SchemaRef {
        empty_schema()
    }
    fn num_shards(&self) -> usize {
        self.input.num_shards()
    }
    fn num_deps(&self) -> usize {
        1
    }
    fn dep(&self, _i: usize) -> SliceDep {
        SliceDep::pipelined(Arc::clone(&self.input))
    }
    fn reader(&self, shard: usize, mut inputs: Vec<Box<dyn BatchReader>>) -> Box<dyn BatchReader> {
        Box::new(ScanReader {
            shard,
            input: inputs.remove(0),
            f: Arc::clone(&self.f),
            done: false,
        })
    }
}

// ---------------------------------------------------------------- fold

struct FoldSlice {
    input: Arc<dyn Slice>,
    combiner: Arc<dyn Combiner>,
}

/// Reduce `input` by its leading key column with an associative
/// combiner. The accumulator for a key starts from the first row's
/// value columns; the combiner must be associative so partial
/// accumulators produced during the shuffle merge correctly.
pub fn fold(input: Arc<dyn Slice>, combiner: Arc<dyn Combiner>) -> Result<Arc<dyn Slice>> {
    if input.schema().fields().len() < 2 {
        return Err(Error::InvalidConfig(
            "fold requires a key column and at least one value column".into(),
        ));
    }
    Ok(Arc::new(FoldSlice { input, combiner }))
}

struct FoldReader {
    schema: SchemaRef,
    input: Box<dyn BatchReader>,
    combiner: Arc<dyn Combiner>,
    done: bool,
}

#[async_trait]
impl BatchReader for FoldReader {
    async fn read(&mut self) -> Result<Option<RecordBatch>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        // Final merge of the partition: inputs may be raw rows or
        // partial accumulators spilled by upstream combiners.
        let mut groups: HashMap<Value, Vec<Value>> = HashMap::new();
        while let Some(batch) = self.input.read().await? {
            for row in rows_from_batch(&batch)? {
                let (key, values) = row.split_first().ok_or_else(|| {
                    Error::Fatal("fold row has no columns".to_string())
                })?;
                match groups.get_mut(key) {
                    Some(acc) => self.combiner.combine(acc, values)?,
                    None => {
                        groups.insert(key.clone(), values.to_vec());
                    }
                }
            }
        }
        if groups.is_empty() {
            return Ok(None);
        }
        let rows: Vec<Vec<Value>> = groups
            .into_iter()
            .map(|(key, values)| {
                let mut row = Vec::with_capacity(1 + values.len());
                row.push(key);
                row.extend(values);
                row
            })
            .collect();
        Ok(Some(rows_to_batch(&self.schema, &rows)?))
    }
}

impl Slice for FoldSlice {
    fn name(&self) -> &'static str {
        "fold"
    }
    fn schema(&self) -> SchemaRef {
        self.input.schema()
    }
    fn num_shards(&self) -> usize {
        self.input.num_shards()
    }
    fn num_deps(&self) -> usize {
        1
    }
    fn dep(&self, _i: usize) -> SliceDep {
        SliceDep::shuffled(Arc::clone(&self.input))
    }
    fn combiner(&self) -> Option<Arc<dyn Combiner>> {
        Some(Arc::clone(&self.combiner))
    }
    fn reader(&self, _shard: usize, mut inputs: Vec<Box<dyn BatchReader>>) -> Box<dyn BatchReader> {
        Box::new(FoldReader {
            schema: self.schema(),
            input: inputs.remove(0),
            combiner: Arc::clone(&self.combiner),
            done: false,
        })
    }
}

// ---------------------------------------------------------------- head

struct HeadSlice {
    input: Arc<dyn Slice>,
    n: usize,
}

/// At most the first `n` rows of each shard of `input`.
pub fn head(input: Arc<dyn Slice>, n: usize) -> Arc<dyn Slice> {
    Arc::new(HeadSlice { input, n })
}

struct HeadReader {
    input: Box<dyn BatchReader>,
    remaining: usize,
}

#[async_trait]
impl BatchReader for HeadReader {
    async fn read(&mut self) -> Result<Option<RecordBatch>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        match self.input.read().await? {
            Some(batch) => {
                let take = self.remaining.min(batch.num_rows());
                self.remaining -= take;
                Ok(Some(batch.slice(0, take)))
            }
            None => {
                self.remaining = 0;
                Ok(None)
            }
        }
    }
}

impl Slice for HeadSlice {
    fn name(&self) -> &'static str {
        "head"
    }
    fn schema(&self) -> SchemaRef {
        self.input.schema()
    }
    fn num_shards(&self) -> usize {
        self.input.num_shards()
    }
    fn num_deps(&self) -> usize {
        1
    }
    fn dep(&self, _i: usize) -> SliceDep {
        SliceDep::pipelined(Arc::clone(&self.input))
    }
    fn reader(&self, _shard: usize, mut inputs: Vec<Box<dyn BatchReader>>) -> Box<dyn BatchReader> {
        Box::new(HeadReader {
            input: inputs.remove(0),
            remaining: self.n,
        })
    }
}

// ---------------------------------------------------------------- pragma wrapper

struct PragmaSlice {
    input: Arc<dyn Slice>,
    pragma: Pragma,
}

/// Attach execution hints to a slice without changing its semantics.
pub fn with_pragma(input: Arc<dyn Slice>, pragma: Pragma) -> Arc<dyn Slice> {
    Arc::new(PragmaSlice { input, pragma })
}

impl Slice for PragmaSlice {
    fn name(&self) -> &'static str {
        self.input.name()
    }
    fn schema(&self) -> SchemaRef {
        self.input.schema()
    }
    fn num_shards(&self) -> usize {
        self.input.num_shards()
    }
    fn num_deps(&self) -> usize {
        self.input.num_deps()
    }
    fn dep(&self, i: usize) -> SliceDep {
        self.input.dep(i)
    }
    fn combiner(&self) -> Option<Arc<dyn Combiner>> {
        self.input.combiner()
    }
    fn pragma(&self) -> Pragma {
        self.pragma
    }
    fn reader(&self, shard: usize, inputs: Vec<Box<dyn BatchReader>>) -> Box<dyn BatchReader> {
        self.input.reader(shard, inputs)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Array, Int64Array, StringArray};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use furrow_frame::read_all;

    use super::*;

    fn int_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
    }

    fn int_batch(values: Vec<i64>) -> RecordBatch {
        RecordBatch::try_new(int_schema(), vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    async fn shard_rows(slice: &Arc<dyn Slice>, shard: usize) -> Vec<i64> {
        let mut inputs = Vec::new();
        for d in 0..slice.num_deps() {
            let dep = slice.dep(d);
            assert!(!dep.shuffle, "test helper only pipelines");
            assert_eq!(dep.slice.num_deps(), 0, "test helper expects single-level pipelines");
            inputs.push(dep.slice.reader(shard, Vec::new()));
        }
        let mut reader = slice.reader(shard, inputs);
        let batches = read_all(reader.as_mut()).await.unwrap();
        batches
            .iter()
            .flat_map(|b| {
                b.column(0)
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .unwrap()
                    .values()
                    .to_vec()
            })
            .collect()
    }

    #[tokio::test]
    async fn const_splits_rows_across_shards() {
        let slice = constant(3, vec![int_batch((0..10).collect())]).unwrap();
        let mut all = Vec::new();
        let mut sizes = Vec::new();
        for shard in 0..3 {
            let rows = shard_rows(&slice, shard).await;
            sizes.push(rows.len());
            all.extend(rows);
        }
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
        assert_eq!(sizes, vec![4, 3, 3]);
    }

    #[tokio::test]
    async fn map_transforms_batches() {
        let slice = constant(1, vec![int_batch(vec![1, 2, 3])]).unwrap();
        let doubled = map(
            slice,
            int_schema(),
            Arc::new(|batch: &RecordBatch| {
                let v = batch
                    .column(0)
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .unwrap();
                let out: Int64Array = v.iter().map(|x| x.map(|x| x * 2)).collect();
                RecordBatch::try_new(batch.schema(), vec![Arc::new(out)])
                    .map_err(|e| furrow_common::Error::Fatal(e.to_string()))
            }),
        );
        assert_eq!(shard_rows(&doubled, 0).await, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn head_limits_each_shard() {
        let slice = constant(2, vec![int_batch((0..10).collect())]).unwrap();
        let limited = head(slice, 2);
        assert_eq!(shard_rows(&limited, 0).await.len(), 2);
        assert_eq!(shard_rows(&limited, 1).await.len(), 2);
    }

    #[tokio::test]
    async fn flatmap_splits_strings() {
        let schema = Arc::new(Schema::new(vec![Field::new("s", DataType::Utf8, false)]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![Arc::new(StringArray::from(vec!["x,x", "y,y,y", "z", "", "x"]))],
        )
        .unwrap();
        let slice = constant(2, vec![batch]).unwrap();
        let out_schema = Arc::clone(&schema);
        let expanded = flatmap(
            slice,
            Arc::clone(&schema),
            Arc::new(move |batch: &RecordBatch| {
                let s = batch
                    .column(0)
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .unwrap();
                let mut parts = Vec::new();
                for i in 0..s.len() {
                    for piece in s.value(i).split(',') {
                        if !piece.is_empty() {
                            parts.push(piece.to_string());
                        }
                    }
                }
                let out = RecordBatch::try_new(
                    Arc::clone(&out_schema),
                    vec![Arc::new(StringArray::from(parts))],
                )
                .map_err(|e| furrow_common::Error::Fatal(e.to_string()))?;
                Ok(vec![out])
            }),
        );
        let mut all: Vec<String> = Vec::new();
        for shard in 0..2 {
            let mut inputs = Vec::new();
            let dep = expanded.dep(0);
            inputs.push(dep.slice.reader(shard, Vec::new()));
            let mut reader = expanded.reader(shard, inputs);
            for batch in read_all(reader.as_mut()).await.unwrap() {
                let s = batch
                    .column(0)
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .unwrap();
                all.extend((0..s.len()).map(|i| s.value(i).to_string()));
            }
        }
        all.sort();
        assert_eq!(all, vec!["x", "x", "x", "y", "y", "y", "z"]);
    }
}
