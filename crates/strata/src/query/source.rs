//! Pull-based query source over one bucket.

use crate::downsample::cascade::aggregate_window;
use crate::downsample::functions::{FunctionState, SlotMask};
use crate::error::Result;
use crate::query::scan::WindowedScan;
use crate::query::{ColumnRequest, QueryBuffer};
use crate::series::Column;
use crate::storage::bucket::BucketSnapshot;

#[derive(Debug, Clone)]
struct OutputColumn {
    column: Column,
    mask: SlotMask,
    divisor: f64,
}

/// Iterator of result chunks read from a single bucket.
///
/// Each chunk holds the windows completed by one decoded block; the last
/// chunk also carries the buffered RAM points.
#[derive(Debug)]
pub struct BucketQuerySource {
    scan: WindowedScan,
    outputs: Vec<OutputColumn>,
    states: Vec<FunctionState>,
    from_primary: bool,
    done: bool,
}

impl BucketQuerySource {
    /// Creates a source for `[start, end]` in windows of `step`.
    ///
    /// `states` holds one function state per request, so that running
    /// functions continue across chained sources.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        snapshot: BucketSnapshot,
        columns: &[Column],
        requests: &[ColumnRequest],
        states: Vec<FunctionState>,
        start: i64,
        end: i64,
        step: i64,
        from_primary: bool,
    ) -> Result<Self> {
        let mut need = vec![false; snapshot.transforms.len()];
        let mut outputs = Vec::with_capacity(requests.len());
        for request in requests {
            let column = columns[request.column].clone();
            let mask = request.function.slot_mask();
            for (slot, &needed) in mask.iter().enumerate() {
                if !needed {
                    continue;
                }
                let index = if from_primary {
                    column.primary_index
                } else {
                    column.aggregate_index[slot]
                };
                if let Some(n) = need.get_mut(index) {
                    *n = true;
                }
            }
            let divisor = if request.function.is_scaled() {
                10f64.powi(column.scale)
            } else {
                1.0
            };
            outputs.push(OutputColumn {
                column,
                mask,
                divisor,
            });
        }
        let scan = WindowedScan::new(snapshot, start, end, step, &need)?;
        Ok(Self {
            scan,
            outputs,
            states,
            from_primary,
            done: false,
        })
    }

    /// Hands the function states over to the next source of a chain.
    pub fn into_states(self) -> Vec<FunctionState> {
        self.states
    }

    /// Returns the next non-empty chunk, or `None` at end of data.
    pub fn next_chunk(&mut self) -> Result<Option<QueryBuffer>> {
        let step = self.scan.step();
        while !self.done {
            let mut chunk = QueryBuffer::new(self.outputs.len());
            let more = self.scan.advance(|window| {
                chunk.times.push(window.time);
                for (i, output) in self.outputs.iter().enumerate() {
                    let aggs =
                        aggregate_window(&output.column, &window, self.from_primary, &output.mask);
                    let value = self.states[i].apply(&aggs, step);
                    chunk.values[i].push(value / output.divisor);
                }
                Ok(())
            })?;
            if !more {
                self.done = true;
            }
            if !chunk.is_empty() {
                return Ok(Some(chunk));
            }
        }
        Ok(None)
    }
}

impl Iterator for BucketQuerySource {
    type Item = Result<QueryBuffer>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
