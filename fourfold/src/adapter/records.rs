//! Adapter for flat-file range scans.
//!
//! Flat files have no engine to pre-aggregate, so every record becomes one
//! [`Role::Raw`] tuple per projected measure, bucketed through the query grid.
//! The scan is read lazily; nothing is buffered beyond the current record.

use std::collections::VecDeque;

use super::{AdapterContext, MeasureId, OrderingGuard, RawTuple, Role};
use crate::access::{RangeScan, RawRecord};
use crate::error::{AccessError, Result};

/// Turns a [`RangeScan`] into raw tuples.
#[derive(Debug)]
pub struct RecordTuples<'a> {
    scan: RangeScan<'a>,
    measures: Vec<MeasureId>,
    context: AdapterContext,
    guard: OrderingGuard,
    pending: VecDeque<RawTuple>,
    records_read: u64,
    done: bool,
}

impl<'a> RecordTuples<'a> {
    /// Wraps a scan. Fields after the time field map to the scan's measures.
    pub fn new(scan: RangeScan<'a>, context: AdapterContext) -> Self {
        let measures = scan.measures().to_vec();
        let guard = context.guard();
        Self {
            scan,
            measures,
            context,
            guard,
            pending: VecDeque::new(),
            records_read: 0,
            done: false,
        }
    }

    /// Number of records consumed from the scan.
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    fn expand(&mut self, record: &RawRecord) -> Result<()> {
        let bucket_key = self.context.bucket_of(record.timestamp)?;

        for (measure, text) in self.measures.iter().zip(record.fields.iter().skip(1)) {
            let value = parse_value(text).map_err(|reason| AccessError::CorruptRecord {
                path: self.scan.label().to_string(),
                offset: record.offset,
                reason,
            })?;
            let Some(value) = value else {
                continue;
            };
            self.pending.push_back(RawTuple {
                union_group: 0,
                bucket_key,
                measure: *measure,
                role: Role::Raw,
                timestamp: Some(record.timestamp),
                value: Some(value),
            });
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<Option<RawTuple>> {
        loop {
            if let Some(tuple) = self.pending.pop_front() {
                self.guard.check(&tuple)?;
                return Ok(Some(tuple));
            }
            let Some(record) = self.scan.next().transpose()? else {
                return Ok(None);
            };
            self.records_read += 1;
            self.expand(&record)?;
        }
    }
}

impl Iterator for RecordTuples<'_> {
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

/// Parses a measure field. Empty, `null` and `NaN` fields are missing values.
fn parse_value(text: &str) -> std::result::Result<Option<f64>, String> {
    let text = text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("null") || text.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    text.parse::<f64>()
        .map(Some)
        .map_err(|e| format!("measure value '{text}': {e}"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::access::{FileSource, TimeIndexed};
    use crate::adapter::MeasureMap;
    use crate::config::DatasetConfig;
    use crate::error::FourfoldError;
    use crate::range::{BucketGrid, TimeRange};

    fn source(dir: &tempfile::TempDir, body: &str) -> FileSource {
        let path = dir.path().join("data.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        FileSource::open(&DatasetConfig::new(path, vec!["a".into(), "b".into()])).unwrap()
    }

    fn context(from: i64, to: i64, buckets: u32) -> AdapterContext {
        AdapterContext::new(
            BucketGrid::new(TimeRange::new(from, to).unwrap(), buckets).unwrap(),
            MeasureMap::new(["a", "b"]).unwrap(),
        )
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value(" 1.5 ").unwrap(), Some(1.5));
        assert_eq!(parse_value("").unwrap(), None);
        assert_eq!(parse_value("NULL").unwrap(), None);
        assert_eq!(parse_value("NaN").unwrap(), None);
        assert!(parse_value("abc").is_err());
    }

    #[test]
    fn test_records_become_raw_tuples() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source(&dir, "time,a,b\n0,1,10\n50,,20\n100,3,30\n");

        let scan = source
            .scan(TimeRange::new(0, 200).unwrap(), &[MeasureId(1), MeasureId(0)])
            .unwrap();
        let mut tuples = RecordTuples::new(scan, context(0, 200, 2));
        let collected: Vec<RawTuple> = tuples.by_ref().collect::<Result<_>>().unwrap();

        assert_eq!(tuples.records_read(), 3);
        assert_eq!(collected.len(), 5);
        assert_eq!(collected[0].measure, MeasureId(1));
        assert_eq!(collected[0].value, Some(10.0));
        assert_eq!(collected[1].measure, MeasureId(0));
        assert!(collected.iter().all(|t| t.role == Role::Raw && t.union_group == 0));
        assert_eq!(collected[2].timestamp, Some(50));
        assert_eq!(collected[4].bucket_key, 1);
    }

    #[test]
    fn test_unparsable_value_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source(&dir, "time,a,b\n0,1,10\n50,oops,20\n100,3,30\n");

        let scan = source.scan(TimeRange::new(0, 200).unwrap(), &[MeasureId(0)]).unwrap();
        let results: Vec<Result<RawTuple>> = RecordTuples::new(scan, context(0, 200, 2)).collect();

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(FourfoldError::Access(AccessError::CorruptRecord { offset: 16, .. }))
        ));
    }
}
