//! `gtid_executed` interval bookkeeping: parses a text
//! GTID (`source_uuid:start-end`) into a [`GtidInterval`] row, and merges
//! adjacent/overlapping intervals for the same source UUID the way
//! periodic and explicit compression do on the real table.

use anyhow::{anyhow, Result};
use ck_api_types::GtidInterval;

/// Parses one GTID descriptor's text payload (`"<uuid>:<start>-<end>"`,
/// e.g. `"3E11FA47-71CA-11E1-9E33-C80AA9429562:1-5"`) into the row it would
/// occupy in `mysql.gtid_executed`. A descriptor holding a single
/// transaction number (`"<uuid>:<n>"`) is treated as the one-element
/// interval `[n, n]`.
pub fn parse_text_gtid(info: &[u8]) -> Result<GtidInterval> {
    let text = std::str::from_utf8(info).map_err(|e| anyhow!("gtid info not utf8: {}", e))?;
    let (uuid, range) = text
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("gtid {:?} missing ':' separator", text))?;
    if uuid.is_empty() {
        return Err(anyhow!("gtid {:?} has an empty source uuid", text));
    }
    let (start, end) = match range.split_once('-') {
        Some((s, e)) => (
            s.parse::<u64>()
                .map_err(|e| anyhow!("gtid {:?}: bad interval start: {}", text, e))?,
            e.parse::<u64>()
                .map_err(|e| anyhow!("gtid {:?}: bad interval end: {}", text, e))?,
        ),
        None => {
            let n = range
                .parse::<u64>()
                .map_err(|e| anyhow!("gtid {:?}: bad transaction number: {}", text, e))?;
            (n, n)
        }
    };
    if end < start {
        return Err(anyhow!(
            "gtid {:?}: interval end {} precedes start {}",
            text,
            end,
            start
        ));
    }
    Ok(GtidInterval {
        source_uuid: uuid.to_string(),
        interval_start: start,
        interval_end: end,
    })
}

/// Merges overlapping or adjacent intervals that share a `source_uuid`,
/// the way background compression collapses `gtid_executed`
/// (the GTID dedup law). Input order is not significant; output
/// is sorted by `(source_uuid, interval_start)`.
pub fn merge_intervals(mut intervals: Vec<GtidInterval>) -> Vec<GtidInterval> {
    intervals.sort_by(|a, b| {
        a.source_uuid
            .cmp(&b.source_uuid)
            .then(a.interval_start.cmp(&b.interval_start))
    });

    let mut merged: Vec<GtidInterval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            Some(last)
                if last.source_uuid == interval.source_uuid
                    && interval.interval_start <= last.interval_end.saturating_add(1) =>
            {
                last.interval_end = last.interval_end.max(interval.interval_end);
            }
            _ => merged.push(interval),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_range_gtid() {
        let parsed = parse_text_gtid(b"uuid-a:1-5").unwrap();
        assert_eq!(parsed.source_uuid, "uuid-a");
        assert_eq!(parsed.interval_start, 1);
        assert_eq!(parsed.interval_end, 5);
    }

    #[test]
    fn parses_a_single_transaction_gtid() {
        let parsed = parse_text_gtid(b"uuid-a:7").unwrap();
        assert_eq!(parsed.interval_start, 7);
        assert_eq!(parsed.interval_end, 7);
    }

    #[test]
    fn rejects_missing_separator() {
        assert!(parse_text_gtid(b"not-a-gtid").is_err());
    }

    #[test]
    fn merge_joins_adjacent_intervals_of_the_same_uuid() {
        let merged = merge_intervals(vec![
            GtidInterval {
                source_uuid: "a".into(),
                interval_start: 1,
                interval_end: 5,
            },
            GtidInterval {
                source_uuid: "a".into(),
                interval_start: 6,
                interval_end: 9,
            },
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].interval_start, 1);
        assert_eq!(merged[0].interval_end, 9);
    }

    #[test]
    fn merge_keeps_distinct_uuids_and_non_adjacent_gaps_separate() {
        let merged = merge_intervals(vec![
            GtidInterval {
                source_uuid: "a".into(),
                interval_start: 1,
                interval_end: 5,
            },
            GtidInterval {
                source_uuid: "a".into(),
                interval_start: 20,
                interval_end: 25,
            },
            GtidInterval {
                source_uuid: "b".into(),
                interval_start: 1,
                interval_end: 5,
            },
        ]);
        assert_eq!(merged.len(), 3);
    }
}
