//! Port statistics output.
//!
//! One formatter, three shapes of the same record: `plain` redraws a single
//! screen line in place, `csv` prints a header once and then one row per
//! update, `json` emits one object per line for log scrapers.

use std::io::Write;
use std::str::FromStr;

use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsFormat {
    Plain,
    Csv,
    Json,
}

impl FromStr for StatsFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(StatsFormat::Plain),
            "csv" => Ok(StatsFormat::Csv),
            "json" => Ok(StatsFormat::Json),
            other => Err(format!("unknown stats format '{other}' (expected plain, csv or json)")),
        }
    }
}

/// One update of the displayed clock state. The measurement fields are only
/// present while the servo is actually tracking a master.
#[derive(Debug, Default, Serialize)]
pub struct StatsRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Which discipline this row describes ("" = the PTP port, "sys " = the
    /// system clock follower in `both` mode).
    #[serde(skip_serializing_if = "str::is_empty")]
    pub clock: &'static str,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_way_delay: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset_from_master: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variance: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adj_ppb: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slave_to_master_delay: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_to_slave_delay: Option<String>,
}

const SCREEN_MAX: usize = 80;

pub struct StatsWriter {
    format: StatsFormat,
    header_written: bool,
}

impl StatsWriter {
    pub fn new(format: StatsFormat) -> Self {
        StatsWriter { format, header_written: false }
    }

    pub fn report(&mut self, record: &StatsRecord) {
        match self.format {
            StatsFormat::Plain => {
                let line = self.plain_line(record);
                // overwrite the same line over and over again
                print!("{:.max$}\r", line, max = SCREEN_MAX);
                std::io::stdout().flush().ok();
            }
            StatsFormat::Csv => {
                if !self.header_written {
                    self.header_written = true;
                    println!(
                        "timestamp, clock, state, one way delay, offset from master, drift, \
                         variance, clock adjustment (ppb), slave to master delay, \
                         master to slave delay"
                    );
                }
                println!(
                    "{}, {}, {}, {}, {}, {}, {}, {}, {}, {}",
                    record.timestamp.as_deref().unwrap_or(""),
                    record.clock.trim(),
                    record.state,
                    record.one_way_delay.as_deref().unwrap_or(""),
                    record.offset_from_master.as_deref().unwrap_or(""),
                    opt_num(record.drift),
                    opt_num(record.variance),
                    opt_num(record.adj_ppb),
                    record.slave_to_master_delay.as_deref().unwrap_or(""),
                    record.master_to_slave_delay.as_deref().unwrap_or(""),
                );
            }
            StatsFormat::Json => match serde_json::to_string(record) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::error!("failed to serialize stats record: {e}"),
            },
        }
    }

    fn plain_line(&self, record: &StatsRecord) -> String {
        let mut line = format!("state: {}{}", record.clock, record.state);
        if let Some(owd) = &record.one_way_delay {
            line.push_str(&format!(", owd: {owd}"));
        }
        if let Some(ofm) = &record.offset_from_master {
            line.push_str(&format!(", ofm: {ofm}"));
        }
        if let Some(drift) = record.drift {
            line.push_str(&format!(", drift: {drift}"));
        }
        if let Some(var) = record.variance {
            line.push_str(&format!(", var: {var}"));
        }
        if let Some(adj) = record.adj_ppb {
            line.push_str(&format!(", adj: {adj}"));
        }
        line
    }
}

/// Timestamp string for csv/json rows.
pub fn now_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn opt_num<T: std::fmt::Display>(v: Option<T>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse() {
        assert_eq!("csv".parse::<StatsFormat>().unwrap(), StatsFormat::Csv);
        assert!("xml".parse::<StatsFormat>().is_err());
    }

    #[test]
    fn test_json_record_shape() {
        let record = StatsRecord {
            state: "slv",
            one_way_delay: Some("0.000104000".into()),
            offset_from_master: Some("-0.000000500".into()),
            drift: Some(-104),
            variance: Some(0),
            adj_ppb: Some(10_504),
            ..StatsRecord::default()
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"state\":\"slv\""));
        assert!(json.contains("\"drift\":-104"));
        // idle fields and the empty clock tag stay out of the record
        assert!(!json.contains("timestamp"));
        assert!(!json.contains("\"clock\""));
    }

    #[test]
    fn test_plain_line_truncation_safe() {
        let w = StatsWriter::new(StatsFormat::Plain);
        let record = StatsRecord { state: "lstn", ..StatsRecord::default() };
        assert_eq!(w.plain_line(&record), "state: lstn");
    }
}
