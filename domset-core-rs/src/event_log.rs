//! Per-node CSV event log
//!
//! One `;`-separated row per event, `TAG;timestamp;values...`. Row length
//! depends on the tag.

use crate::controller::Thresholds;
use crate::error::Result;
use crate::types::IR_CHANNELS;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const TAG_ZERO_TIME: &str = "ZT";
pub const TAG_CURRENT_TEMP: &str = "CT";
pub const TAG_AIRFLOW: &str = "CAF";
pub const TAG_SELF_ACTIVITY: &str = "CAC";
pub const TAG_GROUP_ACTIVITY: &str = "NAC";
pub const TAG_ACTIVE_SENSORS: &str = "CAS";
pub const TAG_NEW_TEMP: &str = "NT";
pub const TAG_IR_THRESHOLDS: &str = "IRT";
pub const TAG_TH_HEAT: &str = "TH_HEAT";
pub const TAG_TH_COOL: &str = "TH_COOL";
pub const TAG_TH_MIN: &str = "TH_MIN";

/// Event log writer
pub struct EventLog<W: Write = Box<dyn Write + Send>> {
    writer: csv::Writer<W>,
    path: Option<PathBuf>,
    rows: u64,
}

impl<W: Write> std::fmt::Debug for EventLog<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("path", &self.path)
            .field("rows", &self.rows)
            .finish()
    }
}

impl EventLog {
    /// Open `<dir>/<YYYY-MM-DD-HH-MM-SS>-<node>-domset.csv`
    pub fn create(dir: impl AsRef<Path>, node_name: &str) -> Result<Self> {
        let stamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S");
        let path = dir.as_ref().join(format!("{}-{}-domset.csv", stamp, node_name));
        let file = File::create(&path)?;
        let writer: Box<dyn Write + Send> = Box::new(BufWriter::new(file));
        let mut log = Self::new(writer);
        log.path = Some(path);
        Ok(log)
    }

    /// Discard every row
    pub fn sink() -> Self {
        let writer: Box<dyn Write + Send> = Box::new(io::sink());
        Self::new(writer)
    }
}

impl<W: Write> EventLog<W> {
    pub fn new(writer: W) -> Self {
        let writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .flexible(true)
            .has_headers(false)
            .from_writer(writer);
        Self {
            writer,
            path: None,
            rows: 0,
        }
    }

    /// File backing this log, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    fn row(&mut self, tag: &str, t: f64, values: &[String]) -> Result<()> {
        let mut record = Vec::with_capacity(values.len() + 2);
        record.push(tag.to_string());
        record.push(t.to_string());
        record.extend_from_slice(values);
        self.writer.write_record(&record)?;
        self.rows += 1;
        Ok(())
    }

    /// Run start
    pub fn zero_time(&mut self, t: f64) -> Result<()> {
        self.row(TAG_ZERO_TIME, t, &[])
    }

    /// Setpoint applied to the actuator
    pub fn current_temp(&mut self, t: f64, temp: f64) -> Result<()> {
        self.row(TAG_CURRENT_TEMP, t, &[temp.to_string()])
    }

    pub fn airflow(&mut self, t: f64, on: bool) -> Result<()> {
        self.row(TAG_AIRFLOW, t, &[if on { "1" } else { "0" }.to_string()])
    }

    pub fn self_activity(&mut self, t: f64, average: f64) -> Result<()> {
        self.row(TAG_SELF_ACTIVITY, t, &[average.to_string()])
    }

    pub fn group_activity(&mut self, t: f64, average: f64) -> Result<()> {
        self.row(TAG_GROUP_ACTIVITY, t, &[average.to_string()])
    }

    pub fn active_sensors(&mut self, t: f64, flags: &[bool; IR_CHANNELS]) -> Result<()> {
        let values: Vec<String> = flags
            .iter()
            .map(|&on| if on { "True" } else { "False" }.to_string())
            .collect();
        self.row(TAG_ACTIVE_SENSORS, t, &values)
    }

    /// Setpoint computed by the master
    pub fn new_temp(&mut self, t: f64, temp: f64) -> Result<()> {
        self.row(TAG_NEW_TEMP, t, &[temp.to_string()])
    }

    pub fn ir_thresholds(&mut self, t: f64, thresholds: &[u32; IR_CHANNELS]) -> Result<()> {
        let values: Vec<String> = thresholds.iter().map(|v| v.to_string()).collect();
        self.row(TAG_IR_THRESHOLDS, t, &values)
    }

    /// One row per threshold
    pub fn thresholds(&mut self, t: f64, thresholds: &Thresholds) -> Result<()> {
        self.row(TAG_TH_HEAT, t, &[thresholds.heat.to_string()])?;
        self.row(TAG_TH_COOL, t, &[thresholds.cool.to_string()])?;
        self.row(TAG_TH_MIN, t, &[thresholds.blow.to_string()])
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and hand back the underlying writer
    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| io::Error::new(e.error().kind(), e.error().to_string()).into())
    }
}
