use crate::config::IncidentFieldConfig;
use crate::types::{IncidentPoint, UNKNOWN_CATEGORY};
use anyhow::{anyhow, Context, Result};
use csv::ReaderBuilder;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

/// Turns loosely typed assistant records into incident points.
///
/// Nothing here fails on a bad record: missing or malformed fields fall back
/// to defaults, and unusable coordinates are left as `None` so aggregation
/// can skip the point.
#[derive(Debug, Clone, Default)]
pub struct IncidentReader {
    fields: IncidentFieldConfig,
}

impl IncidentReader {
    pub fn new(fields: IncidentFieldConfig) -> Self {
        Self { fields }
    }

    /// Accepts a bare array of records, the assistant envelope
    /// `{"response": .., "highlight_data": [..]}`, or a single record.
    pub fn parse_json(&self, value: &Value) -> Vec<IncidentPoint> {
        match value {
            Value::Array(records) => self.parse_records(records),
            Value::Object(object) => match object.get("highlight_data") {
                Some(Value::Array(records)) => self.parse_records(records),
                Some(_) => Vec::new(),
                None => vec![self.parse_record(object)],
            },
            _ => Vec::new(),
        }
    }

    pub fn parse_records(&self, records: &[Value]) -> Vec<IncidentPoint> {
        records
            .iter()
            .filter_map(|record| match record {
                Value::Object(object) => Some(self.parse_record(object)),
                other => {
                    debug!(record = %other, "skipping non-object incident record");
                    None
                }
            })
            .collect()
    }

    pub fn parse_record(&self, record: &Map<String, Value>) -> IncidentPoint {
        let lat = self
            .lookup(record, &self.fields.latitude)
            .and_then(|v| coordinate(v, 90.0));
        let lon = self
            .lookup(record, &self.fields.longitude)
            .and_then(|v| coordinate(v, 180.0));

        let count = self
            .lookup(record, &self.fields.count)
            .and_then(positive_count)
            .unwrap_or(1);

        let category = self
            .lookup(record, &self.fields.category)
            .and_then(text)
            .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string());

        let label = self.lookup(record, &self.fields.label).and_then(text);

        if lat.is_none() || lon.is_none() {
            debug!(?label, "incident record has no usable location");
        }

        IncidentPoint {
            lat,
            lon,
            count,
            category,
            label,
            properties: record.clone(),
        }
    }

    pub fn read_file(&self, path: &Path) -> Result<Vec<IncidentPoint>> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_lowercase())
            .ok_or_else(|| anyhow!("Incident file has no extension"))?;

        let file = File::open(path)
            .with_context(|| format!("Failed to open incident file: {:?}", path))?;

        match extension.as_str() {
            "json" => {
                let value: Value = serde_json::from_reader(BufReader::new(file))
                    .with_context(|| format!("Failed to parse incident JSON: {:?}", path))?;
                Ok(self.parse_json(&value))
            }
            "csv" => self.read_csv(file),
            _ => Err(anyhow!("Unsupported incident format: {}", extension)),
        }
    }

    /// Every CSV cell arrives as a string; empty cells count as absent.
    pub fn read_csv<R: Read>(&self, reader: R) -> Result<Vec<IncidentPoint>> {
        let mut rdr = ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = rdr.headers()?.clone();

        let mut points = Vec::new();
        for result in rdr.records() {
            let record = result?;
            let object: Map<String, Value> = headers
                .iter()
                .zip(record.iter())
                .filter(|(_, cell)| !cell.trim().is_empty())
                .map(|(h, cell)| (h.to_string(), Value::String(cell.to_string())))
                .collect();
            points.push(self.parse_record(&object));
        }

        Ok(points)
    }

    fn lookup<'a>(&self, record: &'a Map<String, Value>, aliases: &[String]) -> Option<&'a Value> {
        aliases
            .iter()
            .filter_map(|key| record.get(key))
            .find(|v| !v.is_null())
    }
}

fn number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn coordinate(value: &Value, limit: f64) -> Option<f64> {
    number(value).filter(|v| v.abs() <= limit)
}

/// Largest count a single record may carry; anything above is malformed.
const MAX_RECORD_COUNT: f64 = u32::MAX as f64;

fn positive_count(value: &Value) -> Option<u64> {
    number(value)
        .filter(|v| (1.0..=MAX_RECORD_COUNT).contains(v) && v.fract() == 0.0)
        .map(|v| v as u64)
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
