use std::borrow::Cow;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use presage_engine::PredictionResult;

use crate::error::Result;

/// Write one machine's predictions as `{name}.csv.gz` under `dir`.
pub fn write_prediction_csv(dir: &Path, name: &str, result: &PredictionResult) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{name}.csv.gz"));
    let file = File::create(&path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(render_csv(result).as_bytes())?;
    encoder.finish()?;
    Ok(path)
}

/// Write a model artifact as `model.bin` under `dir`, creating it first.
pub fn write_model(dir: &Path, artifact: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join("model.bin");
    fs::write(&path, artifact)?;
    Ok(path)
}

/// Render a prediction frame as CSV with a leading timestamp column.
fn render_csv(result: &PredictionResult) -> String {
    let frame = &result.frame;
    let mut output = String::new();

    output.push_str("timestamp");
    for column in frame.columns() {
        output.push(',');
        output.push_str(&escape_csv(column));
    }
    output.push('\n');

    for row in frame.rows() {
        output.push_str(&row.timestamp.to_rfc3339());
        for value in &row.values {
            output.push(',');
            output.push_str(&value.to_string());
        }
        output.push('\n');
    }
    output
}

// Quotes a field only when the separator rules require it
fn escape_csv(s: &str) -> Cow<'_, str> {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        Cow::Owned(format!("\"{}\"", s.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use flate2::read::GzDecoder;
    use presage_engine::{FrameRow, PredictionFrame};
    use std::io::Read;

    fn sample_result() -> PredictionResult {
        let frame = PredictionFrame::with_rows(
            vec!["model-output".to_string(), "anomaly,score".to_string()],
            vec![
                FrameRow {
                    timestamp: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
                    values: vec![1.0, 2.5],
                },
                FrameRow {
                    timestamp: Utc.with_ymd_and_hms(2020, 1, 1, 1, 0, 0).unwrap(),
                    values: vec![-3.0, 0.125],
                },
            ],
        )
        .unwrap();
        PredictionResult {
            frame,
            resampled: None,
            errors: Vec::new(),
        }
    }

    #[test]
    fn prediction_csv_round_trips_through_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_prediction_csv(dir.path(), "pump-01", &sample_result()).unwrap();
        assert_eq!(path.file_name().unwrap(), "pump-01.csv.gz");

        let mut decoded = String::new();
        GzDecoder::new(File::open(&path).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();

        let mut lines = decoded.lines();
        assert_eq!(
            lines.next(),
            Some("timestamp,model-output,\"anomaly,score\"")
        );
        assert_eq!(lines.next(), Some("2020-01-01T00:00:00+00:00,1,2.5"));
        assert_eq!(lines.next(), Some("2020-01-01T01:00:00+00:00,-3,0.125"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn fields_with_separators_are_quoted() {
        assert_eq!(escape_csv("plain"), "plain");
        assert_eq!(escape_csv("a,b"), "\"a,b\"");
        assert_eq!(escape_csv("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn model_artifacts_land_in_their_machine_directory() {
        let dir = tempfile::tempdir().unwrap();
        let machine_dir = dir.path().join("pump-01");
        let path = write_model(&machine_dir, b"\x80artifact").unwrap();
        assert_eq!(path, machine_dir.join("model.bin"));
        assert_eq!(fs::read(&path).unwrap(), b"\x80artifact");
    }
}
