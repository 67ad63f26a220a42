//! Request and response codec for the prediction endpoint.
//!
//! Encoding produces the relative path, query parameters and JSON body for
//! one (machine, window) request. Decoding classifies a raw HTTP response
//! into a typed [`Outcome`]: every malformed or failed response becomes a
//! `Failure` with an explicit retryable flag, never a panic.
//!
//! Two response bodies are understood: `application/json` and the columnar
//! binary framing (`application/x-columnar`, magic `PSGF`).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::DateTime;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::ResponseFormat;
use crate::dispatch::Outcome;
use crate::error::ClientError;
use crate::frame::{FrameRow, PredictionFrame};
use crate::plan::TimeWindow;
use crate::schemas::Machine;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_COLUMNAR: &str = "application/x-columnar";

const COLUMNAR_MAGIC: &[u8; 4] = b"PSGF";
const COLUMNAR_VERSION: u8 = 1;
const FLAG_RESAMPLED: u8 = 0b0000_0001;

/// Run-wide options baked into every encoded request.
#[derive(Debug, Clone)]
pub struct CodecOptions {
    pub format: ResponseFormat,
    /// Revision resolved once per run; identical across all windows.
    pub revision: String,
    pub all_columns: bool,
    pub data_provider: Option<Value>,
}

/// One outbound prediction request, relative to the project base URL.
#[derive(Debug, Clone)]
pub struct PredictionRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Value,
}

/// Build the request for one (machine, window) pair.
pub fn encode_request(
    machine: &Machine,
    window: &TimeWindow,
    options: &CodecOptions,
) -> PredictionRequest {
    let mut query = vec![
        ("format".to_string(), options.format.as_str().to_string()),
        ("revision".to_string(), options.revision.clone()),
    ];
    if options.all_columns {
        query.push(("all_columns".to_string(), "true".to_string()));
    }

    let mut body = json!({
        "start": window.start.to_rfc3339(),
        "end": window.end.to_rfc3339(),
    });
    if let Some(provider) = &options.data_provider {
        body["data_provider"] = provider.clone();
    }

    PredictionRequest {
        path: format!("{}/anomaly/prediction", machine.name),
        query,
        body,
    }
}

#[derive(Deserialize)]
struct PredictionPayload {
    data: PredictionFrame,
    #[serde(default)]
    resampled: Option<PredictionFrame>,
}

/// Classify a raw prediction response into an [`Outcome`].
///
/// 410 marks the run's revision as no longer served; that is terminal for
/// the window, retrying the same revision cannot help. 408/429/5xx are
/// transient. A 2xx with an unexpected content type or an unparsable body is
/// a protocol failure.
pub fn decode_response(status: StatusCode, content_type: Option<&str>, body: &[u8]) -> Outcome {
    if status == StatusCode::GONE {
        return Outcome::Failure {
            message: "revision no longer served (HTTP 410)".to_string(),
            retryable: false,
        };
    }

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        return Outcome::Failure {
            message: format!("transient server failure (HTTP {status})"),
            retryable: true,
        };
    }

    if !status.is_success() {
        return Outcome::Failure {
            message: format!("request rejected (HTTP {status})"),
            retryable: false,
        };
    }

    let decoded = match content_type {
        Some(ct) if ct.starts_with(CONTENT_TYPE_JSON) => decode_json(body),
        Some(ct) if ct.starts_with(CONTENT_TYPE_COLUMNAR) => decode_columnar(body),
        other => Err(ClientError::protocol(format!(
            "unexpected content type {:?}",
            other.unwrap_or("<missing>")
        ))),
    };

    match decoded {
        Ok((frame, resampled)) => Outcome::Success { frame, resampled },
        Err(err) => Outcome::Failure {
            message: err.to_string(),
            retryable: false,
        },
    }
}

fn decode_json(body: &[u8]) -> Result<(PredictionFrame, Option<PredictionFrame>), ClientError> {
    let payload: PredictionPayload = serde_json::from_slice(body)
        .map_err(|e| ClientError::protocol(format!("malformed JSON payload: {e}")))?;
    payload.data.validate()?;
    if let Some(resampled) = &payload.resampled {
        resampled.validate()?;
    }
    Ok((payload.data, payload.resampled))
}

/// Encode frames into the columnar binary framing.
pub fn encode_columnar(frame: &PredictionFrame, resampled: Option<&PredictionFrame>) -> Bytes {
    let mut buffer = BytesMut::new();
    buffer.put_slice(COLUMNAR_MAGIC);
    buffer.put_u8(COLUMNAR_VERSION);
    buffer.put_u8(if resampled.is_some() {
        FLAG_RESAMPLED
    } else {
        0
    });
    write_block(&mut buffer, frame);
    if let Some(resampled) = resampled {
        write_block(&mut buffer, resampled);
    }
    buffer.freeze()
}

fn write_block(buffer: &mut BytesMut, frame: &PredictionFrame) {
    buffer.put_u16(frame.columns().len() as u16);
    for column in frame.columns() {
        buffer.put_u16(column.len() as u16);
        buffer.put_slice(column.as_bytes());
    }
    buffer.put_u32(frame.len() as u32);
    for row in frame.rows() {
        buffer.put_i64(row.timestamp.timestamp_micros());
        for value in &row.values {
            buffer.put_f64(*value);
        }
    }
}

/// Decode the columnar binary framing.
pub fn decode_columnar(
    body: &[u8],
) -> Result<(PredictionFrame, Option<PredictionFrame>), ClientError> {
    let mut reader = ColumnarReader { buffer: body };

    let magic = reader.read_slice(4)?;
    if magic != COLUMNAR_MAGIC {
        return Err(ClientError::protocol("bad columnar magic"));
    }
    let version = reader.read_u8()?;
    if version != COLUMNAR_VERSION {
        return Err(ClientError::protocol(format!(
            "unsupported columnar version {version}"
        )));
    }
    let flags = reader.read_u8()?;

    let frame = reader.read_block()?;
    let resampled = if flags & FLAG_RESAMPLED != 0 {
        Some(reader.read_block()?)
    } else {
        None
    };

    if !reader.buffer.is_empty() {
        return Err(ClientError::protocol("trailing bytes in columnar payload"));
    }
    Ok((frame, resampled))
}

struct ColumnarReader<'a> {
    buffer: &'a [u8],
}

impl ColumnarReader<'_> {
    fn need(&self, len: usize) -> Result<(), ClientError> {
        if self.buffer.remaining() < len {
            return Err(ClientError::protocol("truncated columnar payload"));
        }
        Ok(())
    }

    fn read_slice(&mut self, len: usize) -> Result<&[u8], ClientError> {
        self.need(len)?;
        let (head, tail) = self.buffer.split_at(len);
        self.buffer = tail;
        Ok(head)
    }

    fn read_u8(&mut self) -> Result<u8, ClientError> {
        self.need(1)?;
        Ok(self.buffer.get_u8())
    }

    fn read_u16(&mut self) -> Result<u16, ClientError> {
        self.need(2)?;
        Ok(self.buffer.get_u16())
    }

    fn read_u32(&mut self) -> Result<u32, ClientError> {
        self.need(4)?;
        Ok(self.buffer.get_u32())
    }

    fn read_i64(&mut self) -> Result<i64, ClientError> {
        self.need(8)?;
        Ok(self.buffer.get_i64())
    }

    fn read_f64(&mut self) -> Result<f64, ClientError> {
        self.need(8)?;
        Ok(self.buffer.get_f64())
    }

    fn read_string(&mut self) -> Result<String, ClientError> {
        let len = self.read_u16()? as usize;
        let raw = self.read_slice(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ClientError::protocol("column name is not valid UTF-8"))
    }

    fn read_block(&mut self) -> Result<PredictionFrame, ClientError> {
        let column_count = self.read_u16()? as usize;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            columns.push(self.read_string()?);
        }

        let row_count = self.read_u32()? as usize;
        // Bound the allocation by what the buffer can actually hold.
        let row_size = 8 + column_count * 8;
        let expected = row_count
            .checked_mul(row_size)
            .ok_or_else(|| ClientError::protocol("row count overflows payload size"))?;
        self.need(expected)?;

        let mut frame = PredictionFrame::new(columns);
        for _ in 0..row_count {
            let micros = self.read_i64()?;
            let timestamp = DateTime::from_timestamp_micros(micros)
                .ok_or_else(|| ClientError::protocol("timestamp out of range"))?;
            let mut values = Vec::with_capacity(column_count);
            for _ in 0..column_count {
                values.push(self.read_f64()?);
            }
            frame.push_row(FrameRow { timestamp, values })?;
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn window() -> TimeWindow {
        TimeWindow {
            start: ts("2020-01-01T00:00:00Z"),
            end: ts("2020-01-01T01:00:00Z"),
        }
    }

    fn options() -> CodecOptions {
        CodecOptions {
            format: ResponseFormat::Json,
            revision: "1612345948247".to_string(),
            all_columns: false,
            data_provider: None,
        }
    }

    fn sample_frame() -> PredictionFrame {
        PredictionFrame::with_rows(
            vec!["model-output".into(), "anomaly-score".into()],
            vec![
                FrameRow {
                    timestamp: ts("2020-01-01T00:00:00Z"),
                    values: vec![0.5, 1.25],
                },
                FrameRow {
                    timestamp: ts("2020-01-01T00:10:00Z"),
                    values: vec![0.75, -2.0],
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn encode_carries_format_revision_and_window() {
        let machine = Machine::new("compressor-a", "plant-7");
        let request = encode_request(&machine, &window(), &options());

        assert_eq!(request.path, "compressor-a/anomaly/prediction");
        assert!(request.query.contains(&("format".into(), "json".into())));
        assert!(
            request
                .query
                .contains(&("revision".into(), "1612345948247".into()))
        );
        assert!(!request.query.iter().any(|(k, _)| k == "all_columns"));
        assert_eq!(request.body["start"], "2020-01-01T00:00:00+00:00");
        assert_eq!(request.body["end"], "2020-01-01T01:00:00+00:00");
    }

    #[test]
    fn encode_includes_all_columns_and_provider_override() {
        let machine = Machine::new("compressor-a", "plant-7");
        let mut opts = options();
        opts.all_columns = true;
        opts.data_provider = Some(json!({ "type": "random", "min_size": 10 }));
        let request = encode_request(&machine, &window(), &opts);

        assert!(request.query.contains(&("all_columns".into(), "true".into())));
        assert_eq!(request.body["data_provider"]["type"], "random");
    }

    #[test]
    fn gone_is_a_non_retryable_failure() {
        let outcome = decode_response(StatusCode::GONE, Some(CONTENT_TYPE_JSON), b"");
        match outcome {
            Outcome::Failure { retryable, message } => {
                assert!(!retryable);
                assert!(message.contains("410"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn server_errors_are_retryable() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
        ] {
            let outcome = decode_response(status, None, b"");
            assert!(
                matches!(outcome, Outcome::Failure { retryable: true, .. }),
                "{status} should be retryable"
            );
        }
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let outcome = decode_response(StatusCode::UNPROCESSABLE_ENTITY, None, b"");
        assert!(matches!(
            outcome,
            Outcome::Failure {
                retryable: false,
                ..
            }
        ));
    }

    #[test]
    fn unexpected_content_type_is_a_protocol_failure() {
        let outcome = decode_response(StatusCode::OK, Some("text/html"), b"<html></html>");
        match outcome {
            Outcome::Failure { retryable, message } => {
                assert!(!retryable);
                assert!(message.contains("content type"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_a_protocol_failure() {
        let outcome = decode_response(StatusCode::OK, Some(CONTENT_TYPE_JSON), b"{not json");
        assert!(matches!(
            outcome,
            Outcome::Failure {
                retryable: false,
                ..
            }
        ));
    }

    #[test]
    fn json_payload_decodes_with_resampled_block() {
        let body = serde_json::to_vec(&json!({
            "data": {
                "columns": ["model-output"],
                "rows": [
                    { "timestamp": "2020-01-01T00:00:00Z", "values": [1.0] }
                ]
            },
            "resampled": {
                "columns": ["sensor-1"],
                "rows": [
                    { "timestamp": "2020-01-01T00:00:00Z", "values": [9.5] }
                ]
            }
        }))
        .unwrap();

        let outcome = decode_response(StatusCode::OK, Some(CONTENT_TYPE_JSON), &body);
        match outcome {
            Outcome::Success { frame, resampled } => {
                assert_eq!(frame.len(), 1);
                assert_eq!(frame.columns(), ["model-output"]);
                assert_eq!(resampled.unwrap().columns(), ["sensor-1"]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn columnar_payload_round_trips() {
        let frame = sample_frame();
        let resampled = PredictionFrame::with_rows(
            vec!["sensor-1".into()],
            vec![FrameRow {
                timestamp: ts("2020-01-01T00:00:00Z"),
                values: vec![3.5],
            }],
        )
        .unwrap();

        let encoded = encode_columnar(&frame, Some(&resampled));
        let outcome = decode_response(StatusCode::OK, Some(CONTENT_TYPE_COLUMNAR), &encoded);
        match outcome {
            Outcome::Success {
                frame: decoded,
                resampled: decoded_resampled,
            } => {
                assert_eq!(decoded, frame);
                assert_eq!(decoded_resampled.unwrap(), resampled);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn truncated_columnar_payload_is_a_protocol_failure() {
        let encoded = encode_columnar(&sample_frame(), None);
        let truncated = &encoded[..encoded.len() - 5];
        let result = decode_columnar(truncated);
        assert!(matches!(result, Err(ClientError::Protocol { .. })));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut encoded = BytesMut::from(&encode_columnar(&sample_frame(), None)[..]);
        encoded[0] = b'X';
        let result = decode_columnar(&encoded);
        assert!(matches!(result, Err(ClientError::Protocol { .. })));
    }
}
