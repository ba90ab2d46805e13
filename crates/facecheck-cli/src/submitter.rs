use facecheck_core::submit::{SubmissionRequest, SubmitError, Submitter};
use std::io::Write;

/// Writes each request body as one JSON line instead of sending it.
pub struct WriterSubmitter<W: Write> {
    out: W,
}

impl<W: Write> WriterSubmitter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Submitter for WriterSubmitter<W> {
    fn submit(&mut self, request: &SubmissionRequest) -> Result<String, SubmitError> {
        let body = request.to_json()?;
        writeln!(self.out, "{body}").map_err(|e| SubmitError::Transport(e.to_string()))?;
        self.out
            .flush()
            .map_err(|e| SubmitError::Transport(e.to_string()))?;
        Ok(format!("written {} bytes", body.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_one_json_line() {
        let request = SubmissionRequest {
            identifier: "S42".into(),
            embedding: vec![0.6, 0.8],
            liveness_flag: true,
            report_flag: false,
        };
        let mut sink = WriterSubmitter::new(Vec::new());
        let response = sink.submit(&request).unwrap();
        assert!(response.starts_with("written"));

        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(text.lines().count(), 1);
        let back: SubmissionRequest = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(back, request);
    }
}
