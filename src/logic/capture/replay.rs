//! Replay Sources
//!
//! Two `PacketSource` implementations that need no capture privileges:
//! a JSONL file replay (one `PacketRecord` per line, the same format the
//! export surface writes) and an in-memory source for tests and demos.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use super::{CaptureError, PacketRecord, PacketSource};

// ============================================================================
// JSONL REPLAY
// ============================================================================

pub struct JsonlReplaySource {
    path: PathBuf,
    reader: BufReader<File>,
    line_no: u64,
}

impl JsonlReplaySource {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        log::info!("Replaying packet records from {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            line_no: 0,
        })
    }
}

impl PacketSource for JsonlReplaySource {
    fn next_record(&mut self) -> Result<Option<PacketRecord>, CaptureError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return match serde_json::from_str::<PacketRecord>(trimmed) {
                Ok(rec) => Ok(Some(rec)),
                Err(e) => Err(CaptureError::Malformed {
                    reason: format!("line {}: {}", self.line_no, e),
                }),
            };
        }
    }

    fn describe(&self) -> String {
        format!("jsonl replay {:?}", self.path)
    }
}

// ============================================================================
// IN-MEMORY SOURCE
// ============================================================================

pub struct MemorySource {
    records: VecDeque<PacketRecord>,
}

impl MemorySource {
    pub fn new(records: Vec<PacketRecord>) -> Self {
        Self { records: records.into() }
    }
}

impl PacketSource for MemorySource {
    fn next_record(&mut self) -> Result<Option<PacketRecord>, CaptureError> {
        Ok(self.records.pop_front())
    }

    fn describe(&self) -> String {
        "in-memory source".to_string()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::capture::{Protocol, TcpFlags};
    use chrono::Utc;
    use std::io::Write;

    fn sample_record() -> PacketRecord {
        PacketRecord {
            ts: Utc::now(),
            src_ip: "192.168.1.10".parse().unwrap(),
            dst_ip: "192.168.1.1".parse().unwrap(),
            src_port: 55000,
            dst_port: 443,
            protocol: Protocol::Tcp,
            length: 120,
            tcp_flags: Some(TcpFlags::syn_only()),
            dns_query: None,
        }
    }

    #[test]
    fn test_memory_source_drains() {
        let mut src = MemorySource::new(vec![sample_record(), sample_record()]);
        assert!(src.next_record().unwrap().is_some());
        assert!(src.next_record().unwrap().is_some());
        assert!(src.next_record().unwrap().is_none());
    }

    #[test]
    fn test_jsonl_replay_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.jsonl");

        let mut file = File::create(&path).unwrap();
        writeln!(file, "{}", serde_json::to_string(&sample_record()).unwrap()).unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{}", serde_json::to_string(&sample_record()).unwrap()).unwrap();

        let mut src = JsonlReplaySource::open(&path).unwrap();
        assert!(src.next_record().unwrap().is_some());
        assert!(src.next_record().unwrap().is_some());
        assert!(src.next_record().unwrap().is_none());
    }

    #[test]
    fn test_jsonl_replay_malformed_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "not json\n").unwrap();

        let mut src = JsonlReplaySource::open(&path).unwrap();
        assert!(matches!(
            src.next_record(),
            Err(CaptureError::Malformed { .. })
        ));
    }
}
