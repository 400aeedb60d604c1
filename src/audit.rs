//! CSV audit log for risk actions.
//!
//! Circuit-breaker triggers, order rejections, and backstop stop executions
//! are appended here so they stay retrievable independently of live state.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

pub struct AuditLog {
    file: File,
}

impl AuditLog {
    pub fn new(path: &Path) -> Result<Self> {
        let _ = OpenOptions::new().create(true).append(true).open(path)?;

        // Write the header once for a fresh file.
        let metadata = std::fs::metadata(path)?;
        if metadata.len() == 0 {
            let mut file = OpenOptions::new().write(true).open(path)?;
            writeln!(file, "timestamp,event_type,symbol,quantity,price,detail")?;
        }

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self { file })
    }

    pub fn log_breaker(&mut self, ts: DateTime<Utc>, kind: &str, detail: &str) {
        let _ = writeln!(
            self.file,
            "{},BREAKER_{},,,,{}",
            ts.format("%Y-%m-%d %H:%M:%S"),
            kind,
            detail
        );
        let _ = self.file.flush();
    }

    pub fn log_rejection(
        &mut self,
        ts: DateTime<Utc>,
        symbol: &str,
        quantity: f64,
        price: f64,
        reason: &str,
    ) {
        let _ = writeln!(
            self.file,
            "{},REJECTED,{},{:.8},{:.2},{}",
            ts.format("%Y-%m-%d %H:%M:%S"),
            symbol,
            quantity,
            price,
            reason
        );
        let _ = self.file.flush();
    }

    pub fn log_stop_execution(
        &mut self,
        ts: DateTime<Utc>,
        symbol: &str,
        quantity: f64,
        price: f64,
        pnl: f64,
    ) {
        let _ = writeln!(
            self.file,
            "{},STOP_EXECUTED,{},{:.8},{:.2},pnl={:.2}",
            ts.format("%Y-%m-%d %H:%M:%S"),
            symbol,
            quantity,
            price,
            pnl
        );
        let _ = self.file.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_written_once_and_rows_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.csv");

        {
            let mut log = AuditLog::new(&path).unwrap();
            log.log_rejection(Utc::now(), "BTCUSDT", 0.5, 35000.0, "insufficient cash");
        }
        {
            let mut log = AuditLog::new(&path).unwrap();
            log.log_breaker(Utc::now(), "EMERGENCY_HALT", "drawdown 0.16 >= 0.15");
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,"));
        assert!(lines[1].contains("REJECTED,BTCUSDT"));
        assert!(lines[2].contains("BREAKER_EMERGENCY_HALT"));
    }
}
