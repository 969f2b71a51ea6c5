// ============================================================
// Layer 6 - Metrics Logger
// ============================================================
// Append-only stream of named scalar events, one CSV row per
// event, tagged with a step or epoch index:
//
//   name,index,value
//   batch/training_loss,1,6.812394
//   epoch/training_loss,1,5.104022
//   epoch/validation_loss,1,5.287310
//
// Appending (never rewriting) means a resumed run continues the
// same file and the history of earlier epochs survives.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::PathBuf,
};

use anyhow::Result;

pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    /// Create a logger writing to `{dir}/metrics.csv`, emitting the
    /// header only when the file is new.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let csv_path = dir.join("metrics.csv");
        if !csv_path.exists() {
            let mut f = fs::File::create(&csv_path)?;
            writeln!(f, "name,index,value")?;
            tracing::debug!("created metrics CSV: '{}'", csv_path.display());
        }

        Ok(Self { csv_path })
    }

    /// Append one named scalar tagged with its step or epoch index.
    pub fn scalar(&self, name: &str, index: usize, value: f64) -> Result<()> {
        let mut f = OpenOptions::new().append(true).open(&self.csv_path)?;
        writeln!(f, "{name},{index},{value:.6}")?;
        Ok(())
    }

    pub fn csv_path(&self) -> &PathBuf {
        &self.csv_path
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_append_in_order() {
        let dir = std::env::temp_dir().join("captioner_metrics_test");
        let _ = std::fs::remove_dir_all(&dir);
        let logger = MetricsLogger::new(&dir).unwrap();

        logger.scalar("batch/training_loss", 1, 6.5).unwrap();
        logger.scalar("epoch/training_loss", 1, 5.25).unwrap();

        let text = std::fs::read_to_string(logger.csv_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "name,index,value");
        assert_eq!(lines[1], "batch/training_loss,1,6.500000");
        assert_eq!(lines[2], "epoch/training_loss,1,5.250000");
    }

    #[test]
    fn test_reopening_does_not_truncate() {
        let dir = std::env::temp_dir().join("captioner_metrics_reopen_test");
        let _ = std::fs::remove_dir_all(&dir);
        {
            let logger = MetricsLogger::new(&dir).unwrap();
            logger.scalar("epoch/training_loss", 1, 4.0).unwrap();
        }
        {
            let logger = MetricsLogger::new(&dir).unwrap();
            logger.scalar("epoch/training_loss", 2, 3.0).unwrap();
        }
        let text = std::fs::read_to_string(dir.join("metrics.csv")).unwrap();
        assert_eq!(text.lines().count(), 3);
    }
}
