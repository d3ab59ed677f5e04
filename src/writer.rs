use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

/// Durable destination for captured sweep points.
pub trait SampleSink: Send + Sync {
    /// Store `samples` under `name`, returning where they went.
    fn store(&self, name: &str, samples: &[f64]) -> std::io::Result<PathBuf>;
}

/// CsvWriter writes one ASCII file per record: one decimal value per line,
/// every line newline-terminated.
#[derive(Debug, Clone)]
pub struct CsvWriter {
    dir: PathBuf,
}

impl CsvWriter {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_dir(&self) -> std::io::Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
            log::info!("Created output directory {}", self.dir.display());
        }
        Ok(())
    }
}

impl SampleSink for CsvWriter {
    fn store(&self, name: &str, samples: &[f64]) -> std::io::Result<PathBuf> {
        self.ensure_dir()?;
        let path = self.dir.join(format!("{name}.csv"));

        let file = File::create(&path)?;
        let mut out = BufWriter::new(file);
        for value in samples {
            writeln!(out, "{value}")?;
        }
        // flush the buffer, then make sure the data reached the disk
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        log::debug!("Wrote {} samples to {}", samples.len(), path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_value_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CsvWriter::new(dir.path().join("logs"));
        let path = writer.store("data_point_0", &[0.0, 1.5, -2.25]).unwrap();

        assert_eq!(path.file_name().unwrap(), "data_point_0.csv");
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "0\n1.5\n-2.25\n");
        let parsed: Vec<f64> = text.lines().map(|l| l.parse().unwrap()).collect();
        assert_eq!(parsed, vec![0.0, 1.5, -2.25]);
    }

    #[test]
    fn empty_record() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CsvWriter::new(dir.path());
        let path = writer.store("empty", &[]).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "");
    }

    #[test]
    fn unwritable_directory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();
        let writer = CsvWriter::new(blocker.join("sub"));
        assert!(writer.store("data_point_0", &[1.0]).is_err());
    }
}
