pub mod mcp_client;

pub use mcp_client::{McpClient, McpError};

/// Filter used when `RUST_LOG` is not set.
const DEFAULT_LOG_FILTER: &str = "mcp_mux=info,warn";

/// Number of rotated log files kept next to `mcp-mux.log`.
const LOG_FILES_KEPT: u32 = 3;

/// Where log output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    /// `mcp-mux.log` in the platform data directory.
    File,
}

/// Return the platform-standard data directory for mcp-mux.
///
/// Falls back to `~/.mcp-mux/` only if the platform directory can't be resolved.
pub fn data_dir() -> std::path::PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-mux");
    }
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".mcp-mux")
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` overrides the default filter; `MCP_MUX_LOG_FORMAT=json` switches
/// to JSON lines. File output rotates previous logs and flushes every line.
pub fn init_tracing(target: LogTarget) -> std::io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("MCP_MUX_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    let log_path = match target {
        LogTarget::Stderr => {
            let builder = builder.with_writer(std::io::stderr);
            if json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
            .map_err(|e| std::io::Error::other(e.to_string()))?;
            None
        }
        LogTarget::File => {
            let log_dir = data_dir();
            std::fs::create_dir_all(&log_dir)?;
            let log_path = log_dir.join("mcp-mux.log");
            rotate_log_file(&log_path, LOG_FILES_KEPT);

            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?;

            let builder = builder
                .with_writer(FlushingWriter::new(log_file))
                .with_ansi(false);
            if json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
            .map_err(|e| std::io::Error::other(e.to_string()))?;
            Some(log_path)
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path,
        pid = std::process::id(),
        "=== mcp-mux starting ==="
    );

    Ok(())
}

fn rotated_path(base: &std::path::Path, generation: u32) -> std::path::PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{generation}"));
    std::path::PathBuf::from(name)
}

/// Shift `mcp-mux.log` to `.1`, `.1` to `.2`, and so on, keeping `keep`
/// generations. Gaps in the chain are fine.
fn rotate_log_file(base_path: &std::path::Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(base_path);
        return;
    }
    let _ = std::fs::remove_file(rotated_path(base_path, keep));
    for generation in (1..keep).rev() {
        let _ = std::fs::rename(
            rotated_path(base_path, generation),
            rotated_path(base_path, generation + 1),
        );
    }
    let _ = std::fs::rename(base_path, rotated_path(base_path, 1));
}

/// Log sink that flushes each event, so a killed process loses nothing.
#[derive(Clone)]
struct FlushingWriter(std::sync::Arc<std::sync::Mutex<std::fs::File>>);

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self(std::sync::Arc::new(std::sync::Mutex::new(file)))
    }

    fn with_file<T>(
        &self,
        f: impl FnOnce(&mut std::fs::File) -> std::io::Result<T>,
    ) -> std::io::Result<T> {
        let mut file = self
            .0
            .lock()
            .map_err(|_| std::io::Error::other("log file lock poisoned"))?;
        f(&mut *file)
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.with_file(|file| {
            let n = std::io::Write::write(&mut *file, buf)?;
            std::io::Write::flush(&mut *file)?;
            Ok(n)
        })
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.with_file(|file| std::io::Write::flush(file))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rotate_log_file_shifts_and_drops_oldest() {
        let tmp = tempfile::TempDir::new().unwrap();
        let base = tmp.path().join("mcp-mux.log");
        std::fs::write(&base, "current").unwrap();
        std::fs::write(tmp.path().join("mcp-mux.log.1"), "one").unwrap();
        std::fs::write(tmp.path().join("mcp-mux.log.2"), "two").unwrap();

        rotate_log_file(&base, 2);

        assert!(!base.exists());
        let read = |name: &str| std::fs::read_to_string(tmp.path().join(name)).unwrap();
        assert_eq!(read("mcp-mux.log.1"), "current");
        assert_eq!(read("mcp-mux.log.2"), "one");
    }

    #[test]
    fn test_rotate_log_file_with_gaps() {
        let tmp = tempfile::TempDir::new().unwrap();
        let base = tmp.path().join("mcp-mux.log");
        std::fs::write(&base, "current").unwrap();

        rotate_log_file(&base, 3);
        rotate_log_file(&base, 3);

        // Nothing new was written in between, so `.1` is a gap after the second pass.
        assert!(!base.exists());
        assert!(!tmp.path().join("mcp-mux.log.1").exists());
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("mcp-mux.log.2")).unwrap(),
            "current"
        );
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();

        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line one\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }
}
