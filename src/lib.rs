pub mod agent_core;
pub mod mcp_client;

use std::path::{Path, PathBuf};

/// Return the platform-standard data directory for the playground.
///
/// - macOS: `~/Library/Application Support/chatbot-playground/`
/// - Windows: `{FOLDERID_RoamingAppData}\chatbot-playground\`
/// - Linux: `$XDG_DATA_HOME/chatbot-playground/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.chatbot-playground/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("chatbot-playground");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatbot-playground")
}

/// Default path of the tool invocation database (creates the directory).
pub fn default_db_path() -> PathBuf {
    let dir = data_dir();
    if !dir.exists() {
        let _ = std::fs::create_dir_all(&dir);
    }
    dir.join("playground.db")
}

/// Initialize the tracing subscriber.
///
/// Logs go to stderr unless `log_file` is given. For a file:
/// 1. Rotates existing logs (`x.log` → `x.log.1` → .2 → .3, keeps last 3).
/// 2. Opens a fresh file with a line-flushing writer for crash resilience.
///
/// `RUST_LOG` overrides the default `playground_mcp=info,warn` filter.
pub fn init_tracing(log_file: Option<&Path>) -> std::io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("playground_mcp=info,warn"));

    let Some(log_path) = log_file else {
        fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .init();
        return Ok(());
    };

    if let Some(dir) = log_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    rotate_log_file(log_path, 3);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== playground-mcp starting ==="
    );
    Ok(())
}

/// Rotate log files: `x.log` → `x.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    // Shift: .{n-1} → .{n}
    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// `tracing-subscriber` buffers log output internally; this keeps each log
/// line on disk immediately.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
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

    #[test]
    fn test_rotate_log_file_keeps_chain() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("mcp.log");
        std::fs::write(&log, "current").unwrap();
        std::fs::write(dir.path().join("mcp.log.1"), "previous").unwrap();

        rotate_log_file(&log, 3);

        assert!(!log.exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("mcp.log.1")).unwrap(),
            "current"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("mcp.log.2")).unwrap(),
            "previous"
        );
    }

    #[test]
    fn test_data_dir_is_namespaced() {
        let dir = data_dir();
        assert!(dir.to_string_lossy().contains("chatbot-playground"));
    }
}
