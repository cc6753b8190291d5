pub mod mcp_client;

use std::path::{Path, PathBuf};

pub use mcp_client::{
    ConnectionOptions, ConnectionState, McpClient, McpError, McpServersConfig, ServerConfig,
    ToolCallError, ToolInfo,
};

/// Return the platform-standard data directory for mcp-hub.
///
/// - macOS: `~/Library/Application Support/mcp-hub/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-hub\`
/// - Linux: `$XDG_DATA_HOME/mcp-hub/` (fallback `~/.local/share/mcp-hub/`)
///
/// Falls back to `~/.mcp-hub/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-hub");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-hub")
}

/// Initialize the tracing subscriber.
///
/// On each startup:
/// 1. Rotates existing logs (mcp-hub.log → mcp-hub.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh mcp-hub.log with a line-flushing writer for crash resilience.
/// 3. Falls back to stderr when the log file cannot be opened.
///
/// `RUST_LOG` overrides the default `mcp_hub=info,warn` filter. Returns the
/// log file path when logging goes to a file.
pub fn init_tracing(log_dir: Option<&Path>, json: bool) -> Option<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let log_dir = log_dir.map(Path::to_path_buf).unwrap_or_else(data_dir);
    let log_path = log_dir.join("mcp-hub.log");

    let log_file = std::fs::create_dir_all(&log_dir).and_then(|_| {
        rotate_log_file(&log_path, 3);
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
    });

    let (writer, log_path) = match log_file {
        Ok(file) => (BoxMakeWriter::new(FlushingWriter::new(file)), Some(log_path)),
        Err(e) => {
            eprintln!(
                "mcp-hub: cannot open {} ({e}); logging to stderr",
                log_path.display()
            );
            (BoxMakeWriter::new(std::io::stderr), None)
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcp_hub=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    // A second initialization (tests, embedding) keeps the first subscriber.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path,
        pid = std::process::id(),
        "=== mcp-hub starting ==="
    );

    log_path
}

/// Rotate log files: `mcp-hub.log` → `mcp-hub.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

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
/// Without explicit flushing, log entries may sit in OS buffers and be lost
/// when a crashing server takes the process down with it.
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
