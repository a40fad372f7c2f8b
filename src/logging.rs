use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use env_logger::{Builder, Target};
use log::LevelFilter;

/// Compile-time default verbosity, spelled as the numeric scheme the
/// configuration uses: 0 = trace .. 5 = critical.
pub const GLOBAL_LOG_LEVEL: i32 = 2;

const LOG_FILE_NAME: &str = "commlink_log.txt";
const LOG_FILE_MAX_BYTES: u64 = 5 * 1024 * 1024;
const LOG_FILE_KEEP: usize = 5;

fn level_filter(level: i32) -> LevelFilter {
    match level {
        i32::MIN..=0 => LevelFilter::Trace,
        1 => LevelFilter::Debug,
        2 => LevelFilter::Info,
        3 => LevelFilter::Warn,
        // `log` has no critical level; 5 collapses into error.
        _ => LevelFilter::Error,
    }
}

/// Installs the process logger: level-filtered, with timestamp, project
/// name, thread id and source location in every line. When `save_path`
/// names a creatable directory the sink is a size-rotating file
/// (5 MiB x 5 files), otherwise stderr. Idempotent; later calls keep the
/// first sink.
pub fn init(runtime_level: i32, save_path: &str) {
    // A runtime level below the compile-time default stays at the default.
    let level = runtime_level.max(GLOBAL_LOG_LEVEL);

    let mut builder = Builder::new();
    builder.filter_level(level_filter(level));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{}] [commlink] [{}] [{:?}] [{}:{}] {}",
            buf.timestamp_millis(),
            record.level(),
            std::thread::current().id(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        )
    });

    if save_path.is_empty() {
        builder.target(Target::Stderr);
    } else {
        match RotatingFileWriter::create(Path::new(save_path)) {
            Ok(writer) => {
                builder.target(Target::Pipe(Box::new(writer)));
            }
            Err(err) => {
                eprintln!("commlink: log path {save_path} is unusable ({err}), logging to stderr");
                builder.target(Target::Stderr);
            }
        }
    }

    // Another logger may already be installed by the host application.
    let _ = builder.try_init();
}

/// Appending file writer that rolls over at a size limit, keeping a fixed
/// number of numbered predecessors (`commlink_log.txt.1` is the newest).
struct RotatingFileWriter {
    path: PathBuf,
    file: File,
    written: u64,
}

impl RotatingFileWriter {
    fn create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(RotatingFileWriter {
            path,
            file,
            written,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let numbered = |n: usize| {
            let mut p = self.path.as_os_str().to_owned();
            p.push(format!(".{n}"));
            PathBuf::from(p)
        };
        let _ = fs::remove_file(numbered(LOG_FILE_KEEP));
        for n in (1..LOG_FILE_KEEP).rev() {
            let _ = fs::rename(numbered(n), numbered(n + 1));
        }
        fs::rename(&self.path, numbered(1))?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > LOG_FILE_MAX_BYTES {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod logging_test {
    use super::*;

    #[test]
    fn test_level_filter_mapping() {
        assert_eq!(level_filter(0), LevelFilter::Trace);
        assert_eq!(level_filter(1), LevelFilter::Debug);
        assert_eq!(level_filter(2), LevelFilter::Info);
        assert_eq!(level_filter(3), LevelFilter::Warn);
        assert_eq!(level_filter(4), LevelFilter::Error);
        assert_eq!(level_filter(5), LevelFilter::Error);
    }

    #[test]
    fn test_rotation_keeps_bounded_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RotatingFileWriter::create(dir.path()).unwrap();

        // Force several rollovers with oversized records.
        let record = vec![b'x'; 1024];
        let records_per_file = (LOG_FILE_MAX_BYTES / record.len() as u64) as usize;
        for _ in 0..(records_per_file * (LOG_FILE_KEEP + 2) + 1) {
            writer.write_all(&record).unwrap();
        }
        writer.flush().unwrap();

        let mut names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();

        assert!(names.contains(&LOG_FILE_NAME.to_owned()));
        assert!(names.len() <= LOG_FILE_KEEP + 1);
        assert!(names.contains(&format!("{LOG_FILE_NAME}.1")));
    }

    #[test]
    fn test_create_rejects_unwritable_path() {
        assert!(RotatingFileWriter::create(Path::new("/proc/definitely/not/writable")).is_err());
    }
}
