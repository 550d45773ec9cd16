use chrono::Local; // 用于获取本地时间
use env_logger::{Builder, Target};
use log::LevelFilter;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// 默认日志文件
pub const DEFAULT_LOG_FILE: &str = "logs/app.log";
/// 日志文件超过该大小时在启动时轮转
pub const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// 启动时检查并执行日志轮转
fn rotate_if_needed(file_path: &Path, max_size: u64) -> io::Result<()> {
    let size = match fs::metadata(file_path) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(()),
    };
    if size > max_size {
        let backup_path = file_path.with_extension("log.backup");
        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        fs::rename(file_path, &backup_path)?;
    }
    Ok(())
}

/// 格式化单行日志
fn format_line(buf: &mut impl Write, level: log::Level, target: &str, args: &std::fmt::Arguments<'_>) -> io::Result<()> {
    writeln!(
        buf,
        "{} [{}] {} - {}",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        level,
        target,
        args
    )
}

/// 初始化全局日志；指定文件时追加写入该文件，否则写到标准错误
///
/// `RUST_LOG` 环境变量可以覆盖这里给出的级别。重复初始化会被忽略。
pub fn init_logger(level: LevelFilter, file_path: Option<&str>) -> io::Result<()> {
    let mut builder = Builder::new();
    builder
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| format_line(buf, record.level(), record.target(), record.args()));

    if let Some(file_path) = file_path {
        let path = Path::new(file_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        rotate_if_needed(path, MAX_LOG_SIZE)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    if builder.try_init().is_err() {
        log::debug!("日志系统已经初始化");
    }
    Ok(())
}
