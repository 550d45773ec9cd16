use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use bytes::{Bytes, BytesMut};

use crate::core::error::TaskError;

/// 带缓冲的文件写入器，回应体写入文件时使用
pub struct BufferManager {
    buffer: Vec<u8>,
    buffer_size: usize,
    current_pos: usize,
    file_handle: File,
    total_written: u64,
}

impl BufferManager {
    /// 创建（并截断）目标文件
    pub fn create(file_path: &Path, buffer_size: usize) -> io::Result<Self> {
        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file_handle = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(file_path)?;

        Ok(Self {
            buffer: vec![0; buffer_size.max(1)],
            buffer_size: buffer_size.max(1),
            current_pos: 0,
            file_handle,
            total_written: 0,
        })
    }

    /// 将缓冲区内容刷入文件
    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.current_pos > 0 {
            self.file_handle.write_all(&self.buffer[..self.current_pos])?;
            self.total_written += self.current_pos as u64;
            self.current_pos = 0;
        }
        Ok(())
    }

    /// 已经落盘的字节数
    pub fn get_total_written(&self) -> u64 {
        self.total_written
    }
}

impl Write for BufferManager {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut bytes_written = 0;
        while bytes_written < data.len() {
            let space_left = self.buffer_size - self.current_pos;
            let to_copy = std::cmp::min(space_left, data.len() - bytes_written);

            self.buffer[self.current_pos..self.current_pos + to_copy]
                .copy_from_slice(&data[bytes_written..bytes_written + to_copy]);
            self.current_pos += to_copy;
            bytes_written += to_copy;

            if self.current_pos == self.buffer_size {
                self.flush_buffer()?;
            }
        }
        Ok(bytes_written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()?;
        self.file_handle.flush()
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        let _ = self.flush_buffer();
    }
}

/// 回应体的实际去向，在第一个数据块到达时创建
pub enum ResponseSink {
    Memory { buffer: BytesMut, limit: usize },
    Stream { writer: Box<dyn Write + Send>, written: u64 },
    /// 不可接受的回应：最多保留 `limit` 字节，超出部分直接丢弃，从不失败
    Capped { buffer: BytesMut, limit: usize },
}

impl ResponseSink {
    /// 追加数据；内存缓冲超过上限或输出流写入失败时返回错误
    pub fn append(&mut self, data: &[u8]) -> Result<(), TaskError> {
        match self {
            ResponseSink::Memory { buffer, limit } => {
                if buffer.len() + data.len() > *limit {
                    return Err(TaskError::ResponseTooLarge { limit: *limit });
                }
                buffer.extend_from_slice(data);
                Ok(())
            }
            ResponseSink::Stream { writer, written } => {
                writer
                    .write_all(data)
                    .map_err(|e| TaskError::OnOutputStream(e.to_string()))?;
                *written += data.len() as u64;
                Ok(())
            }
            ResponseSink::Capped { buffer, limit } => {
                let room = limit.saturating_sub(buffer.len());
                buffer.extend_from_slice(&data[..data.len().min(room)]);
                Ok(())
            }
        }
    }

    pub fn close(&mut self) -> Result<(), TaskError> {
        match self {
            ResponseSink::Memory { .. } | ResponseSink::Capped { .. } => Ok(()),
            ResponseSink::Stream { writer, .. } => {
                writer.flush().map_err(|e| TaskError::OnOutputStream(e.to_string()))
            }
        }
    }

    pub fn into_body(self) -> ResponseBody {
        match self {
            ResponseSink::Memory { buffer, .. } | ResponseSink::Capped { buffer, .. } => {
                ResponseBody::Memory(buffer.freeze())
            }
            ResponseSink::Stream { written, .. } => ResponseBody::Streamed { bytes_written: written },
        }
    }
}

/// 成功结束时回应体所在位置：内存与输出流二者只居其一
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Memory(Bytes),
    Streamed { bytes_written: u64 },
}

impl ResponseBody {
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            ResponseBody::Memory(bytes) => Some(bytes),
            ResponseBody::Streamed { .. } => None,
        }
    }
}
