//! 脚本输出捕获
//!
//! 子进程的 stdout/stderr 按行同时写入日志文件、内存尾部缓冲和 tracing 事件。
//! `TeeWriter` 拥有全部输出目标, 在 `close` 或析构时刷新且只刷新一次。

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{info, warn};

/// 输出流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// 组合写入器: 每次写入都分发到所有目标
pub struct TeeWriter {
    sinks: Vec<Box<dyn Write + Send>>,
    closed: bool,
}

impl TeeWriter {
    pub fn new(sinks: Vec<Box<dyn Write + Send>>) -> Self {
        Self {
            sinks,
            closed: false,
        }
    }

    /// 刷新并关闭所有目标, 重复调用无副作用
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.flush() {
                first_error.get_or_insert(e);
            }
        }
        self.sinks.clear();
        first_error.map_or(Ok(()), Err)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "输出已关闭"));
        }
        // 一个目标失败不影响其他目标
        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.write_all(buf) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

impl Drop for TeeWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("关闭输出捕获失败: {}", e);
        }
    }
}

/// 有界内存缓冲, 保留最近写入的字节
#[derive(Clone)]
pub struct TailBuffer {
    inner: Arc<Mutex<VecDeque<u8>>>,
    capacity: usize,
}

impl TailBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(8192)))),
            capacity,
        }
    }

    pub fn contents(&self) -> String {
        let buffer = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let bytes: Vec<u8> = buffer.iter().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// 最后一个非空行
    pub fn last_line(&self) -> Option<String> {
        self.contents()
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
    }
}

impl Write for TailBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut buffer = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        buffer.extend(buf.iter().copied());
        while buffer.len() > self.capacity {
            buffer.pop_front();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 把脚本输出转发为 tracing 事件
pub struct TracingSink {
    kind: StreamKind,
    run: String,
    pending: Vec<u8>,
}

impl TracingSink {
    pub fn new(kind: StreamKind, run: impl Into<String>) -> Self {
        Self {
            kind,
            run: run.into(),
            pending: Vec::new(),
        }
    }

    fn emit(&self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end();
        match self.kind {
            StreamKind::Stdout => info!(target: "autoreduce::script", run = %self.run, "{}", text),
            StreamKind::Stderr => warn!(target: "autoreduce::script", run = %self.run, "{}", text),
        }
    }
}

impl Write for TracingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit(&line);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit(&line);
        }
        Ok(())
    }
}

/// 一个流的捕获目标: 日志文件 + 尾部缓冲 + tracing
pub fn open_stream_capture(
    log_file: &Path,
    kind: StreamKind,
    run: &str,
    tail_capacity: usize,
) -> io::Result<(TeeWriter, TailBuffer)> {
    let file = File::create(log_file)?;
    let tail = TailBuffer::new(tail_capacity);
    let tee = TeeWriter::new(vec![
        Box::new(BufWriter::new(file)),
        Box::new(tail.clone()),
        Box::new(TracingSink::new(kind, run)),
    ]);
    Ok((tee, tail))
}

/// 逐行读取直到EOF, 完成后关闭写入器
pub async fn pump_lines<R>(reader: R, mut tee: TeeWriter) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line).await?;
        if read == 0 {
            break;
        }
        tee.write_all(&line)?;
    }
    tee.close()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedSink {
        data: Arc<Mutex<Vec<u8>>>,
        flushes: Arc<Mutex<usize>>,
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            *self.flushes.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn test_tee_writes_to_every_sink() {
        let a = SharedSink::default();
        let b = SharedSink::default();
        let mut tee = TeeWriter::new(vec![Box::new(a.clone()), Box::new(b.clone())]);

        tee.write_all(b"hello\n").unwrap();
        tee.close().unwrap();

        assert_eq!(&*a.data.lock().unwrap(), b"hello\n");
        assert_eq!(&*b.data.lock().unwrap(), b"hello\n");
    }

    #[test]
    fn test_close_happens_exactly_once() {
        let sink = SharedSink::default();
        {
            let mut tee = TeeWriter::new(vec![Box::new(sink.clone())]);
            tee.close().unwrap();
            tee.close().unwrap();
            assert!(tee.is_closed());
            assert!(tee.write(b"late").is_err());
        }
        assert_eq!(*sink.flushes.lock().unwrap(), 1);
    }

    #[test]
    fn test_drop_closes_unclosed_writer() {
        let sink = SharedSink::default();
        {
            let mut tee = TeeWriter::new(vec![Box::new(sink.clone())]);
            tee.write_all(b"partial").unwrap();
        }
        assert_eq!(*sink.flushes.lock().unwrap(), 1);
    }

    #[test]
    fn test_tail_buffer_keeps_latest_bytes() {
        let mut tail = TailBuffer::new(8);
        tail.write_all(b"first line\nlast\n").unwrap();
        assert_eq!(tail.contents(), "ne\nlast\n");
        assert_eq!(tail.last_line().as_deref(), Some("last"));
    }

    #[tokio::test]
    async fn test_pump_lines_writes_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("out.log");
        let (tee, tail) = open_stream_capture(&log, StreamKind::Stdout, "run 1 v0", 1024).unwrap();

        let input: &[u8] = b"line one\nline two\nno newline";
        pump_lines(input, tee).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&log).unwrap(),
            "line one\nline two\nno newline"
        );
        assert_eq!(tail.last_line().as_deref(), Some("no newline"));
    }
}
